//! Hooks around request handling.
//!
//! Four points are exposed:
//! - `getting_request`: a request arrived, before dispatch
//! - `sending_response`: a response is about to leave
//! - `getting_changes`: a part uploaded by the client was decoded
//! - `sending_changes`: a part is about to be sent to the client
//!
//! Each point accepts plain closures (`on_*`) and closures returning a
//! [`BoxFuture`] (`on_*_async`). Hooks run in registration order. They may
//! edit the [`HttpContext`] but only read the payload.

use futures::future::BoxFuture;
use tidesync_engine::protocol::{BatchPart, HttpStep};
use uuid::Uuid;

/// Per-request state shared with the hooks.
#[derive(Debug, Clone)]
pub struct HttpContext {
    /// HTTP method.
    pub method: String,
    /// Request path.
    pub path: String,
    /// Endpoint, once the path is recognized.
    pub step: Option<HttpStep>,
    /// Scope named by the request header.
    pub scope_name: Option<String>,
    /// Client scope id, once the body is decoded.
    pub client_scope_id: Option<Uuid>,
    /// Request headers.
    pub request_headers: Vec<(String, String)>,
    /// Headers added to the response.
    pub response_headers: Vec<(String, String)>,
    /// Response status.
    pub status: u16,
}

impl HttpContext {
    /// Creates the context of a POST to `path`.
    pub fn new(path: &str, request_headers: &[(String, String)]) -> Self {
        Self {
            method: "POST".to_string(),
            path: path.to_string(),
            step: HttpStep::from_path(path),
            scope_name: None,
            client_scope_id: None,
            request_headers: request_headers.to_vec(),
            response_headers: Vec::new(),
            status: 200,
        }
    }

    /// Looks up a request header, ignoring case.
    pub fn request_header(&self, name: &str) -> Option<&str> {
        self.request_headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Adds a response header.
    pub fn add_response_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.response_headers.push((name.into(), value.into()));
    }
}

/// Arguments of `getting_request` and `sending_response`.
pub struct MessageArgs<'a> {
    /// Request state.
    pub context: &'a mut HttpContext,
    body: &'a [u8],
}

impl<'a> MessageArgs<'a> {
    pub(crate) fn new(context: &'a mut HttpContext, body: &'a [u8]) -> Self {
        Self { context, body }
    }

    /// Raw body of the message.
    pub fn body(&self) -> &[u8] {
        self.body
    }
}

/// Arguments of `getting_changes` and `sending_changes`.
pub struct ChangesArgs<'a> {
    /// Request state.
    pub context: &'a mut HttpContext,
    part: &'a BatchPart,
    is_last_part: bool,
}

impl<'a> ChangesArgs<'a> {
    pub(crate) fn new(context: &'a mut HttpContext, part: &'a BatchPart, is_last_part: bool) -> Self {
        Self {
            context,
            part,
            is_last_part,
        }
    }

    /// The part crossing the wire.
    pub fn part(&self) -> &BatchPart {
        self.part
    }

    /// Whether this is the last part of the batch.
    pub fn is_last_part(&self) -> bool {
        self.is_last_part
    }
}

type SyncMessageHook = Box<dyn Fn(&mut MessageArgs<'_>) + Send + Sync>;
type AsyncMessageHook =
    Box<dyn for<'a, 'b> Fn(&'a mut MessageArgs<'b>) -> BoxFuture<'a, ()> + Send + Sync>;
type SyncChangesHook = Box<dyn Fn(&mut ChangesArgs<'_>) + Send + Sync>;
type AsyncChangesHook =
    Box<dyn for<'a, 'b> Fn(&'a mut ChangesArgs<'b>) -> BoxFuture<'a, ()> + Send + Sync>;

enum Hook<S, A> {
    Sync(S),
    Async(A),
}

type MessageHook = Hook<SyncMessageHook, AsyncMessageHook>;
type ChangesHook = Hook<SyncChangesHook, AsyncChangesHook>;

/// Registered hooks of a web server orchestrator.
#[derive(Default)]
pub struct Interceptors {
    getting_request: Vec<MessageHook>,
    sending_response: Vec<MessageHook>,
    getting_changes: Vec<ChangesHook>,
    sending_changes: Vec<ChangesHook>,
}

impl Interceptors {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` when a request arrives.
    pub fn on_getting_request<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&mut MessageArgs<'_>) + Send + Sync + 'static,
    {
        self.getting_request.push(Hook::Sync(Box::new(f)));
        self
    }

    /// Awaits `f` when a request arrives.
    pub fn on_getting_request_async<F>(&mut self, f: F) -> &mut Self
    where
        F: for<'a, 'b> Fn(&'a mut MessageArgs<'b>) -> BoxFuture<'a, ()> + Send + Sync + 'static,
    {
        self.getting_request.push(Hook::Async(Box::new(f)));
        self
    }

    /// Runs `f` before a response leaves.
    pub fn on_sending_response<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&mut MessageArgs<'_>) + Send + Sync + 'static,
    {
        self.sending_response.push(Hook::Sync(Box::new(f)));
        self
    }

    /// Awaits `f` before a response leaves.
    pub fn on_sending_response_async<F>(&mut self, f: F) -> &mut Self
    where
        F: for<'a, 'b> Fn(&'a mut MessageArgs<'b>) -> BoxFuture<'a, ()> + Send + Sync + 'static,
    {
        self.sending_response.push(Hook::Async(Box::new(f)));
        self
    }

    /// Runs `f` for every part uploaded by a client.
    pub fn on_getting_changes<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&mut ChangesArgs<'_>) + Send + Sync + 'static,
    {
        self.getting_changes.push(Hook::Sync(Box::new(f)));
        self
    }

    /// Awaits `f` for every part uploaded by a client.
    pub fn on_getting_changes_async<F>(&mut self, f: F) -> &mut Self
    where
        F: for<'a, 'b> Fn(&'a mut ChangesArgs<'b>) -> BoxFuture<'a, ()> + Send + Sync + 'static,
    {
        self.getting_changes.push(Hook::Async(Box::new(f)));
        self
    }

    /// Runs `f` for every part sent to a client.
    pub fn on_sending_changes<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&mut ChangesArgs<'_>) + Send + Sync + 'static,
    {
        self.sending_changes.push(Hook::Sync(Box::new(f)));
        self
    }

    /// Awaits `f` for every part sent to a client.
    pub fn on_sending_changes_async<F>(&mut self, f: F) -> &mut Self
    where
        F: for<'a, 'b> Fn(&'a mut ChangesArgs<'b>) -> BoxFuture<'a, ()> + Send + Sync + 'static,
    {
        self.sending_changes.push(Hook::Async(Box::new(f)));
        self
    }

    /// Returns true if no hook is registered.
    pub fn is_empty(&self) -> bool {
        self.getting_request.is_empty()
            && self.sending_response.is_empty()
            && self.getting_changes.is_empty()
            && self.sending_changes.is_empty()
    }

    pub(crate) async fn getting_request(&self, args: &mut MessageArgs<'_>) {
        run_message_hooks(&self.getting_request, args).await;
    }

    pub(crate) async fn sending_response(&self, args: &mut MessageArgs<'_>) {
        run_message_hooks(&self.sending_response, args).await;
    }

    pub(crate) async fn getting_changes(&self, args: &mut ChangesArgs<'_>) {
        run_changes_hooks(&self.getting_changes, args).await;
    }

    pub(crate) async fn sending_changes(&self, args: &mut ChangesArgs<'_>) {
        run_changes_hooks(&self.sending_changes, args).await;
    }
}

async fn run_message_hooks(hooks: &[MessageHook], args: &mut MessageArgs<'_>) {
    for hook in hooks {
        match hook {
            Hook::Sync(f) => f(args),
            Hook::Async(f) => f(args).await,
        }
    }
}

async fn run_changes_hooks(hooks: &[ChangesHook], args: &mut ChangesArgs<'_>) {
    for hook in hooks {
        match hook {
            Hook::Sync(f) => f(args),
            Hook::Async(f) => f(args).await,
        }
    }
}
