//! HTTP proxy of the server orchestrator.
//!
//! The HTTP client itself is abstracted via [`HttpClient`] so that any
//! library (reqwest, hyper, a test double) can carry the requests.

use super::{RemoteChanges, RemoteOrchestrator, RoundContext};
use crate::batch::{BatchInfo, BatchWriter};
use crate::config::SyncOptions;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tidesync_protocol::{
    ChangesResponse, ErrorResponse, HttpStep, MoreChangesRequest, MoreChangesResponse,
    ScopeRequest, ScopeResponse, SerializerKind, ServerScopeInfo, HEADER_PROTOCOL_VERSION,
    HEADER_SCOPE_NAME, HEADER_SERIALIZER, HEADER_TOKEN, PROTOCOL_VERSION,
};
use tracing::{debug, trace};

/// Raw HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Response headers.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// A 200 response.
    pub fn ok(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body,
        }
    }

    /// Looks up a header, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// HTTP client abstraction.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a POST request. `Err` means no response was received.
    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: Vec<u8>,
    ) -> std::result::Result<HttpResponse, String>;
}

/// Servers that can answer requests without a network.
#[async_trait]
pub trait LoopbackServer: Send + Sync {
    /// Handles a POST request.
    async fn handle(&self, path: &str, headers: &[(String, String)], body: Vec<u8>) -> HttpResponse;
}

/// An [`HttpClient`] routing requests straight to a [`LoopbackServer`].
pub struct LoopbackClient<S: LoopbackServer> {
    server: Arc<S>,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a client bound to `server`.
    pub fn new(server: Arc<S>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: Vec<u8>,
    ) -> std::result::Result<HttpResponse, String> {
        let path = url.find("/sync/").map(|i| &url[i..]).unwrap_or(url);
        Ok(self.server.handle(path, headers, body).await)
    }
}

/// [`RemoteOrchestrator`] talking to a web server orchestrator.
pub struct WebRemoteOrchestrator<C: HttpClient> {
    client: C,
    base_url: String,
    serializer: SerializerKind,
    headers: Vec<(String, String)>,
    options: SyncOptions,
}

impl<C: HttpClient> WebRemoteOrchestrator<C> {
    /// Creates a proxy for the server at `base_url`, using the serializer
    /// and batch settings of `options`.
    pub fn new(client: C, base_url: impl Into<String>, options: &SyncOptions) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            serializer: options.serializer,
            headers: Vec::new(),
            options: options.clone(),
        }
    }

    /// Adds a header sent with every request.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the authentication token.
    pub fn with_token(self, token: impl Into<String>) -> Self {
        self.with_header(HEADER_TOKEN, token)
    }

    /// The server base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send<Req, Resp>(&self, step: HttpStep, scope_name: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let body = self.serializer.serialize(request)?;
        let url = format!("{}{}", self.base_url, step.path());
        let mut headers = self.headers.clone();
        headers.push((HEADER_SERIALIZER.to_string(), self.serializer.name().to_string()));
        headers.push((HEADER_PROTOCOL_VERSION.to_string(), PROTOCOL_VERSION.to_string()));
        headers.push((HEADER_SCOPE_NAME.to_string(), scope_name.to_string()));

        trace!(url = %url, bytes = body.len(), "POST");
        let response = self
            .client
            .post(&url, &headers, body)
            .await
            .map_err(SyncError::transport_retryable)?;

        if response.status == 200 {
            return Ok(self.serializer.deserialize(&response.body)?);
        }

        let error: Option<ErrorResponse> = self
            .serializer
            .deserialize(&response.body)
            .or_else(|_| SerializerKind::Json.deserialize(&response.body))
            .ok();
        debug!(url = %url, status = response.status, error = ?error, "request failed");
        match (response.status, error) {
            (401, error) => Err(SyncError::NotAuthenticated(
                error.map(|e| e.message).unwrap_or_else(|| "unauthorized".to_string()),
            )),
            (status, Some(error)) => Err(SyncError::Remote {
                status,
                kind: Some(error.kind),
                message: error.message,
            }),
            (status, None) => Err(SyncError::Remote {
                status,
                kind: None,
                message: String::from_utf8_lossy(&response.body).into_owned(),
            }),
        }
    }
}

#[async_trait]
impl<C: HttpClient> RemoteOrchestrator for WebRemoteOrchestrator<C> {
    async fn ensure_scope(&self, request: ScopeRequest) -> Result<ServerScopeInfo> {
        let response: ScopeResponse = self
            .send(HttpStep::EnsureScope, &request.scope_name, &request)
            .await?;
        Ok(response.server_scope)
    }

    async fn apply_then_get_changes(
        &self,
        context: &RoundContext,
        batch: &BatchInfo,
    ) -> Result<RemoteChanges> {
        let scope_name = context.scope_name.as_str();
        let part_count = batch.part_count();

        let response: ChangesResponse = if part_count == 0 {
            self.send(HttpStep::SendChanges, scope_name, &context.changes_request(None, true))
                .await?
        } else {
            let mut last = None;
            for index in 0..part_count {
                let part = batch.load_part(index)?;
                let is_last = index + 1 == part_count;
                let request = context.changes_request(Some(part), is_last);
                let response: ChangesResponse =
                    self.send(HttpStep::SendChanges, scope_name, &request).await?;
                debug!(part = index, of = part_count, "part uploaded");
                if is_last {
                    last = Some(response);
                }
            }
            last.ok_or_else(|| SyncError::Protocol("upload ended without a response".into()))?
        };

        if !response.complete {
            return Err(SyncError::Protocol(
                "server acknowledged the last part without changes".into(),
            ));
        }

        let mut writer = BatchWriter::for_round(&self.options, context.client_scope_id);
        if let Some(part) = response.part {
            writer.add_part(part)?;
        }
        for index in 1..response.part_count {
            let request = MoreChangesRequest {
                scope_name: context.scope_name.clone(),
                client_scope_id: context.client_scope_id,
                part_index: index,
            };
            let more: MoreChangesResponse =
                self.send(HttpStep::GetMoreChanges, scope_name, &request).await?;
            writer.add_part(more.part)?;
            if more.is_last_part {
                break;
            }
        }

        Ok(RemoteChanges {
            server_timestamp: response.server_timestamp,
            batch: writer.finish_with_timestamp(Some(response.server_timestamp))?,
            applied_on_server: response.applied_on_server,
            resolved_conflicts_on_server: response.resolved_conflicts_on_server,
            failed_on_server: response.failed_on_server,
            is_snapshot: response.is_snapshot,
            shared_batch: false,
        })
    }
}
