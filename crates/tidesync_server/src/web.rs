//! HTTP endpoint of the server orchestrator.
//!
//! [`WebServerOrchestrator::handle_request`] is framework agnostic: any HTTP
//! stack can route the three sync endpoints to it. The same type implements
//! [`LoopbackServer`] for in-process clients.
//!
//! ## Sessions
//!
//! A round spans several requests. Uploaded parts are collected per client
//! scope id by a [`BatchWriter`], which spills them to the batch directory
//! past `batch_size` rows, until the last one arrives; then they are applied
//! at once. Downloads
//! larger than one part stay in the session until the client fetched the
//! last part. Idle sessions expire after [`ServerConfig::session_ttl`].

use crate::auth::{AuthConfig, TokenValidator};
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::interceptors::{ChangesArgs, HttpContext, Interceptors, MessageArgs};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;
use tidesync_engine::protocol::{
    ChangesRequest, ChangesResponse, HttpStep, MoreChangesRequest, MoreChangesResponse,
    ScopeRequest, ScopeResponse, SerializerKind, HEADER_PROTOCOL_VERSION, HEADER_SCOPE_NAME,
    HEADER_SERIALIZER, HEADER_TOKEN, PROTOCOL_VERSION,
};
use tidesync_engine::{
    BatchInfo, BatchWriter, HttpResponse, LoopbackServer, RemoteOrchestrator, RoundContext, ServerOrchestrator,
    SyncProvider,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Download held between requests.
struct PendingDownload {
    batch: BatchInfo,
    shared: bool,
}

impl PendingDownload {
    fn discard(self) {
        if !self.shared {
            self.batch.try_remove_directory();
        }
    }
}

struct ClientSession {
    scope_name: String,
    upload: Option<BatchWriter>,
    download: Option<PendingDownload>,
    touched: Instant,
}

impl ClientSession {
    fn new(scope_name: &str) -> Self {
        Self {
            scope_name: scope_name.to_string(),
            upload: None,
            download: None,
            touched: Instant::now(),
        }
    }

    fn discard(&mut self) {
        if let Some(upload) = self.upload.take() {
            upload.discard();
        }
        if let Some(download) = self.download.take() {
            download.discard();
        }
    }
}

/// Serves the sync endpoints for a [`ServerOrchestrator`].
pub struct WebServerOrchestrator<P: SyncProvider> {
    server: ServerOrchestrator<P>,
    config: ServerConfig,
    validator: Option<TokenValidator>,
    interceptors: Interceptors,
    sessions: Mutex<HashMap<Uuid, ClientSession>>,
}

impl<P: SyncProvider> WebServerOrchestrator<P> {
    /// Creates the endpoint.
    pub fn new(server: ServerOrchestrator<P>, config: ServerConfig) -> Self {
        let validator = config.auth_secret.clone().map(|secret| {
            TokenValidator::new(AuthConfig::new(secret).with_expiry(config.token_expiry))
        });
        Self {
            server,
            config,
            validator,
            interceptors: Interceptors::new(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Replaces the registered hooks.
    pub fn with_interceptors(mut self, interceptors: Interceptors) -> Self {
        self.interceptors = interceptors;
        self
    }

    /// Registered hooks.
    pub fn interceptors_mut(&mut self) -> &mut Interceptors {
        &mut self.interceptors
    }

    /// The wrapped orchestrator.
    pub fn server(&self) -> &ServerOrchestrator<P> {
        &self.server
    }

    /// The configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Token issuer, when authentication is configured.
    pub fn token_validator(&self) -> Option<&TokenValidator> {
        self.validator.as_ref()
    }

    /// Number of open client sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Handles a POST to one of the sync endpoints.
    pub async fn handle_request(
        &self,
        path: &str,
        headers: &[(String, String)],
        body: &[u8],
    ) -> HttpResponse {
        self.expire_sessions();

        let mut context = HttpContext::new(path, headers);
        context.scope_name = context.request_header(HEADER_SCOPE_NAME).map(str::to_string);
        self.interceptors
            .getting_request(&mut MessageArgs::new(&mut context, body))
            .await;

        let serializer = negotiate_serializer(&context);
        let result = match &serializer {
            Ok(serializer) => self.dispatch(&mut context, *serializer, body).await,
            Err(err) => Err(ServerError::UnknownSerializer(err.clone())),
        };

        let body = match result {
            Ok(body) => body,
            Err(err) => {
                if err.is_client_error() {
                    debug!(path = %path, error = %err, "request rejected");
                } else {
                    warn!(path = %path, error = %err, "request failed");
                }
                context.status = err.status();
                serializer
                    .unwrap_or_default()
                    .serialize(&err.to_response())
                    .unwrap_or_default()
            }
        };

        self.interceptors
            .sending_response(&mut MessageArgs::new(&mut context, &body))
            .await;

        HttpResponse {
            status: context.status,
            headers: context.response_headers,
            body,
        }
    }

    async fn dispatch(
        &self,
        context: &mut HttpContext,
        serializer: SerializerKind,
        body: &[u8],
    ) -> ServerResult<Vec<u8>> {
        let step = context
            .step
            .ok_or_else(|| ServerError::InvalidRequest(format!("unknown path {}", context.path)))?;
        check_version(context)?;
        self.authenticate(context)?;

        match step {
            HttpStep::EnsureScope => {
                let request: ScopeRequest = serializer.deserialize(body)?;
                context.client_scope_id = Some(request.client_scope_id);
                info!(scope = %request.scope_name, client = %request.client_scope_id, "ensure scope");
                let server_scope = self.server.ensure_scope(request).await?;
                Ok(serializer.serialize(&ScopeResponse { server_scope })?)
            }
            HttpStep::SendChanges => {
                let request: ChangesRequest = serializer.deserialize(body)?;
                let response = self.send_changes(context, request).await?;
                Ok(serializer.serialize(&response)?)
            }
            HttpStep::GetMoreChanges => {
                let request: MoreChangesRequest = serializer.deserialize(body)?;
                let response = self.more_changes(context, request).await?;
                Ok(serializer.serialize(&response)?)
            }
        }
    }

    fn authenticate(&self, context: &HttpContext) -> ServerResult<()> {
        if !self.config.require_auth {
            return Ok(());
        }
        let validator = self
            .validator
            .as_ref()
            .ok_or_else(|| ServerError::NotAuthenticated("no auth secret configured".into()))?;
        let token = context
            .request_header(HEADER_TOKEN)
            .ok_or_else(|| ServerError::NotAuthenticated("missing token".into()))?;
        let subject = validator.validate_token(token)?;
        debug!(subject = %subject, "token accepted");
        Ok(())
    }

    async fn send_changes(
        &self,
        context: &mut HttpContext,
        mut request: ChangesRequest,
    ) -> ServerResult<ChangesResponse> {
        let client_id = request.client_scope_id;
        context.client_scope_id = Some(client_id);

        if let Some(part) = &request.part {
            if part.rows.len() > self.config.max_part_rows {
                return Err(ServerError::InvalidRequest(format!(
                    "part of {} rows exceeds the limit of {}",
                    part.rows.len(),
                    self.config.max_part_rows
                )));
            }
            self.interceptors
                .getting_changes(&mut ChangesArgs::new(context, part, request.is_last_part))
                .await;
        }

        let round = RoundContext::from_request(&request);
        let starts_round = request.part.as_ref().map_or(true, |part| part.index == 0);
        let part = request.part.take();

        let options = self.server.base().options();
        let uploaded = {
            let mut sessions = self.sessions.lock();
            let session = sessions
                .entry(client_id)
                .or_insert_with(|| ClientSession::new(&request.scope_name));
            session.touched = Instant::now();
            if starts_round {
                session.discard();
            }
            if let Some(part) = part {
                let writer = session
                    .upload
                    .get_or_insert_with(|| BatchWriter::for_round(options, client_id));
                writer.add_part(part)?;
            }
            if !request.is_last_part {
                let rows = session.upload.as_ref().map_or(0, BatchWriter::total_rows);
                debug!(client = %client_id, rows, "part buffered");
                return Ok(ChangesResponse::ack());
            }
            session.upload.take()
        };

        let batch = match uploaded {
            Some(writer) => writer.finish()?,
            None => BatchInfo::empty(),
        };
        let changes = self.server.apply_then_get_changes(&round, &batch).await;
        batch.try_remove_directory();
        let changes = changes?;
        let part_count = changes.batch.part_count();
        let first = if part_count > 0 {
            Some(changes.batch.load_part(0)?)
        } else {
            None
        };
        if let Some(part) = &first {
            self.interceptors
                .sending_changes(&mut ChangesArgs::new(context, part, part_count == 1))
                .await;
        }

        let pending = PendingDownload {
            batch: changes.batch,
            shared: changes.shared_batch,
        };
        {
            let mut sessions = self.sessions.lock();
            if part_count > 1 {
                let session = sessions
                    .entry(client_id)
                    .or_insert_with(|| ClientSession::new(&round.scope_name));
                session.touched = Instant::now();
                session.download = Some(pending);
            } else {
                sessions.remove(&client_id);
                pending.discard();
            }
        }

        info!(
            scope = %round.scope_name,
            client = %client_id,
            applied = changes.applied_on_server,
            parts = part_count,
            snapshot = changes.is_snapshot,
            "changes exchanged"
        );
        Ok(ChangesResponse {
            complete: true,
            server_timestamp: changes.server_timestamp,
            part: first,
            part_count,
            applied_on_server: changes.applied_on_server,
            resolved_conflicts_on_server: changes.resolved_conflicts_on_server,
            failed_on_server: changes.failed_on_server,
            is_snapshot: changes.is_snapshot,
        })
    }

    async fn more_changes(
        &self,
        context: &mut HttpContext,
        request: MoreChangesRequest,
    ) -> ServerResult<MoreChangesResponse> {
        let client_id = request.client_scope_id;
        context.client_scope_id = Some(client_id);

        let batch = {
            let mut sessions = self.sessions.lock();
            let session = sessions
                .get_mut(&client_id)
                .ok_or(ServerError::SessionNotFound(client_id))?;
            session.touched = Instant::now();
            let download = session
                .download
                .as_ref()
                .ok_or(ServerError::SessionNotFound(client_id))?;
            download.batch.clone()
        };

        let part_count = batch.part_count();
        if request.part_index >= part_count {
            return Err(ServerError::InvalidRequest(format!(
                "part {} requested, batch has {part_count}",
                request.part_index
            )));
        }
        let part = batch.load_part(request.part_index)?;
        let is_last_part = request.part_index + 1 == part_count;
        self.interceptors
            .sending_changes(&mut ChangesArgs::new(context, &part, is_last_part))
            .await;

        if is_last_part {
            let session = self.sessions.lock().remove(&client_id);
            if let Some(download) = session.and_then(|s| s.download) {
                download.discard();
            }
            debug!(client = %client_id, "download completed");
        }

        Ok(MoreChangesResponse { part, is_last_part })
    }

    fn expire_sessions(&self) {
        let ttl = self.config.session_ttl;
        let mut sessions = self.sessions.lock();
        let expired: Vec<Uuid> = sessions
            .iter()
            .filter(|(_, session)| session.touched.elapsed() > ttl)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(mut session) = sessions.remove(&id) {
                debug!(client = %id, scope = %session.scope_name, "session expired");
                session.discard();
            }
        }
    }
}

fn negotiate_serializer(context: &HttpContext) -> Result<SerializerKind, String> {
    match context.request_header(HEADER_SERIALIZER) {
        None => Ok(SerializerKind::default()),
        Some(name) => SerializerKind::from_name(name).ok_or_else(|| name.to_string()),
    }
}

fn check_version(context: &HttpContext) -> ServerResult<()> {
    let header = context
        .request_header(HEADER_PROTOCOL_VERSION)
        .ok_or_else(|| ServerError::ProtocolMismatch("missing version header".into()))?;
    match header.trim().parse::<u16>() {
        Ok(PROTOCOL_VERSION) => Ok(()),
        _ => Err(ServerError::ProtocolMismatch(format!(
            "client speaks {header}, server speaks {PROTOCOL_VERSION}"
        ))),
    }
}

#[async_trait]
impl<P: SyncProvider> LoopbackServer for WebServerOrchestrator<P> {
    async fn handle(&self, path: &str, headers: &[(String, String)], body: Vec<u8>) -> HttpResponse {
        self.handle_request(path, headers, &body).await
    }
}
