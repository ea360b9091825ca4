//! Multiplexes many concurrent calls over one physical connection.
//!
//! A single receive loop reads every response and hands it to the matching
//! pending call. Two locks guard the shared state: the connection lock (idle
//! timer and shutdown) and the call lock (call table, receive task, admission
//! gate). The connection lock is always taken first, and nothing is awaited
//! while the call lock is held.

use crate::call::{CallCompletion, CallInfo, CallStageCell, PreparedCall, SendState, StoreResponse};
use crate::config::ConnectionConfig;
use crate::connection::{replica_path, Connection};
use crate::error::{ClientError, NegotiationError, TransportError, TransportErrorCode};
use crate::listener::{ConnectionEvent, ConnectionStateListener};
use crate::port_pool::UserPortPool;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rntbd_protocol::status::error_message;
use rntbd_protocol::{
    ContextRequest, ContextResponse, ProtocolError, RequestFrame, RequestToken, ResponseFrame,
    ResponseToken, ServerErrorKind, Token, TokenValue,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// What the server reported during negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerProperties {
    pub agent: String,
    pub version: String,
    pub idle_timeout: Option<Duration>,
}

/// One-shot cancellation shared by the receive loop and the idle timer.
#[derive(Debug, Default)]
struct Cancellation {
    cancelled: AtomicBool,
    notify: Notify,
}

impl Cancellation {
    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// State under the call lock.
struct CallTable {
    calls: HashMap<u32, Arc<CallInfo>>,
    receive_task: Option<JoinHandle<()>>,
    /// Once false, never true again.
    calls_allowed: bool,
}

/// State under the connection lock.
#[derive(Default)]
struct ConnectionState {
    idle_timer: Option<JoinHandle<()>>,
}

struct DispatcherInner {
    correlation_id: Uuid,
    connection: Connection,
    port_pool: Option<Arc<dyn UserPortPool>>,
    listener: Option<Arc<dyn ConnectionStateListener>>,
    next_request_id: AtomicU32,
    connection_lock: tokio::sync::Mutex<ConnectionState>,
    call_lock: Mutex<CallTable>,
    cancellation: Cancellation,
    server_properties: RwLock<Option<ServerProperties>>,
    opened: AtomicBool,
    disposed: AtomicBool,
}

/// Turns one connection into a channel for many concurrent requests.
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new(
        target: &str,
        config: ConnectionConfig,
        port_pool: Option<Arc<dyn UserPortPool>>,
        listener: Option<Arc<dyn ConnectionStateListener>>,
    ) -> Result<Self, ClientError> {
        let connection = Connection::new(target, config)?;
        Ok(Self {
            inner: Arc::new(DispatcherInner {
                correlation_id: Uuid::new_v4(),
                connection,
                port_pool,
                listener,
                next_request_id: AtomicU32::new(0),
                connection_lock: tokio::sync::Mutex::new(ConnectionState::default()),
                call_lock: Mutex::new(CallTable {
                    calls: HashMap::new(),
                    receive_task: None,
                    calls_allowed: true,
                }),
                cancellation: Cancellation::default(),
                server_properties: RwLock::new(None),
                opened: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
            }),
        })
    }

    pub fn correlation_id(&self) -> Uuid {
        self.inner.correlation_id
    }

    pub fn target(&self) -> &str {
        self.inner.connection.target()
    }

    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    pub fn server_properties(&self) -> Option<ServerProperties> {
        self.inner.server_properties.read().clone()
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.call_lock.lock().calls.len()
    }

    pub fn calls_allowed(&self) -> bool {
        self.inner.call_lock.lock().calls_allowed
    }

    /// Whether the receive loop was started (and has not been reaped by shutdown).
    pub fn is_receiving(&self) -> bool {
        self.inner.call_lock.lock().receive_task.is_some()
    }

    /// Connects, negotiates, and starts the receive loop and idle timer.
    ///
    /// On failure no call is ever admitted.
    pub async fn open(&self, activity_id: Uuid) -> Result<(), ClientError> {
        let inner = &self.inner;
        inner.ensure_not_disposed()?;
        if inner.opened.swap(true, Ordering::AcqRel) {
            return Err(ClientError::InvalidOperation("dispatcher opened twice"));
        }
        tracing::debug!(
            "opening dispatcher {} to {}",
            inner.correlation_id,
            self.target()
        );

        if let Err(err) = inner.connect_and_negotiate(activity_id).await {
            inner.disallow_initial_calls();
            tracing::warn!(
                "dispatcher {} failed to open {}: {}",
                inner.correlation_id,
                self.target(),
                err
            );
            return Err(err);
        }

        {
            let mut table = inner.call_lock.lock();
            table.receive_task = Some(tokio::spawn(inner.clone().receive_loop()));
        }
        inner.start_idle_timer().await;
        tracing::debug!("dispatcher {} open on {}", inner.correlation_id, inner.name());
        Ok(())
    }

    /// Assigns a request id and serializes `request` for `target`.
    pub fn prepare_call(
        &self,
        mut request: RequestFrame,
        target: &str,
        activity_id: Uuid,
    ) -> Result<PreparedCall, ClientError> {
        self.inner.ensure_not_disposed()?;
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);

        request.activity_id = activity_id;
        request
            .tokens
            .set(RequestToken::TransportRequestId, TokenValue::ULong(request_id))?;
        if !request.tokens.is_present(RequestToken::ReplicaPath) {
            request
                .tokens
                .set_string(RequestToken::ReplicaPath, replica_path(target))?;
        }
        let read_only = request.operation_type.is_read_only();
        let bytes = request.encode()?.freeze();

        Ok(PreparedCall {
            request_id,
            target: target.to_string(),
            activity_id,
            read_only,
            bytes,
            stage: Arc::new(CallStageCell::new()),
        })
    }

    /// Sends a prepared call and waits for its response.
    ///
    /// There is no deadline here; callers enforce their own and cancel.
    pub async fn call(&self, prepared: &PreparedCall) -> Result<StoreResponse, ClientError> {
        let inner = &self.inner;
        inner.ensure_not_disposed()?;
        let (call, completion) = CallInfo::new(
            prepared.activity_id,
            prepared.target.clone(),
            prepared.stage.clone(),
        );

        {
            let mut table = inner.call_lock.lock();
            if !table.calls_allowed {
                return Err(TransportError::new(
                    TransportErrorCode::ChannelMultiplexerClosed,
                    prepared.activity_id,
                    prepared.target.clone(),
                    inner.name(),
                )
                .with_payload(true, false)
                .into());
            }
            if table
                .calls
                .insert(prepared.request_id, call.clone())
                .is_some()
            {
                tracing::error!(
                    "request id {} reused while still pending on {}",
                    prepared.request_id,
                    inner.name()
                );
            }
        }

        let _registration = CallRegistration {
            inner,
            request_id: prepared.request_id,
            call: &call,
        };
        let result = inner.send_and_wait(prepared, &call, completion).await;
        if matches!(
            result,
            Err(ClientError::Transport(_)) | Err(ClientError::Protocol(_))
        ) {
            inner.disallow_calls();
        }
        result
    }

    /// Removes a call and resolves it as cancelled.
    pub fn cancel_call(&self, prepared: &PreparedCall) -> Result<(), ClientError> {
        self.inner.ensure_not_disposed()?;
        if let Some(call) = self.inner.remove_call(prepared.request_id) {
            call.cancel();
        }
        Ok(())
    }

    /// Cancels a call that timed out and records the timeout against the
    /// connection.
    pub fn cancel_call_and_notify_on_timeout(
        &self,
        prepared: &PreparedCall,
    ) -> Result<(), ClientError> {
        self.cancel_call(prepared)?;
        self.inner
            .connection
            .notify_status(false, prepared.read_only);
        Ok(())
    }

    /// Resets timeout tracking after a request completed in time.
    pub fn notify_on_success(&self) {
        self.inner.connection.notify_status(true, false);
    }

    /// False once shut down or the connection looks dead. An unhealthy
    /// connection closes the admission gate.
    pub fn is_healthy(&self) -> bool {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::Acquire) || inner.cancellation.is_cancelled() {
            return false;
        }
        if !inner.call_lock.lock().calls_allowed {
            return false;
        }
        let healthy = inner.connection.is_healthy();
        if !healthy {
            inner.disallow_calls();
        }
        healthy
    }

    /// Stops admitting calls. Calls already in flight are unaffected.
    pub fn disallow_calls(&self) {
        self.inner.disallow_calls();
    }

    /// Shuts down: closes the gate, stops the idle timer, closes the
    /// connection and waits for the receive loop. Callable once.
    pub async fn dispose(&self) -> Result<(), ClientError> {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::AcqRel) {
            return Err(ClientError::InvalidOperation("dispatcher disposed twice"));
        }
        tracing::debug!("disposing dispatcher {} ({})", inner.correlation_id, inner.name());

        let idle_timer = {
            let mut state = inner.connection_lock.lock().await;
            inner.start_connection_shutdown();
            state.idle_timer.take()
        };
        inner.wait_task(idle_timer, "idle timer").await;

        let receive_task = {
            let _state = inner.connection_lock.lock().await;
            inner.close_connection()
        };
        inner.wait_task(receive_task, "receive loop").await;

        tracing::debug!("dispatcher {} disposed", inner.correlation_id);
        Ok(())
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::Acquire) {
            return;
        }
        // Without an async context only the non-blocking part of shutdown runs.
        inner.start_connection_shutdown();
        if !inner.connection.is_disposed() {
            if let Err(e) = inner.connection.dispose() {
                tracing::debug!("dropping dispatcher {}: {}", inner.correlation_id, e);
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("correlation_id", &self.inner.correlation_id)
            .field("connection", &self.inner.name())
            .finish()
    }
}

/// Removes a call from the table however `call` exits.
struct CallRegistration<'a> {
    inner: &'a DispatcherInner,
    request_id: u32,
    call: &'a Arc<CallInfo>,
}

impl Drop for CallRegistration<'_> {
    fn drop(&mut self) {
        // A caller that gave up mid-write never completed the send.
        if self.call.send_state() == SendState::New {
            let _ = self.call.send_failed();
        }
        let mut table = self.inner.call_lock.lock();
        if table
            .calls
            .get(&self.request_id)
            .is_some_and(|call| Arc::ptr_eq(call, self.call))
        {
            table.calls.remove(&self.request_id);
        }
    }
}

impl DispatcherInner {
    fn name(&self) -> String {
        self.connection.name()
    }

    fn ensure_not_disposed(&self) -> Result<(), ClientError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(ClientError::InvalidOperation("dispatcher used after dispose"));
        }
        Ok(())
    }

    async fn connect_and_negotiate(&self, activity_id: Uuid) -> Result<(), ClientError> {
        self.connection
            .open(activity_id, self.port_pool.clone())
            .await?;
        self.negotiate(activity_id).await
    }

    async fn negotiate(&self, activity_id: Uuid) -> Result<(), ClientError> {
        let config = self.connection.config();
        let request = ContextRequest::new(config.user_agent.clone())
            .with_caller_id(config.caller_id)
            .with_channel_multiplexing(config.enable_channel_multiplexing);
        let bytes = request.encode(activity_id)?;

        // Negotiation never carries a user payload.
        let no_payload = |err: TransportError| err.with_payload(false, false);
        self.connection
            .write_request(activity_id, &bytes, false, None)
            .await
            .map_err(no_payload)?;
        let (header, metadata) = self
            .connection
            .read_response_metadata(activity_id)
            .await
            .map_err(no_payload)?;
        let response = ContextResponse::from_parts(header, metadata)?;

        if !response.is_success() {
            let body = self
                .connection
                .read_response_body(activity_id)
                .await
                .map_err(no_payload)?;
            return Err(self.negotiation_error(&response, &body, activity_id).into());
        }

        let properties = ServerProperties {
            agent: response.server_agent().unwrap_or_default().to_string(),
            version: response.server_version().unwrap_or_default().to_string(),
            idle_timeout: response.idle_timeout(),
        };
        tracing::debug!(
            "negotiated with {} (agent {}, version {})",
            self.connection.target(),
            properties.agent,
            properties.version
        );
        *self.server_properties.write() = Some(properties);
        Ok(())
    }

    fn negotiation_error(
        &self,
        response: &ContextResponse,
        body: &[u8],
        activity_id: Uuid,
    ) -> NegotiationError {
        let kind = ServerErrorKind::from_status(response.status, None)
            .unwrap_or(ServerErrorKind::InternalServerError);
        let mut headers = BTreeMap::new();
        if let Some(version) = response.client_version() {
            headers.insert(NegotiationError::REQUIRED_CLIENT_VERSION, version.to_string());
        }
        if let Some(version) = response.protocol_version() {
            headers.insert(NegotiationError::REQUIRED_PROTOCOL_VERSION, version.to_string());
        }
        if let Some(agent) = response.server_agent() {
            headers.insert(NegotiationError::SERVER_AGENT, agent.to_string());
        }
        if let Some(version) = response.server_version() {
            headers.insert(NegotiationError::SERVER_VERSION, version.to_string());
        }
        NegotiationError {
            status: response.status,
            message: error_message(Some(body), kind),
            activity_id,
            target: self.connection.target().to_string(),
            headers,
        }
    }

    async fn send_and_wait(
        &self,
        prepared: &PreparedCall,
        call: &CallInfo,
        completion: CallCompletion,
    ) -> Result<StoreResponse, ClientError> {
        let written = self
            .connection
            .write_request(
                prepared.activity_id,
                &prepared.bytes,
                true,
                Some(prepared.stage.as_ref()),
            )
            .await;
        match written {
            Ok(()) => call.sent()?,
            Err(err) => {
                call.send_failed()?;
                return Err(err.into());
            }
        }
        completion.wait().await
    }

    fn remove_call(&self, request_id: u32) -> Option<Arc<CallInfo>> {
        self.call_lock.lock().calls.remove(&request_id)
    }

    fn disallow_initial_calls(&self) {
        let mut table = self.call_lock.lock();
        debug_assert!(table.calls.is_empty());
        table.calls_allowed = false;
    }

    fn disallow_calls(&self) {
        self.call_lock.lock().calls_allowed = false;
    }

    /// Closes the gate and empties the table.
    fn stop_calls(&self) -> HashMap<u32, Arc<CallInfo>> {
        let mut table = self.call_lock.lock();
        table.calls_allowed = false;
        std::mem::take(&mut table.calls)
    }

    async fn receive_loop(self: Arc<Self>) {
        tracing::debug!("receive loop started on {}", self.name());
        let result = tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Ok(()),
            result = self.receive_responses() => result,
        };
        match result {
            Err(err) if !self.cancellation.is_cancelled() => self.dispatch_failure(err),
            _ => self.dispatch_cancellation(),
        }
        tracing::debug!("receive loop stopped on {}", self.name());
    }

    async fn receive_responses(&self) -> Result<(), ClientError> {
        loop {
            let (header, metadata) = self.connection.read_response_metadata(Uuid::nil()).await?;
            let activity_id = header.activity_id;
            let mut frame = ResponseFrame::from_parts(header, metadata)?;
            if frame.payload_present() {
                frame.body = Some(self.connection.read_response_body(activity_id).await?);
            }
            self.dispatch_response(frame)?;
        }
    }

    fn dispatch_response(&self, frame: ResponseFrame) -> Result<(), ClientError> {
        let request_id = frame.transport_request_id().ok_or_else(|| {
            ProtocolError::MissingRequiredToken {
                catalogue: ResponseToken::CATALOGUE,
                token: ResponseToken::TransportRequestId.name(),
            }
        })?;
        match self.remove_call(request_id) {
            Some(call) => {
                let server_version = self
                    .server_properties
                    .read()
                    .as_ref()
                    .map(|properties| properties.version.clone());
                call.set_response(frame, server_version);
            }
            None => tracing::debug!(
                "dropping response to abandoned request {} on {}",
                request_id,
                self.name()
            ),
        }
        Ok(())
    }

    /// Fails every pending call with a connection-broken fault. With nothing
    /// pending, the listener hears about it instead.
    fn dispatch_failure(&self, err: ClientError) {
        let calls = self.stop_calls();
        let connection = self.name();
        tracing::warn!(
            "receive loop on {} failed with {} pending calls: {}",
            connection,
            calls.len(),
            err
        );

        let code = err.transport_code();
        let source: Arc<dyn std::error::Error + Send + Sync> = Arc::new(err);
        for call in calls.values() {
            call.set_connection_broken(source.clone(), connection.clone());
        }
        if !calls.is_empty() {
            return;
        }
        let Some(listener) = self.listener.clone() else {
            return;
        };
        let event = match code {
            Some(TransportErrorCode::ReceiveStreamClosed) => ConnectionEvent::ReadEof,
            Some(TransportErrorCode::ReceiveFailed) => ConnectionEvent::ReadFailure,
            other => {
                tracing::debug!("no connection event for {:?} on {}", other, connection);
                return;
            }
        };

        let server = self.connection.target().to_string();
        let timestamp = Utc::now();
        let notification = tokio::spawn(async move {
            listener.on_connection_event(event, timestamp, &server);
        });
        tokio::spawn(async move {
            if let Err(e) = notification.await {
                tracing::error!("connection event listener failed: {}", e);
            }
        });
    }

    fn dispatch_cancellation(&self) {
        for call in self.stop_calls().values() {
            call.cancel();
        }
    }

    /// Caller holds the connection lock.
    fn start_connection_shutdown(&self) {
        if self.cancellation.is_cancelled() {
            return;
        }
        self.disallow_calls();
        self.cancellation.cancel();
    }

    /// Caller holds the connection lock. Returns the receive task to join.
    fn close_connection(&self) -> Option<JoinHandle<()>> {
        if self.connection.is_disposed() {
            return None;
        }
        let receive_task = self.call_lock.lock().receive_task.take();
        if let Err(e) = self.connection.dispose() {
            tracing::warn!("closing {} failed: {}", self.name(), e);
        }
        receive_task
    }

    async fn wait_task(&self, task: Option<JoinHandle<()>>, description: &str) {
        let Some(task) = task else {
            return;
        };
        if let Err(e) = task.await {
            tracing::warn!(
                "{} of dispatcher {} failed: {}",
                description,
                self.correlation_id,
                e
            );
        }
    }

    async fn start_idle_timer(self: &Arc<Self>) {
        if self.connection.health_checker().idle_timeout().is_none() {
            return;
        }
        let mut state = self.connection_lock.lock().await;
        match self.connection.is_active() {
            Ok((true, time_to_idle)) => {
                tracing::debug!(
                    "idle timer for {} fires in {:?}",
                    self.name(),
                    time_to_idle
                );
                self.schedule_idle_timer(&mut state, time_to_idle);
            }
            Ok((false, _)) => tracing::error!("new connection {} is already idle", self.name()),
            Err(e) => tracing::debug!("idle timer not started: {}", e),
        }
    }

    /// Caller holds the connection lock.
    fn schedule_idle_timer(self: &Arc<Self>, state: &mut ConnectionState, delay: Duration) {
        let inner = self.clone();
        state.idle_timer = Some(tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = inner.cancellation.cancelled() => {}
                _ = tokio::time::sleep(delay) => inner.on_idle_timer().await,
            }
        }));
    }

    async fn on_idle_timer(self: Arc<Self>) {
        let receive_task = {
            let mut state = self.connection_lock.lock().await;
            if self.cancellation.is_cancelled() {
                return;
            }
            let (active, time_to_idle) = match self.connection.is_active() {
                Ok(activity) => activity,
                Err(_) => return,
            };
            if active {
                self.schedule_idle_timer(&mut state, time_to_idle);
                return;
            }

            let pending = {
                let mut table = self.call_lock.lock();
                if table.calls.is_empty() {
                    table.calls_allowed = false;
                }
                table.calls.len()
            };
            if pending > 0 {
                tracing::error!(
                    "connection {} looks idle but still has {} pending calls",
                    self.name(),
                    pending
                );
                self.schedule_idle_timer(&mut state, time_to_idle);
                return;
            }

            tracing::debug!("closing idle connection {}", self.name());
            state.idle_timer = None;
            self.start_connection_shutdown();
            self.close_connection()
        };
        self.wait_task(receive_task, "receive loop").await;
    }
}
