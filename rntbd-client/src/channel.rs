//! Deadline-enforcing owner of one dispatcher.

use crate::call::{CallStage, StoreResponse};
use crate::config::ConnectionConfig;
use crate::dispatcher::{Dispatcher, ServerProperties};
use crate::error::{ClientError, TransportError, TransportErrorCode};
use crate::listener::ConnectionStateListener;
use crate::port_pool::UserPortPool;
use rntbd_protocol::RequestFrame;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use uuid::Uuid;

/// Lifecycle of a [`Channel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    WaitingToOpen,
    Opening,
    Open,
    Closed,
}

/// A multiplexed channel to one server endpoint.
///
/// Adds the open and per-request timeouts the dispatcher does not enforce.
pub struct Channel {
    dispatcher: Dispatcher,
    target: String,
    open_timeout: Duration,
    request_timeout: Duration,
    state: watch::Sender<ChannelState>,
    opening_limiter: Option<Arc<Semaphore>>,
}

impl Channel {
    pub fn new(
        target: &str,
        config: ConnectionConfig,
        port_pool: Option<Arc<dyn UserPortPool>>,
        listener: Option<Arc<dyn ConnectionStateListener>>,
    ) -> Result<Self, ClientError> {
        let open_timeout = config.open_timeout;
        let request_timeout = config.request_timeout;
        let dispatcher = Dispatcher::new(target, config, port_pool, listener)?;
        let (state, _) = watch::channel(ChannelState::WaitingToOpen);
        Ok(Self {
            dispatcher,
            target: target.to_string(),
            open_timeout,
            request_timeout,
            state,
            opening_limiter: None,
        })
    }

    /// Bounds how many channels sharing `limiter` open at once.
    pub fn with_opening_limiter(mut self, limiter: Arc<Semaphore>) -> Self {
        self.opening_limiter = Some(limiter);
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn server_properties(&self) -> Option<ServerProperties> {
        self.dispatcher.server_properties()
    }

    /// Opens the underlying dispatcher within the open timeout.
    ///
    /// Transport, server and negotiation errors are returned as they are;
    /// anything else becomes `ChannelOpenFailed`.
    pub async fn open(&self, activity_id: Uuid) -> Result<(), ClientError> {
        let mut started = false;
        self.state.send_if_modified(|state| {
            if *state != ChannelState::WaitingToOpen {
                return false;
            }
            *state = ChannelState::Opening;
            started = true;
            true
        });
        if !started {
            return Err(ClientError::InvalidOperation("channel opened twice"));
        }

        let result = self.open_dispatcher(activity_id).await;
        let next = if result.is_ok() {
            ChannelState::Open
        } else {
            ChannelState::Closed
        };
        self.state.send_replace(next);
        result
    }

    async fn open_dispatcher(&self, activity_id: Uuid) -> Result<(), ClientError> {
        let _permit = match self.opening_limiter {
            Some(ref limiter) => {
                match tokio::time::timeout(self.open_timeout, limiter.clone().acquire_owned())
                    .await
                {
                    Ok(Ok(permit)) => Some(permit),
                    Ok(Err(e)) => {
                        return Err(self
                            .error(TransportErrorCode::ChannelOpenFailed, activity_id)
                            .with_source(e)
                            .into())
                    }
                    Err(_) => {
                        tracing::warn!(
                            "timed out waiting to open a channel to {} after {:?}",
                            self.target,
                            self.open_timeout
                        );
                        self.dispatcher.disallow_calls();
                        return Err(self
                            .error(TransportErrorCode::ChannelWaitingToOpenTimeout, activity_id)
                            .into());
                    }
                }
            }
            None => None,
        };

        match tokio::time::timeout(self.open_timeout, self.dispatcher.open(activity_id)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(
                err @ (ClientError::Transport(_)
                | ClientError::Server(_)
                | ClientError::Negotiation(_)),
            )) => Err(err),
            Ok(Err(err)) => {
                tracing::warn!("failed to open channel to {}: {}", self.target, err);
                Err(self
                    .error(TransportErrorCode::ChannelOpenFailed, activity_id)
                    .with_source(err)
                    .into())
            }
            Err(_) => {
                tracing::warn!(
                    "opening channel to {} timed out after {:?}",
                    self.target,
                    self.open_timeout
                );
                self.dispatcher.disallow_calls();
                Err(self
                    .error(TransportErrorCode::ChannelOpenTimeout, activity_id)
                    .into())
            }
        }
    }

    /// Sends `request` and waits for the response within the request timeout.
    ///
    /// Waits for an in-progress open first.
    pub async fn request(
        &self,
        request: RequestFrame,
        target: &str,
        activity_id: Uuid,
    ) -> Result<StoreResponse, ClientError> {
        let state = {
            let mut state = self.state.subscribe();
            let ready = state
                .wait_for(|state| *state != ChannelState::Opening)
                .await
                .map(|state| *state);
            ready.unwrap_or(ChannelState::Closed)
        };
        match state {
            ChannelState::Open => {}
            ChannelState::WaitingToOpen => {
                return Err(ClientError::InvalidOperation("channel not opened"))
            }
            ChannelState::Opening | ChannelState::Closed => {
                return Err(TransportError::new(
                    TransportErrorCode::ChannelMultiplexerClosed,
                    activity_id,
                    target,
                    self.dispatcher.connection().name(),
                )
                .with_payload(true, false)
                .into())
            }
        }

        let prepared = self.dispatcher.prepare_call(request, target, activity_id)?;
        match tokio::time::timeout(self.request_timeout, self.dispatcher.call(&prepared)).await {
            Ok(result) => {
                self.dispatcher.notify_on_success();
                result
            }
            Err(_) => {
                let stage = prepared.stage();
                if stage == CallStage::Sending {
                    // A partially written frame leaves the stream unframed.
                    self.dispatcher.disallow_calls();
                }
                if let Err(e) = self.dispatcher.cancel_call_and_notify_on_timeout(&prepared) {
                    tracing::debug!("cancelling timed out call on {}: {}", self.target, e);
                }
                tracing::debug!(
                    "request {} to {} timed out in stage {:?}",
                    prepared.request_id,
                    target,
                    stage
                );
                Err(TransportError::new(
                    stage.timeout_code(),
                    activity_id,
                    target,
                    self.dispatcher.connection().name(),
                )
                .with_payload(true, stage.payload_sent())
                .into())
            }
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state() == ChannelState::Open && self.dispatcher.is_healthy()
    }

    /// Closes the channel and disposes its dispatcher.
    pub async fn close(&self) -> Result<(), ClientError> {
        let previous = self.state.send_replace(ChannelState::Closed);
        tracing::debug!("closing channel to {} ({:?})", self.target, previous);
        self.dispatcher.dispose().await
    }

    fn error(&self, code: TransportErrorCode, activity_id: Uuid) -> TransportError {
        TransportError::new(
            code,
            activity_id,
            self.target.clone(),
            self.dispatcher.connection().name(),
        )
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("target", &self.target)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeReplica;
    use rntbd_protocol::{ContextResponse, OperationType, ResourceType};
    use std::error::Error as _;

    fn config() -> ConnectionConfig {
        ConnectionConfig::new()
            .with_open_timeout(Duration::from_millis(300))
            .with_request_timeout(Duration::from_millis(300))
    }

    fn read_request() -> RequestFrame {
        RequestFrame::new(ResourceType::Document, OperationType::Read, Uuid::nil())
    }

    #[tokio::test]
    async fn test_open_and_request() {
        let replica = FakeReplica::bind().await;
        let target = replica.target.clone();
        tokio::spawn(async move {
            let mut conn = replica.accept().await;
            conn.negotiate().await;
            while let Some(request) = conn.read_request().await {
                conn.reply(&request, 200, Some(b"ok")).await;
            }
        });

        let channel = Channel::new(&target, config(), None, None).unwrap();
        assert_eq!(channel.state(), ChannelState::WaitingToOpen);
        assert!(matches!(
            channel.request(read_request(), &target, Uuid::new_v4()).await,
            Err(ClientError::InvalidOperation(_))
        ));

        tokio_test::assert_ok!(channel.open(Uuid::new_v4()).await);
        assert_eq!(channel.state(), ChannelState::Open);
        assert!(channel.is_healthy());
        assert!(channel.server_properties().is_some());

        let response = channel
            .request(read_request(), &target, Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(response.body.as_deref(), Some(&b"ok"[..]));
        tokio_test::assert_err!(channel.open(Uuid::new_v4()).await);

        channel.close().await.unwrap();
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(!channel.is_healthy());
        let err = channel
            .request(read_request(), &target, Uuid::new_v4())
            .await
            .unwrap_err();
        assert_eq!(
            err.transport_code(),
            Some(TransportErrorCode::ChannelMultiplexerClosed)
        );
    }

    #[tokio::test]
    async fn test_open_timeout() {
        let replica = FakeReplica::bind().await;
        let target = replica.target.clone();
        tokio::spawn(async move {
            // Accepts but never answers the context request.
            let mut conn = replica.accept().await;
            conn.read_context_request().await;
            let _ = conn.read_request().await;
        });

        let channel = Channel::new(&target, config(), None, None).unwrap();
        let err = channel.open(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.transport_code(), Some(TransportErrorCode::ChannelOpenTimeout));
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(!channel.is_healthy());
        assert!(!channel.dispatcher().calls_allowed());
        channel.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_waiting_to_open_timeout() {
        let limiter = Arc::new(Semaphore::new(1));
        let _held = limiter.clone().acquire_owned().await.unwrap();

        let channel = Channel::new("rntbd://127.0.0.1:1/apps/a/", config(), None, None)
            .unwrap()
            .with_opening_limiter(limiter);
        let err = channel.open(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(
            err.transport_code(),
            Some(TransportErrorCode::ChannelWaitingToOpenTimeout)
        );
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_open_failure_codes() {
        // Connect errors pass through.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let channel = Channel::new(&format!("rntbd://{}/", addr), config(), None, None).unwrap();
        let err = channel.open(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.transport_code(), Some(TransportErrorCode::ConnectFailed));

        // A malformed context response is wrapped.
        let replica = FakeReplica::bind().await;
        let target = replica.target.clone();
        tokio::spawn(async move {
            let mut conn = replica.accept().await;
            let (activity_id, _) = conn.read_context_request().await;
            conn.send_context_response(&ContextResponse::new(200, activity_id), None)
                .await;
            let _ = conn.read_request().await;
        });
        let channel = Channel::new(&target, config(), None, None).unwrap();
        match channel.open(Uuid::new_v4()).await {
            Err(ClientError::Transport(err)) => {
                assert_eq!(err.code, TransportErrorCode::ChannelOpenFailed);
                assert!(err.source().is_some());
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_request_timeout_after_send() {
        let replica = FakeReplica::bind().await;
        let target = replica.target.clone();
        tokio::spawn(async move {
            let mut conn = replica.accept().await;
            conn.negotiate().await;
            while conn.read_request().await.is_some() {}
        });

        let channel = Channel::new(&target, config(), None, None).unwrap();
        channel.open(Uuid::new_v4()).await.unwrap();

        let activity_id = Uuid::new_v4();
        match channel.request(read_request(), &target, activity_id).await {
            Err(ClientError::Transport(err)) => {
                assert_eq!(err.code, TransportErrorCode::ReceiveTimeout);
                assert_eq!(err.activity_id, activity_id);
                assert!(err.user_payload);
                assert!(err.payload_sent);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(channel.dispatcher().pending_calls(), 0);
        assert_eq!(channel.dispatcher().connection().transit_timeouts(), (1, 0));
        channel.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_waits_for_open() {
        let replica = FakeReplica::bind().await;
        let target = replica.target.clone();
        let (negotiate_tx, negotiate_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let mut conn = replica.accept().await;
            let _ = negotiate_rx.await;
            conn.negotiate().await;
            while let Some(request) = conn.read_request().await {
                conn.reply(&request, 204, None).await;
            }
        });

        let channel = Arc::new(Channel::new(&target, config(), None, None).unwrap());
        let opening = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.open(Uuid::new_v4()).await })
        };
        while channel.state() != ChannelState::Opening {
            tokio::task::yield_now().await;
        }
        let request = {
            let channel = channel.clone();
            let target = target.clone();
            tokio::spawn(async move { channel.request(read_request(), &target, Uuid::new_v4()).await })
        };

        negotiate_tx.send(()).unwrap();
        opening.await.unwrap().unwrap();
        assert_eq!(request.await.unwrap().unwrap().status, 204);
        channel.close().await.unwrap();
    }
}
