//! Per-request bookkeeping for multiplexed calls.

use crate::error::{ClientError, TransportError, TransportErrorCode};
use bytes::Bytes;
use parking_lot::Mutex;
use rntbd_protocol::{map_status, ResponseFrame};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

/// Result delivered to a waiting caller.
pub type CallResult = Result<StoreResponse, ClientError>;

/// How far a call got. Decides which timeout code a caller reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum CallStage {
    /// Prepared, waiting for the write gate.
    Pipelined = 0,
    /// Bytes are being written.
    Sending = 1,
    Sent = 2,
    Received = 3,
}

impl CallStage {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CallStage::Pipelined,
            1 => CallStage::Sending,
            2 => CallStage::Sent,
            _ => CallStage::Received,
        }
    }

    /// Timeout code for a call that expired in this stage.
    pub fn timeout_code(self) -> TransportErrorCode {
        match self {
            CallStage::Pipelined => TransportErrorCode::SendLockTimeout,
            CallStage::Sending => TransportErrorCode::SendTimeout,
            CallStage::Sent | CallStage::Received => TransportErrorCode::ReceiveTimeout,
        }
    }

    /// Whether any request bytes may have reached the wire.
    pub fn payload_sent(self) -> bool {
        self >= CallStage::Sending
    }
}

/// Shared, atomically updated [`CallStage`].
#[derive(Debug)]
pub struct CallStageCell(AtomicU8);

impl CallStageCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(CallStage::Pipelined as u8))
    }

    pub fn get(&self) -> CallStage {
        CallStage::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, stage: CallStage) {
        self.0.store(stage as u8, Ordering::Release);
    }
}

impl Default for CallStageCell {
    fn default() -> Self {
        Self::new()
    }
}

/// A serialized request bound to one dispatcher.
#[derive(Debug, Clone)]
pub struct PreparedCall {
    pub request_id: u32,
    pub target: String,
    pub activity_id: Uuid,
    pub read_only: bool,
    pub bytes: Bytes,
    pub stage: Arc<CallStageCell>,
}

impl PreparedCall {
    pub fn stage(&self) -> CallStage {
        self.stage.get()
    }
}

/// A successful backend response.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreResponse {
    pub status: u32,
    pub activity_id: Uuid,
    pub sub_status: Option<u32>,
    pub lsn: Option<i64>,
    pub session_token: Option<String>,
    pub request_charge: Option<f64>,
    pub headers: BTreeMap<&'static str, String>,
    pub body: Option<Bytes>,
    pub server_version: Option<String>,
}

impl StoreResponse {
    pub fn from_frame(frame: ResponseFrame, server_version: Option<String>) -> Self {
        Self {
            status: frame.status,
            activity_id: frame.activity_id,
            sub_status: frame.sub_status(),
            lsn: frame.lsn(),
            session_token: frame.session_token().map(str::to_string),
            request_charge: frame.request_charge(),
            headers: frame.headers(),
            body: frame.body,
            server_version,
        }
    }
}

/// Whether the request write finished, and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    New,
    Sent,
    SendFailed,
}

/// One in-flight request.
///
/// The completion slot is resolved at most once, always from a spawned task
/// so a slow caller never stalls the receive loop.
#[derive(Debug)]
pub struct CallInfo {
    activity_id: Uuid,
    target: String,
    stage: Arc<CallStageCell>,
    completion: Mutex<Option<oneshot::Sender<CallResult>>>,
    send_state: watch::Sender<SendState>,
}

/// Caller side of a [`CallInfo`].
#[derive(Debug)]
pub struct CallCompletion {
    receiver: oneshot::Receiver<CallResult>,
}

impl CallCompletion {
    /// Waits for the call to resolve. A dropped slot counts as cancellation.
    pub async fn wait(self) -> CallResult {
        self.receiver.await.unwrap_or(Err(ClientError::Cancelled))
    }
}

impl CallInfo {
    pub fn new(
        activity_id: Uuid,
        target: impl Into<String>,
        stage: Arc<CallStageCell>,
    ) -> (Arc<Self>, CallCompletion) {
        let (sender, receiver) = oneshot::channel();
        let (send_state, _) = watch::channel(SendState::New);
        let call = Arc::new(Self {
            activity_id,
            target: target.into(),
            stage,
            completion: Mutex::new(Some(sender)),
            send_state,
        });
        (call, CallCompletion { receiver })
    }

    pub fn activity_id(&self) -> Uuid {
        self.activity_id
    }

    pub fn send_state(&self) -> SendState {
        *self.send_state.borrow()
    }

    /// The request was fully written.
    pub fn sent(&self) -> Result<(), ClientError> {
        self.complete_send(SendState::Sent)?;
        self.stage.set(CallStage::Sent);
        Ok(())
    }

    /// Writing the request failed.
    pub fn send_failed(&self) -> Result<(), ClientError> {
        self.complete_send(SendState::SendFailed)
    }

    fn complete_send(&self, new_state: SendState) -> Result<(), ClientError> {
        let mut completed = false;
        self.send_state.send_if_modified(|state| {
            if *state != SendState::New {
                return false;
            }
            *state = new_state;
            completed = true;
            true
        });
        if !completed {
            return Err(ClientError::InvalidOperation("send may only complete once"));
        }
        Ok(())
    }

    fn take_completion(&self) -> Option<oneshot::Sender<CallResult>> {
        self.completion.lock().take()
    }

    /// Resolves the call with a decoded response, mapping failed statuses to
    /// server errors.
    pub fn set_response(&self, frame: ResponseFrame, server_version: Option<String>) {
        self.stage.set(CallStage::Received);
        let Some(completion) = self.take_completion() else {
            return;
        };
        let target = self.target.clone();
        tokio::spawn(async move {
            let result = match map_status(&frame, &target) {
                Some(err) => Err(ClientError::Server(err)),
                None => Ok(StoreResponse::from_frame(frame, server_version)),
            };
            let _ = completion.send(result);
        });
    }

    /// Resolves the call with a connection-broken fault, but only once its
    /// request was sent. A failed send already reported its own error.
    pub fn set_connection_broken(
        &self,
        source: Arc<dyn std::error::Error + Send + Sync>,
        connection: String,
    ) {
        let Some(completion) = self.take_completion() else {
            return;
        };
        let mut send_state = self.send_state.subscribe();
        let error = TransportError::new(
            TransportErrorCode::ConnectionBroken,
            self.activity_id,
            self.target.clone(),
            connection,
        )
        .with_payload(true, true)
        .with_shared_source(source);
        tokio::spawn(async move {
            let sent = match send_state.wait_for(|state| *state != SendState::New).await {
                Ok(state) => *state == SendState::Sent,
                Err(_) => false,
            };
            if sent {
                let _ = completion.send(Err(ClientError::Transport(error)));
            }
        });
    }

    pub fn cancel(&self) {
        let Some(completion) = self.take_completion() else {
            return;
        };
        tokio::spawn(async move {
            let _ = completion.send(Err(ClientError::Cancelled));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rntbd_protocol::{ResponseToken, TokenValue};
    use std::time::Duration;

    fn new_call() -> (Arc<CallInfo>, CallCompletion) {
        CallInfo::new(
            Uuid::new_v4(),
            "rntbd://replica:1/apps/a",
            Arc::new(CallStageCell::new()),
        )
    }

    #[test]
    fn test_send_completes_once() {
        let (call, _completion) = new_call();
        assert_eq!(call.send_state(), SendState::New);
        call.sent().unwrap();
        assert_eq!(call.send_state(), SendState::Sent);
        assert!(matches!(
            call.send_failed(),
            Err(ClientError::InvalidOperation("send may only complete once"))
        ));
        assert!(matches!(call.sent(), Err(ClientError::InvalidOperation(_))));
        assert_eq!(call.send_state(), SendState::Sent);
    }

    #[test]
    fn test_stage_timeout_codes() {
        assert_eq!(
            CallStage::Pipelined.timeout_code(),
            TransportErrorCode::SendLockTimeout
        );
        assert_eq!(CallStage::Sending.timeout_code(), TransportErrorCode::SendTimeout);
        assert_eq!(CallStage::Sent.timeout_code(), TransportErrorCode::ReceiveTimeout);
        assert!(!CallStage::Pipelined.payload_sent());
        assert!(CallStage::Sending.payload_sent());

        let cell = CallStageCell::new();
        assert_eq!(cell.get(), CallStage::Pipelined);
        cell.set(CallStage::Received);
        assert_eq!(cell.get(), CallStage::Received);
    }

    #[tokio::test]
    async fn test_set_response_success() {
        let (call, completion) = new_call();
        call.sent().unwrap();
        let mut frame = ResponseFrame::new(200, call.activity_id()).with_body(&b"{}"[..]);
        frame
            .tokens
            .set(ResponseToken::Lsn, TokenValue::LongLong(42))
            .unwrap();
        call.set_response(frame, Some("1.0".to_string()));

        let response = completion.wait().await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.lsn, Some(42));
        assert_eq!(response.body.as_deref(), Some(&b"{}"[..]));
        assert_eq!(response.server_version.as_deref(), Some("1.0"));
    }

    #[tokio::test]
    async fn test_set_response_maps_status() {
        let (call, completion) = new_call();
        call.sent().unwrap();
        let frame = ResponseFrame::new(404, call.activity_id());
        call.set_response(frame, None);

        match completion.wait().await {
            Err(ClientError::Server(err)) => {
                assert_eq!(err.status, 404);
                assert_eq!(err.resource_address, "rntbd://replica:1/apps/a");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connection_broken_waits_for_send() {
        let (call, completion) = new_call();
        call.set_connection_broken(
            Arc::new(std::io::Error::other("reset")),
            "local -> remote".to_string(),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        call.sent().unwrap();

        match completion.wait().await {
            Err(ClientError::Transport(err)) => {
                assert_eq!(err.code, TransportErrorCode::ConnectionBroken);
                assert!(err.payload_sent);
                assert_eq!(err.connection, "local -> remote");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connection_broken_after_failed_send_is_silent() {
        let (call, completion) = new_call();
        call.send_failed().unwrap();
        call.set_connection_broken(
            Arc::new(std::io::Error::other("reset")),
            "local -> remote".to_string(),
        );
        // The slot is dropped without a value, which reads as cancellation.
        assert!(matches!(completion.wait().await, Err(ClientError::Cancelled)));
    }

    #[tokio::test]
    async fn test_resolves_once() {
        let (call, completion) = new_call();
        call.sent().unwrap();
        call.cancel();
        call.set_response(ResponseFrame::new(200, Uuid::nil()), None);
        assert!(matches!(completion.wait().await, Err(ClientError::Cancelled)));
    }
}
