//! In-process fake replica for transport tests.

use rntbd_protocol::{
    ContextRequest, ContextResponse, ContextResponseToken, Decoder, RequestFrame, RequestToken,
    ResponseFrame, ResponseToken, TokenValue,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

pub const SERVER_AGENT: &str = "fake-replica";
pub const SERVER_VERSION: &str = "2.14";

/// A plain-TCP listener on an ephemeral loopback port.
pub struct FakeReplica {
    listener: TcpListener,
    pub target: String,
}

impl FakeReplica {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = format!(
            "rntbd://{}/apps/app1/services/svc1/partitions/p1/replicas/r1p/",
            listener.local_addr().unwrap()
        );
        Self { listener, target }
    }

    pub async fn accept(&self) -> ReplicaConnection {
        let (socket, _) = self.listener.accept().await.unwrap();
        ReplicaConnection {
            socket,
            decoder: Decoder::new(),
        }
    }
}

/// Server side of one accepted connection.
pub struct ReplicaConnection {
    socket: TcpStream,
    decoder: Decoder,
}

impl ReplicaConnection {
    async fn fill(&mut self) -> bool {
        let mut buf = [0u8; 4096];
        let n = self.socket.read(&mut buf).await.unwrap_or(0);
        self.decoder.extend(&buf[..n]);
        n > 0
    }

    pub async fn read_context_request(&mut self) -> (Uuid, ContextRequest) {
        loop {
            if let Some(request) = self.decoder.decode_context_request().unwrap() {
                return request;
            }
            assert!(self.fill().await, "client closed before negotiating");
        }
    }

    /// Reads the next request, or `None` once the client closed the stream.
    pub async fn read_request(&mut self) -> Option<RequestFrame> {
        loop {
            if let Some(request) = self.decoder.decode_request().unwrap() {
                return Some(request);
            }
            if !self.fill().await {
                return None;
            }
        }
    }

    pub async fn send_context_response(
        &mut self,
        response: &ContextResponse,
        error_body: Option<&[u8]>,
    ) {
        let encoded = response.encode(error_body).unwrap();
        self.socket.write_all(&encoded).await.unwrap();
    }

    /// Accepts the negotiation with a successful response.
    pub async fn negotiate(&mut self) -> ContextRequest {
        let (activity_id, request) = self.read_context_request().await;
        let mut response = ContextResponse::new(200, activity_id);
        response
            .tokens
            .set_string(ContextResponseToken::ServerAgent, SERVER_AGENT)
            .unwrap()
            .set_string(ContextResponseToken::ServerVersion, SERVER_VERSION)
            .unwrap();
        self.send_context_response(&response, None).await;
        request
    }

    pub async fn send_response(&mut self, mut response: ResponseFrame) {
        let encoded = response.encode().unwrap();
        self.socket.write_all(&encoded).await.unwrap();
    }

    /// Answers `request` with `status` and an optional body.
    pub async fn reply(&mut self, request: &RequestFrame, status: u32, body: Option<&[u8]>) {
        let mut response = ResponseFrame::new(status, request.activity_id);
        if let Some(body) = body {
            response = response.with_body(body.to_vec());
        }
        response
            .tokens
            .set(
                ResponseToken::TransportRequestId,
                TokenValue::ULong(request_id(request)),
            )
            .unwrap();
        self.send_response(response).await;
    }

    pub async fn close(mut self) {
        let _ = self.socket.shutdown().await;
    }
}

pub fn request_id(request: &RequestFrame) -> u32 {
    request
        .tokens
        .get_u32(RequestToken::TransportRequestId)
        .unwrap()
}
