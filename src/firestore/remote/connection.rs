use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::firestore::error::{internal_error, unavailable, FirestoreError, FirestoreResult};
use crate::firestore::remote::credentials::StreamCredentials;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamKind {
    Listen,
    Write,
}

impl StreamKind {
    pub fn label(&self) -> &'static str {
        match self {
            StreamKind::Listen => "listen",
            StreamKind::Write => "write",
        }
    }
}

/// Client half of an open bidirectional stream.
///
/// `send` only queues the frame; frames reach the server in call order.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait StreamHandle: Send + Sync + 'static {
    fn send(&self, frame: JsonValue) -> FirestoreResult<()>;

    /// `None` once the server half-closed the stream.
    async fn next(&self) -> Option<FirestoreResult<JsonValue>>;

    fn close(&self);
}

/// Opens Listen and Write streams against the backend.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait Connection: Send + Sync + 'static {
    async fn open_stream(
        &self,
        kind: StreamKind,
        credentials: StreamCredentials,
    ) -> FirestoreResult<Arc<dyn StreamHandle>>;
}

#[derive(Clone, Debug)]
enum ServerFrame {
    Data(JsonValue),
    Error(FirestoreError),
    Close,
}

/// Loopback [`Connection`] whose server side is driven by a [`ServerEndpoint`].
pub struct InMemoryConnection {
    accepted: Sender<ServerStream>,
    available: AtomicBool,
    next_stream_id: AtomicU32,
}

impl InMemoryConnection {
    pub fn new() -> (Arc<Self>, ServerEndpoint) {
        let (accepted_tx, accepted_rx) = async_channel::unbounded();
        let connection = Arc::new(Self {
            accepted: accepted_tx,
            available: AtomicBool::new(true),
            next_stream_id: AtomicU32::new(1),
        });
        (connection, ServerEndpoint { accepted: accepted_rx })
    }

    /// While unavailable every open attempt fails with `Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl Connection for InMemoryConnection {
    async fn open_stream(
        &self,
        kind: StreamKind,
        credentials: StreamCredentials,
    ) -> FirestoreResult<Arc<dyn StreamHandle>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(unavailable("in-memory backend is unreachable"));
        }
        let id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
        let (to_server_tx, to_server_rx) = async_channel::unbounded();
        let (to_client_tx, to_client_rx) = async_channel::unbounded();
        let server = ServerStream {
            id,
            kind,
            credentials,
            inbound: to_server_rx,
            outbound: to_client_tx,
        };
        self.accepted
            .send(server)
            .await
            .map_err(|_| unavailable("in-memory backend was dropped"))?;
        log::debug!("opened {} stream {id}", kind.label());
        Ok(Arc::new(ChannelStream {
            outbound: to_server_tx,
            inbound: to_client_rx,
        }))
    }
}

struct ChannelStream {
    outbound: Sender<JsonValue>,
    inbound: Receiver<ServerFrame>,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl StreamHandle for ChannelStream {
    fn send(&self, frame: JsonValue) -> FirestoreResult<()> {
        self.outbound
            .try_send(frame)
            .map_err(|err| internal_error(format!("failed to enqueue stream frame: {err}")))
    }

    async fn next(&self) -> Option<FirestoreResult<JsonValue>> {
        match self.inbound.recv().await {
            Ok(ServerFrame::Data(frame)) => Some(Ok(frame)),
            Ok(ServerFrame::Error(err)) => Some(Err(err)),
            Ok(ServerFrame::Close) | Err(_) => None,
        }
    }

    fn close(&self) {
        self.outbound.close();
        self.inbound.close();
    }
}

/// Server side of an [`InMemoryConnection`]; yields every stream the client opens.
pub struct ServerEndpoint {
    accepted: Receiver<ServerStream>,
}

impl ServerEndpoint {
    pub async fn accept(&self) -> Option<ServerStream> {
        self.accepted.recv().await.ok()
    }

    /// Waits for the next stream of `kind`, dropping (and so closing) others.
    pub async fn accept_kind(&self, kind: StreamKind) -> Option<ServerStream> {
        loop {
            let stream = self.accept().await?;
            if stream.kind == kind {
                return Some(stream);
            }
        }
    }

    pub fn try_accept(&self) -> Option<ServerStream> {
        self.accepted.try_recv().ok()
    }
}

pub struct ServerStream {
    id: u32,
    kind: StreamKind,
    credentials: StreamCredentials,
    inbound: Receiver<JsonValue>,
    outbound: Sender<ServerFrame>,
}

impl ServerStream {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn credentials(&self) -> &StreamCredentials {
        &self.credentials
    }

    /// Next frame the client sent, `None` after the client closed the stream.
    pub async fn recv(&self) -> Option<JsonValue> {
        self.inbound.recv().await.ok()
    }

    pub fn try_recv(&self) -> Option<JsonValue> {
        self.inbound.try_recv().ok()
    }

    pub fn send(&self, frame: JsonValue) -> FirestoreResult<()> {
        self.outbound
            .try_send(ServerFrame::Data(frame))
            .map_err(|_| unavailable("client closed the stream"))
    }

    /// Terminates the stream with `error`.
    pub fn fail(&self, error: FirestoreError) {
        let _ = self.outbound.try_send(ServerFrame::Error(error));
        self.outbound.close();
    }

    pub fn close(&self) {
        let _ = self.outbound.try_send(ServerFrame::Close);
        self.outbound.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inbound.is_closed()
    }
}

impl Drop for ServerStream {
    fn drop(&mut self) {
        self.outbound.close();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::firestore::error::{resource_exhausted, FirestoreErrorCode};
    use crate::firestore::model::User;

    fn credentials() -> StreamCredentials {
        StreamCredentials::new(User::unauthenticated(), None)
    }

    #[tokio::test]
    async fn frames_flow_in_both_directions() {
        let (connection, endpoint) = InMemoryConnection::new();
        let client = connection
            .open_stream(StreamKind::Write, credentials())
            .await
            .expect("open");
        let server = endpoint.accept().await.expect("accepted");
        assert_eq!(server.kind(), StreamKind::Write);

        client.send(json!({ "database": "projects/p/databases/(default)" })).unwrap();
        assert_eq!(
            server.recv().await.unwrap()["database"],
            json!("projects/p/databases/(default)")
        );

        server.send(json!({ "streamToken": "AQ==" })).unwrap();
        let frame = client.next().await.unwrap().unwrap();
        assert_eq!(frame["streamToken"], json!("AQ=="));
    }

    #[tokio::test]
    async fn server_failure_surfaces_once_then_ends() {
        let (connection, endpoint) = InMemoryConnection::new();
        let client = connection
            .open_stream(StreamKind::Listen, credentials())
            .await
            .expect("open");
        let server = endpoint.accept().await.expect("accepted");

        server.fail(resource_exhausted("quota"));
        let err = client.next().await.unwrap().unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::ResourceExhausted);
        assert!(client.next().await.is_none());
    }

    #[tokio::test]
    async fn unavailable_connection_rejects_opens() {
        let (connection, _endpoint) = InMemoryConnection::new();
        connection.set_available(false);
        let err = connection
            .open_stream(StreamKind::Listen, credentials())
            .await
            .err()
            .unwrap();
        assert_eq!(err.code, FirestoreErrorCode::Unavailable);
    }

    #[tokio::test]
    async fn client_close_is_visible_to_server() {
        let (connection, endpoint) = InMemoryConnection::new();
        let client = connection
            .open_stream(StreamKind::Listen, credentials())
            .await
            .expect("open");
        let server = endpoint.accept().await.expect("accepted");
        client.close();
        assert!(server.recv().await.is_none());
    }
}
