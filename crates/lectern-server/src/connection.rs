use std::sync::Arc;

use lectern_core::{ConnectionId, Role, SessionKey};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The registry's view of one live WebSocket: identity, session, role, an
/// outbound frame queue and a token that forces the socket closed.
///
/// Cloning is cheap; all clones refer to the same connection.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    key: SessionKey,
    role: Role,
    tx: mpsc::Sender<Arc<str>>,
    close: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(key: SessionKey, role: Role, tx: mpsc::Sender<Arc<str>>) -> Self {
        Self {
            id: ConnectionId::new(),
            key,
            role,
            tx,
            close: CancellationToken::new(),
        }
    }

    /// Build a handle together with its receiving end.
    pub fn channel(key: SessionKey, role: Role, capacity: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(key, role, tx), rx)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Queue a serialized frame. Never waits: a full or closed queue drops
    /// the frame and returns `false`; callers decide whether that is worth
    /// logging.
    pub fn send(&self, frame: Arc<str>) -> bool {
        self.tx.try_send(frame).is_ok()
    }

    /// Ask the transport to close this connection.
    pub fn close(&self) {
        self.close.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }

    /// Neither force-closed nor abandoned by its writer.
    pub fn is_live(&self) -> bool {
        !self.close.is_cancelled() && !self.tx.is_closed()
    }

    /// Resolves once [`close`](Self::close) has been called on any clone.
    pub async fn closed(&self) {
        self.close.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SessionKey {
        SessionKey::parse("abc").unwrap()
    }

    #[test]
    fn send_queues_frame() {
        let (conn, mut rx) = ConnectionHandle::channel(key(), Role::Overlay, 4);
        assert!(conn.send(Arc::from("hello")));
        assert_eq!(&*rx.try_recv().unwrap(), "hello");
    }

    #[test]
    fn full_queue_drops() {
        let (conn, _rx) = ConnectionHandle::channel(key(), Role::Overlay, 1);
        assert!(conn.send(Arc::from("one")));
        assert!(!conn.send(Arc::from("two")));
    }

    #[test]
    fn closed_receiver_is_not_live() {
        let (conn, rx) = ConnectionHandle::channel(key(), Role::Home, 1);
        assert!(conn.is_live());
        drop(rx);
        assert!(!conn.is_live());
        assert!(!conn.send(Arc::from("late")));
    }

    #[test]
    fn close_is_shared_between_clones() {
        let (conn, _rx) = ConnectionHandle::channel(key(), Role::Mobile, 1);
        let clone = conn.clone();
        clone.close();
        assert!(conn.is_closed());
        assert!(!conn.is_live());
        assert_eq!(conn.id(), clone.id());
    }

    #[tokio::test]
    async fn closed_future_resolves_after_close() {
        let (conn, _rx) = ConnectionHandle::channel(key(), Role::Overlay, 1);
        let waiter = conn.clone();
        let task = tokio::spawn(async move { waiter.closed().await });
        conn.close();
        task.await.unwrap();
    }
}
