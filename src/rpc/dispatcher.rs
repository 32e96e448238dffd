//! The receive loop of a connection.
//!
//! The dispatcher is the only reader of the byte stream. It decodes frames and
//! routes them: responses to the correlation table, notifications to topic
//! subscribers. It never writes to the connection.
//!
//! A dispatcher is `Idle` from construction until [`Dispatcher::run`] is
//! called, `Running` inside it and `Stopped` once it returns. `run` consumes
//! the dispatcher, so it can only be started once.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::message::{Message, RemoteError};
use crate::rpc::decoder::FrameDecoder;
use crate::rpc::pending::CorrelationTable;
use crate::rpc::registry::NotificationRegistry;
use crate::rpc::transport::{self, ByteStream, ConnectionState};
use crate::rpc::{DecodeError, RpcError};
use crate::value::Value;

/// Why a connection stopped.
#[derive(Debug)]
pub enum StopReason {
    /// The peer closed its side of the connection.
    PeerClosed,
    /// Reading from the connection failed.
    ReadFailed(RpcError),
    /// The peer sent bytes that are not a valid msgpack-RPC stream.
    DecodeFailed(DecodeError),
    /// The connection was closed locally.
    Shutdown,
    /// The connection was never established.
    ConnectFailed(RpcError),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::PeerClosed => write!(f, "peer closed the connection"),
            StopReason::ReadFailed(e) => write!(f, "read failed: {e}"),
            StopReason::DecodeFailed(e) => write!(f, "decode failed: {e}"),
            StopReason::Shutdown => write!(f, "closed locally"),
            StopReason::ConnectFailed(e) => write!(f, "{e}"),
        }
    }
}

pub struct Dispatcher {
    pending: Arc<CorrelationTable>,
    registry: Arc<NotificationRegistry>,
    state: Arc<watch::Sender<ConnectionState>>,
    decoder: FrameDecoder,
}

impl Dispatcher {
    pub fn new(
        pending: Arc<CorrelationTable>,
        registry: Arc<NotificationRegistry>,
        state: Arc<watch::Sender<ConnectionState>>,
        max_frame_size: usize,
    ) -> Self {
        Self {
            pending,
            registry,
            state,
            decoder: FrameDecoder::with_max_frame_size(max_frame_size),
        }
    }

    /// Route incoming messages until the connection ends.
    ///
    /// On return the connection state is `Closed`, every outstanding call has
    /// failed with `RpcError::ConnectionClosed` and every subscription has
    /// ended.
    pub async fn run(mut self, mut stream: ByteStream) -> StopReason {
        let mut shutdown = self.state.subscribe();
        debug!("Dispatcher running");

        let reason = self.pump(&mut stream, &mut shutdown).await;

        transport::advance_state(&self.state, ConnectionState::Closed);
        let failed = self.pending.close_all();
        let ended = self.registry.close_all();

        match &reason {
            StopReason::Shutdown | StopReason::PeerClosed => info!("Connection closed: {}", reason),
            _ => warn!("Connection lost: {}", reason),
        }
        if failed > 0 || ended > 0 {
            debug!("Failed {} pending calls, ended {} subscriptions", failed, ended);
        }
        reason
    }

    async fn pump(
        &mut self,
        stream: &mut ByteStream,
        shutdown: &mut watch::Receiver<ConnectionState>,
    ) -> StopReason {
        loop {
            let chunk = tokio::select! {
                biased;
                _ = transport::closed(&mut *shutdown) => return StopReason::Shutdown,
                chunk = stream.next_chunk() => chunk,
            };

            match chunk {
                Ok(Some(bytes)) => self.decoder.feed(bytes),
                Ok(None) => return StopReason::PeerClosed,
                Err(e) => return StopReason::ReadFailed(e),
            }

            loop {
                match self.decoder.next_message() {
                    Ok(Some(msg)) => {
                        if let Err(reason) = self.route(msg, shutdown).await {
                            return reason;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => return StopReason::DecodeFailed(e),
                }
            }
        }
    }

    async fn route(
        &self,
        msg: Message,
        shutdown: &mut watch::Receiver<ConnectionState>,
    ) -> Result<(), StopReason> {
        match msg {
            Message::Response { id, error, result } => {
                let outcome = match error {
                    None => Ok(result),
                    Some(err) => Err(RpcError::from(RemoteError::from_value(&err))),
                };
                if self.pending.complete(id, outcome) {
                    trace!("Delivered response {}", id);
                } else {
                    debug!("Dropping response for unknown request {}", id);
                }
                Ok(())
            }
            Message::Notification { topic, payload } => match topic {
                Value::String(topic) => self.deliver(&topic, payload, shutdown).await,
                other => {
                    warn!("Dropping notification with non-string topic {}", other);
                    Ok(())
                }
            },
            Message::Request { id, method, .. } => {
                warn!("Ignoring request {} ({}) from peer", id, method);
                Ok(())
            }
        }
    }

    /// Hand `payload` to every subscriber of `topic`, waiting for room in
    /// each one's channel.
    async fn deliver(
        &self,
        topic: &str,
        payload: Value,
        shutdown: &mut watch::Receiver<ConnectionState>,
    ) -> Result<(), StopReason> {
        let subscribers = self.registry.senders(topic);
        if subscribers.is_empty() {
            trace!("No subscribers for {:?}, dropping notification", topic);
            return Ok(());
        }

        for (id, tx) in subscribers {
            tokio::select! {
                biased;
                _ = transport::closed(&mut *shutdown) => return Err(StopReason::Shutdown),
                sent = tx.send(payload.clone()) => {
                    if sent.is_err() {
                        debug!("Subscriber {} to {:?} is gone", id, topic);
                        self.registry.unsubscribe(topic, id);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    struct Harness {
        pending: Arc<CorrelationTable>,
        registry: Arc<NotificationRegistry>,
        state: Arc<watch::Sender<ConnectionState>>,
        peer: DuplexStream,
        task: JoinHandle<StopReason>,
    }

    fn start() -> Harness {
        let (ours, peer) = tokio::io::duplex(4096);
        let (stream, _writer) = transport::split(ours);
        let pending = Arc::new(CorrelationTable::new());
        let registry = Arc::new(NotificationRegistry::new());
        let (state, _) = watch::channel(ConnectionState::Connected);
        let state = Arc::new(state);

        let dispatcher = Dispatcher::new(
            pending.clone(),
            registry.clone(),
            state.clone(),
            crate::rpc::MAX_FRAME_SIZE,
        );
        let task = tokio::spawn(dispatcher.run(stream));

        Harness {
            pending,
            registry,
            state,
            peer,
            task,
        }
    }

    async fn send(peer: &mut DuplexStream, msg: Message) {
        peer.write_all(&msg.encode().unwrap()).await.unwrap();
    }

    fn notification(topic: &str, payload: &str) -> Message {
        Message::Notification {
            topic: Value::from(topic),
            payload: Value::from(payload),
        }
    }

    #[tokio::test]
    async fn test_routes_success_and_error_responses() {
        let mut h = start();
        let (ok_id, ok_rx) = h.pending.register().unwrap();
        let (err_id, err_rx) = h.pending.register().unwrap();

        send(
            &mut h.peer,
            Message::Response {
                id: err_id,
                error: Some(Value::Array(vec![
                    Value::from(0),
                    Value::from("E121: Undefined variable"),
                ])),
                result: Value::Nil,
            },
        )
        .await;
        send(
            &mut h.peer,
            Message::Response {
                id: ok_id,
                error: None,
                result: Value::from(20),
            },
        )
        .await;

        let ok = timeout(TEST_TIMEOUT, ok_rx).await.unwrap().unwrap();
        assert_eq!(ok.unwrap(), Value::from(20));

        let err = timeout(TEST_TIMEOUT, err_rx).await.unwrap().unwrap();
        match err {
            Err(RpcError::Remote { code, message }) => {
                assert_eq!(code, Some(0));
                assert_eq!(message, "E121: Undefined variable");
            }
            other => panic!("Expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stray_response_and_request_are_not_fatal() {
        let mut h = start();
        let (id, rx) = h.pending.register().unwrap();

        send(
            &mut h.peer,
            Message::Response {
                id: id + 100,
                error: None,
                result: Value::Nil,
            },
        )
        .await;
        send(
            &mut h.peer,
            Message::Request {
                id: 5,
                method: "nvim_buf_attach".to_string(),
                args: vec![],
            },
        )
        .await;
        send(
            &mut h.peer,
            Message::Response {
                id,
                error: None,
                result: Value::from("still alive"),
            },
        )
        .await;

        let outcome = timeout(TEST_TIMEOUT, rx).await.unwrap().unwrap();
        assert_eq!(outcome.unwrap(), Value::from("still alive"));
        assert_eq!(*h.state.borrow(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_notifications_reach_subscribers_in_order() {
        let mut h = start();
        let mut sub = h.registry.subscribe("42", 4);
        let mut other = h.registry.subscribe("7", 4);

        send(&mut h.peer, notification("42", "hello")).await;
        send(&mut h.peer, notification("unwatched", "dropped")).await;
        send(&mut h.peer, notification("42", "world")).await;

        let first = timeout(TEST_TIMEOUT, sub.next()).await.unwrap();
        let second = timeout(TEST_TIMEOUT, sub.next()).await.unwrap();
        assert_eq!(first, Some(Value::from("hello")));
        assert_eq!(second, Some(Value::from("world")));
        assert_eq!(other.try_next(), None);
    }

    #[tokio::test]
    async fn test_peer_close_fails_pending_and_ends_subscriptions() {
        let h = start();
        let (_id, rx) = h.pending.register().unwrap();
        let mut sub = h.registry.subscribe("42", 4);

        drop(h.peer);

        let reason = timeout(TEST_TIMEOUT, h.task).await.unwrap().unwrap();
        assert!(matches!(reason, StopReason::PeerClosed));
        assert_eq!(*h.state.borrow(), ConnectionState::Closed);

        let outcome = timeout(TEST_TIMEOUT, rx).await.unwrap().unwrap();
        assert!(matches!(outcome, Err(RpcError::ConnectionClosed)));
        assert_eq!(timeout(TEST_TIMEOUT, sub.next()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_corrupt_stream_closes_connection() {
        let mut h = start();
        let (_id, rx) = h.pending.register().unwrap();
        let mut sub = h.registry.subscribe("42", 4);

        send(&mut h.peer, notification("42", "before the corruption")).await;
        h.peer.write_all(&[0xc1]).await.unwrap();

        let reason = timeout(TEST_TIMEOUT, h.task).await.unwrap().unwrap();
        assert!(matches!(reason, StopReason::DecodeFailed(_)));
        assert_eq!(*h.state.borrow(), ConnectionState::Closed);

        let outcome = timeout(TEST_TIMEOUT, rx).await.unwrap().unwrap();
        assert!(matches!(outcome, Err(RpcError::ConnectionClosed)));

        // buffered payloads drain, then the subscription ends
        let first = timeout(TEST_TIMEOUT, sub.next()).await.unwrap();
        assert_eq!(first, Some(Value::from("before the corruption")));
        assert_eq!(timeout(TEST_TIMEOUT, sub.next()).await.unwrap(), None);
        assert!(h.registry.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_releases_dispatcher_blocked_on_full_subscriber() {
        let mut h = start();
        let _sub = h.registry.subscribe("42", 1);

        send(&mut h.peer, notification("42", "fills the channel")).await;
        send(&mut h.peer, notification("42", "blocks the dispatcher")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!h.task.is_finished());

        transport::advance_state(&h.state, ConnectionState::Closed);
        let reason = timeout(TEST_TIMEOUT, h.task).await.unwrap().unwrap();
        assert!(matches!(reason, StopReason::Shutdown));
    }

    #[tokio::test]
    async fn test_dropped_subscriber_does_not_wedge_dispatcher() {
        let mut h = start();
        let sub = h.registry.subscribe("42", 1);
        let (id, rx) = h.pending.register().unwrap();

        send(&mut h.peer, notification("42", "fills the channel")).await;
        send(&mut h.peer, notification("42", "blocks the dispatcher")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(sub);

        send(
            &mut h.peer,
            Message::Response {
                id,
                error: None,
                result: Value::from(true),
            },
        )
        .await;
        let outcome = timeout(TEST_TIMEOUT, rx).await.unwrap().unwrap();
        assert_eq!(outcome.unwrap(), Value::from(true));
        assert_eq!(h.registry.subscriber_count("42"), 0);
    }
}
