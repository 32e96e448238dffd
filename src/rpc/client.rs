//! msgpack-RPC client for a Neovim instance.
//!
//! `Client` owns one connection. Callers issue requests with [`Client::call`]
//! from any number of tasks concurrently; a background task reads the
//! connection and hands each response to the call waiting for it.

use std::sync::{Arc, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::{ClientConfig, Endpoint};
use crate::message::Message;
use crate::rpc::dispatcher::{Dispatcher, StopReason};
use crate::rpc::pending::{CorrelationTable, PendingGuard};
use crate::rpc::registry::{NotificationRegistry, Subscription};
use crate::rpc::transport::{self, ConnectionState, FrameWriter};
use crate::rpc::RpcError;
use crate::value::{self, Value};

/// Client for one Neovim connection.
///
/// # Connection Lifecycle
///
/// - `new()` - Start connecting in the background; calls made meanwhile wait
/// - `connect()` - Connect and wait until the connection is up
/// - `from_stream()` - Use an already established stream
/// - `close()` - Fail outstanding calls and shut the connection down
///
/// Dropping the client closes the connection as well.
///
/// # Example
///
/// ```ignore
/// use nvim_rpc::{Client, ClientConfig, Value};
///
/// let client = Client::connect(ClientConfig::from_env()?).await?;
/// let n = client.call("nvim_eval", vec![Value::from("(3+2)*4")]).await?;
/// assert_eq!(n.as_i64(), Some(20));
/// ```
pub struct Client {
    config: ClientConfig,
    pending: Arc<CorrelationTable>,
    registry: Arc<NotificationRegistry>,
    state: Arc<watch::Sender<ConnectionState>>,
    /// Single writer; the lock queues concurrent senders in FIFO order.
    writer: Arc<AsyncMutex<Option<FrameWriter>>>,
    task: Mutex<Option<JoinHandle<StopReason>>>,
}

impl Client {
    fn with_config(
        config: ClientConfig,
        initial: ConnectionState,
        writer: Option<FrameWriter>,
    ) -> Self {
        let (state, _) = watch::channel(initial);
        Self {
            config,
            pending: Arc::new(CorrelationTable::new()),
            registry: Arc::new(NotificationRegistry::new()),
            state: Arc::new(state),
            writer: Arc::new(AsyncMutex::new(writer)),
            task: Mutex::new(None),
        }
    }

    /// Start connecting to `config.endpoint` in the background and return
    /// immediately.
    ///
    /// Calls issued before the connection is up wait for it. If connecting
    /// fails, the client is closed and those calls fail with
    /// `RpcError::ConnectionClosed`.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(config: ClientConfig) -> Self {
        let client = Self::with_config(config, ConnectionState::Connecting, None);

        let endpoint = client.config.endpoint.clone();
        let max_frame_size = client.config.max_frame_size;
        let pending = client.pending.clone();
        let registry = client.registry.clone();
        let state = client.state.clone();
        let writer = client.writer.clone();

        let task = tokio::spawn(async move {
            let mut shutdown = state.subscribe();
            let connected = tokio::select! {
                biased;
                _ = transport::closed(&mut shutdown) => None,
                result = transport::connect(&endpoint) => Some(result),
            };

            match connected {
                Some(Ok((stream, frame_writer))) => {
                    *writer.lock().await = Some(frame_writer);
                    if !transport::advance_state(&state, ConnectionState::Connected) {
                        // Closed while connecting
                        pending.close_all();
                        registry.close_all();
                        return StopReason::Shutdown;
                    }
                    info!("Connected to {}", endpoint);
                    Dispatcher::new(pending, registry, state, max_frame_size)
                        .run(stream)
                        .await
                }
                Some(Err(e)) => {
                    error!("{}", e);
                    transport::advance_state(&state, ConnectionState::Closed);
                    pending.close_all();
                    registry.close_all();
                    StopReason::ConnectFailed(e)
                }
                None => {
                    pending.close_all();
                    registry.close_all();
                    StopReason::Shutdown
                }
            }
        });

        client.set_task(task);
        client
    }

    /// Connect to `config.endpoint` and wait until the connection is up.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Connect` if the endpoint cannot be reached.
    pub async fn connect(config: ClientConfig) -> Result<Self, RpcError> {
        let client = Self::new(config);
        if client.wait_connected().await.is_ok() {
            return Ok(client);
        }

        match client.take_task() {
            Some(task) => match task.await {
                Ok(StopReason::ConnectFailed(e)) => Err(e),
                _ => Err(RpcError::ConnectionClosed),
            },
            None => Err(RpcError::ConnectionClosed),
        }
    }

    /// Run the client over an already established duplex stream, such as
    /// the stdio of an embedded `nvim --embed` or an in-memory pipe.
    ///
    /// Must be called within a Tokio runtime.
    pub fn from_stream<S>(stream: S, config: ClientConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (stream, writer) = transport::split(stream);
        let client = Self::with_config(config, ConnectionState::Connected, Some(writer));

        let dispatcher = Dispatcher::new(
            client.pending.clone(),
            client.registry.clone(),
            client.state.clone(),
            client.config.max_frame_size,
        );
        client.set_task(tokio::spawn(dispatcher.run(stream)));
        client
    }

    fn set_task(&self, task: JoinHandle<StopReason>) {
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    fn take_task(&self) -> Option<JoinHandle<StopReason>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Send a request and wait for its response.
    ///
    /// Waits for the connection first if it is still being established.
    /// Concurrent calls are sent in the order they reach the writer and may
    /// complete in any order.
    ///
    /// Dropping the returned future abandons the call: its correlation entry
    /// is removed and a late response is discarded.
    ///
    /// # Errors
    ///
    /// - `RpcError::Remote` if Neovim answered with an error
    /// - `RpcError::ConnectionClosed` if the connection closed before the
    ///   response arrived, or was never established
    /// - `RpcError::Io` if the request could not be written
    /// - `RpcError::Timeout` if a call timeout is configured and elapsed
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        match self.config.call_timeout {
            Some(limit) => timeout(limit, self.send_and_wait(method, args))
                .await
                .map_err(|_| RpcError::Timeout(limit))?,
            None => self.send_and_wait(method, args).await,
        }
    }

    async fn send_and_wait(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self.wait_connected().await?;

        let (id, rx) = self.pending.register()?;
        let guard = PendingGuard::new(&self.pending, id);

        let frame = Message::Request {
            id,
            method: method.to_string(),
            args,
        }
        .encode()
        .map_err(|e| RpcError::Convert(format!("Failed to encode request: {e}")))?;

        // A peer that stops reading can leave the send blocked; closing the
        // client must still release it and the writer lock.
        let mut shutdown = self.state.subscribe();
        tokio::select! {
            biased;
            _ = transport::closed(&mut shutdown) => return Err(RpcError::ConnectionClosed),
            sent = self.write_frame(&frame) => sent?,
        }
        debug!("Sent request {} ({})", id, method);

        let outcome = rx.await.map_err(|_| RpcError::ConnectionClosed)?;
        guard.disarm();
        outcome
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<(), RpcError> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(RpcError::ConnectionClosed)?;
        writer.send(frame).await
    }

    /// Like [`call`](Self::call), converting the result into `T`.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<T, RpcError> {
        let result = self.call(method, args).await?;
        value::from_value(result)
    }

    /// Subscribe to notifications whose method is `topic`.
    pub fn subscribe(&self, topic: impl Into<String>) -> Subscription {
        self.registry.subscribe(topic, self.config.subscription_capacity)
    }

    /// Wait for the next notification on `topic`.
    ///
    /// Only notifications that arrive after this call are seen. Returns
    /// `None` if the connection closes first.
    pub async fn next_notification(&self, topic: &str) -> Option<Value> {
        let mut subscription = self.subscribe(topic);
        subscription.next().await
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Wait until the connection is up.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::ConnectionClosed` if the client closed before
    /// connecting, or has closed since.
    pub async fn wait_connected(&self) -> Result<(), RpcError> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| *s >= ConnectionState::Connected)
            .await
            .map(|s| *s)
            .map_err(|_| RpcError::ConnectionClosed)?;

        if state == ConnectionState::Connected {
            Ok(())
        } else {
            Err(RpcError::ConnectionClosed)
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.config.endpoint
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Number of calls waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Close the connection.
    ///
    /// Outstanding calls fail with `RpcError::ConnectionClosed` and every
    /// subscription ends after its buffered notifications. Calls blocked
    /// writing to a peer that stopped reading fail as well. Idempotent.
    pub async fn close(&self) {
        if transport::advance_state(&self.state, ConnectionState::Closed) {
            info!("Closing connection to {}", self.config.endpoint);
        }

        if let Some(task) = self.take_task() {
            match task.await {
                Ok(reason) => debug!("Connection task finished: {}", reason),
                Err(e) => warn!("Connection task failed: {}", e),
            }
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.close().await;
        }

        self.pending.close_all();
        self.registry.close_all();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // The background task observes this and performs the cleanup.
        transport::advance_state(&self.state, ConnectionState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::FrameDecoder;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::net::TcpListener;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Read requests from the peer side until `count` have arrived.
    async fn read_requests(
        peer: &mut DuplexStream,
        count: usize,
    ) -> Vec<(u32, String, Vec<Value>)> {
        let mut decoder = FrameDecoder::new();
        let mut requests = Vec::new();
        let mut buf = [0u8; 1024];
        while requests.len() < count {
            let n = peer.read(&mut buf).await.unwrap();
            assert!(n > 0, "client closed the connection");
            for msg in decoder.decode_chunk(&buf[..n]).unwrap() {
                if let Message::Request { id, method, args } = msg {
                    requests.push((id, method, args));
                }
            }
        }
        requests
    }

    async fn respond(peer: &mut DuplexStream, id: u32, result: Value) {
        let frame = Message::Response {
            id,
            error: None,
            result,
        }
        .encode()
        .unwrap();
        peer.write_all(&frame).await.unwrap();
    }

    #[tokio::test]
    async fn test_call_over_stream() {
        let (ours, mut peer) = tokio::io::duplex(4096);
        let client = Client::from_stream(ours, ClientConfig::default());
        assert!(client.is_connected());

        let server = async {
            let requests = read_requests(&mut peer, 1).await;
            let (id, method, args) = &requests[0];
            assert_eq!(method, "nvim_eval");
            assert_eq!(args, &vec![Value::from("(3+2)*4")]);
            respond(&mut peer, *id, Value::from(20)).await;
        };

        let (result, ()) = timeout(TEST_TIMEOUT, async {
            tokio::join!(
                client.call("nvim_eval", vec![Value::from("(3+2)*4")]),
                server
            )
        })
        .await
        .expect("Test timed out");

        assert_eq!(result.unwrap(), Value::from(20));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_call_as_converts_result() {
        let (ours, mut peer) = tokio::io::duplex(4096);
        let client = Client::from_stream(ours, ClientConfig::default());

        let server = async {
            let requests = read_requests(&mut peer, 1).await;
            let reply = Value::Array(vec![Value::from("a"), Value::from("b")]);
            respond(&mut peer, requests[0].0, reply).await;
        };

        let (lines, ()) = timeout(TEST_TIMEOUT, async {
            tokio::join!(
                client.call_as::<Vec<String>>("nvim_buf_get_lines", vec![]),
                server
            )
        })
        .await
        .expect("Test timed out");

        assert_eq!(lines.unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_entry() {
        let (ours, _peer) = tokio::io::duplex(4096);
        let config = ClientConfig::default().with_call_timeout(Duration::from_millis(50));
        let client = Client::from_stream(ours, config);

        let err = client.call("nvim_eval", vec![]).await.unwrap_err();
        assert!(matches!(err, RpcError::Timeout(_)));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_dropped_call_removes_pending_entry() {
        let (ours, _peer) = tokio::io::duplex(4096);
        let client = Client::from_stream(ours, ClientConfig::default());

        let call = client.call("nvim_eval", vec![]);
        let abandoned = timeout(Duration::from_millis(50), call).await;
        assert!(abandoned.is_err());
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_outstanding_calls() {
        let (ours, mut peer) = tokio::io::duplex(4096);
        let client = Client::from_stream(ours, ClientConfig::default());

        let closer = async {
            read_requests(&mut peer, 1).await;
            client.close().await;
        };
        let (result, ()) = timeout(TEST_TIMEOUT, async {
            tokio::join!(client.call("nvim_eval", vec![]), closer)
        })
        .await
        .expect("Test timed out");

        assert!(matches!(result, Err(RpcError::ConnectionClosed)));
        assert_eq!(client.state(), ConnectionState::Closed);

        // closed clients reject new calls and end new subscriptions
        let err = client.call("nvim_eval", vec![]).await.unwrap_err();
        assert!(matches!(err, RpcError::ConnectionClosed));
        let mut sub = client.subscribe("42");
        assert_eq!(sub.next().await, None);

        client.close().await;
    }

    #[tokio::test]
    async fn test_close_releases_call_blocked_on_write() {
        // The peer stays open but never reads, so the request cannot be
        // written past the pipe's capacity.
        let (ours, _peer) = tokio::io::duplex(64);
        let client = Client::from_stream(ours, ClientConfig::default());

        let closer = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(client.pending_calls(), 1);
            client.close().await;
        };
        let (result, ()) = timeout(TEST_TIMEOUT, async {
            tokio::join!(
                client.call("nvim_eval", vec![Value::from("x".repeat(4096))]),
                closer
            )
        })
        .await
        .expect("Test timed out");

        assert!(matches!(result, Err(RpcError::ConnectionClosed)));
        assert_eq!(client.pending_calls(), 0);
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_connect_reports_unreachable_endpoint() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = ClientConfig::new(Endpoint::Tcp {
            host: "127.0.0.1".to_string(),
            port,
        });

        let result = timeout(TEST_TIMEOUT, Client::connect(config))
            .await
            .expect("Test timed out");
        assert!(matches!(result, Err(RpcError::Connect { .. })));
    }

    #[tokio::test]
    async fn test_calls_fail_when_background_connect_fails() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = Client::new(ClientConfig::new(Endpoint::Tcp {
            host: "127.0.0.1".to_string(),
            port,
        }));

        let err = timeout(TEST_TIMEOUT, client.call("nvim_eval", vec![]))
            .await
            .expect("Test timed out")
            .unwrap_err();
        assert!(matches!(err, RpcError::ConnectionClosed));
        assert_eq!(client.state(), ConnectionState::Closed);
    }
}
