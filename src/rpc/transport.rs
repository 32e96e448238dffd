//! Duplex byte transport for the RPC connection.
//!
//! A connection is split into a [`ByteStream`] (read side, owned by the
//! dispatcher) and a [`FrameWriter`] (write side, owned by the client and
//! shared by callers through a lock). Neovim listens on either a TCP address
//! or a Unix domain socket, see [`Endpoint`].

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::config::Endpoint;
use crate::rpc::RpcError;

/// Read buffer size for a single chunk.
const READ_CHUNK_SIZE: usize = 16 * 1024;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Lifecycle of a connection. Transitions only move forward; there is no
/// reconnection within one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Connected,
    Closed,
}

/// Move the published state forward to `next`.
///
/// Returns `false` if the state was already at or past `next`.
pub(crate) fn advance_state(state: &watch::Sender<ConnectionState>, next: ConnectionState) -> bool {
    state.send_if_modified(|current| {
        if next > *current {
            *current = next;
            true
        } else {
            false
        }
    })
}

/// Resolves once the published state reaches `Closed`, or its sender is gone.
pub(crate) async fn closed(state: &mut watch::Receiver<ConnectionState>) {
    let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
}

/// Resolve `endpoint` and open a connection to it.
///
/// For TCP endpoints every resolved address is tried in order and the last
/// failure is reported.
///
/// # Errors
///
/// Returns `RpcError::Connect` if resolution fails, no address accepts the
/// connection, or the Unix socket cannot be opened.
pub async fn connect(endpoint: &Endpoint) -> Result<(ByteStream, FrameWriter), RpcError> {
    let connect_err = |source: io::Error| RpcError::Connect {
        endpoint: endpoint.to_string(),
        source,
    };

    match endpoint {
        Endpoint::Tcp { host, port } => {
            let addrs = tokio::net::lookup_host((host.as_str(), *port))
                .await
                .map_err(connect_err)?;

            let mut last_error = None;
            for addr in addrs {
                debug!("Connecting to {}", addr);
                match TcpStream::connect(addr).await {
                    Ok(stream) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Failed to set TCP_NODELAY: {}", e);
                        }
                        let (read_half, write_half) = stream.into_split();
                        return Ok((
                            ByteStream::new(Box::new(read_half)),
                            FrameWriter::new(Box::new(write_half)),
                        ));
                    }
                    Err(e) => last_error = Some(e),
                }
            }

            Err(connect_err(last_error.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
            })))
        }
        #[cfg(unix)]
        Endpoint::Unix(path) => {
            let stream = tokio::net::UnixStream::connect(path)
                .await
                .map_err(connect_err)?;
            let (read_half, write_half) = stream.into_split();
            Ok((
                ByteStream::new(Box::new(read_half)),
                FrameWriter::new(Box::new(write_half)),
            ))
        }
        #[cfg(not(unix))]
        Endpoint::Unix(_) => Err(connect_err(io::Error::new(
            io::ErrorKind::Unsupported,
            "Unix domain sockets are not supported on this platform",
        ))),
    }
}

/// Split an already-established duplex stream into transport halves.
pub fn split<S>(stream: S) -> (ByteStream, FrameWriter)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    (
        ByteStream::new(Box::new(read_half)),
        FrameWriter::new(Box::new(write_half)),
    )
}

/// Lazy sequence of raw byte chunks read from the connection.
pub struct ByteStream {
    reader: BoxedReader,
    buf: Vec<u8>,
}

impl ByteStream {
    pub fn new(reader: BoxedReader) -> Self {
        Self {
            reader,
            buf: vec![0u8; READ_CHUNK_SIZE],
        }
    }

    /// Read the next chunk of bytes.
    ///
    /// Returns `Ok(None)` once the peer has closed the connection. This is
    /// cancel-safe: dropping the future before it completes loses no data.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Io` on any read failure other than interruption.
    pub async fn next_chunk(&mut self) -> Result<Option<&[u8]>, RpcError> {
        loop {
            let read = self.reader.read(&mut self.buf).await;
            match read {
                Ok(0) => return Ok(None),
                Ok(n) => {
                    trace!("Read {} bytes", n);
                    return Ok(Some(&self.buf[..n]));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(RpcError::Io(e)),
            }
        }
    }
}

/// Write side of the connection.
pub struct FrameWriter {
    writer: Option<BoxedWriter>,
}

impl FrameWriter {
    pub fn new(writer: BoxedWriter) -> Self {
        Self {
            writer: Some(writer),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }

    /// Write a complete frame and flush it.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::ConnectionClosed` if the writer was closed, or
    /// `RpcError::Io` if the write fails. A failed writer is closed, so
    /// later sends fail fast. So is one whose send was dropped before it
    /// finished, as part of a frame may already be on the wire.
    pub async fn send(&mut self, frame: &[u8]) -> Result<(), RpcError> {
        let mut writer = self.writer.take().ok_or(RpcError::ConnectionClosed)?;

        let result = async {
            writer.write_all(frame).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = result {
            return Err(RpcError::Io(e));
        }
        self.writer = Some(writer);

        trace!("Wrote frame of {} bytes", frame.len());
        Ok(())
    }

    /// Shut down the write side. Idempotent.
    pub async fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("Error shutting down writer: {}", e);
            }
        }
    }
}
