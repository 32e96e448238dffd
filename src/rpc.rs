//! msgpack-RPC connection engine.
//!
//! One [`Client`] drives one connection to a Neovim instance listening on a
//! TCP port or a Unix domain socket (`nvim --listen <addr>`).
//!
//! # Architecture
//!
//! ```text
//!   callers ──call()──► CorrelationTable ◄──complete()──┐
//!      │                                                 │
//!      └──► FrameWriter ══════ socket ══════► ByteStream ─► FrameDecoder ─► Dispatcher
//!                                                                              │
//!   Subscription ◄──── bounded channel ◄──── NotificationRegistry ◄────────────┘
//! ```
//!
//! Requests are written under a single writer lock. The dispatcher task is
//! the only reader: it completes pending calls by message id and fans
//! notifications out to topic subscribers, waiting for room in their
//! channels. When the connection ends, for whatever reason, every pending
//! call fails with `ConnectionClosed` and every subscription ends.
//!
//! # Usage
//!
//! ```ignore
//! use nvim_rpc::rpc::Client;
//! use nvim_rpc::{ClientConfig, Value};
//!
//! let client = Client::connect(ClientConfig::default()).await?;
//! let mut events = client.subscribe("42");
//! let result = client.call("nvim_eval", vec![Value::from("(3+2)*4")]).await?;
//! while let Some(event) = events.next().await {
//!     println!("{event}");
//! }
//! ```

mod client;
mod decoder;
mod dispatcher;
mod error;
mod pending;
mod registry;
pub mod transport;

pub use client::Client;
pub use decoder::{FrameDecoder, MAX_FRAME_SIZE};
pub use dispatcher::{Dispatcher, StopReason};
pub use error::{DecodeError, RpcError};
pub use pending::{CallOutcome, CorrelationTable, PendingGuard};
pub use registry::{NotificationRegistry, Subscription};
pub use transport::{ByteStream, ConnectionState, FrameWriter};
