//! Neovim msgpack-RPC client library
//!
//! This library provides the pieces needed to talk to a running Neovim:
//!
//! - `value` - Dynamically typed msgpack values and serde conversion
//! - `message` - The three msgpack-RPC message kinds and their wire form
//! - `rpc` - Connection engine: decoder, transport, dispatcher, client
//! - `config` - Endpoint parsing and client configuration
//! - `api` - Typed wrappers over a handful of Neovim API functions
//!
//! # Quick Start
//!
//! ```ignore
//! use nvim_rpc::{ClientConfig, Nvim};
//!
//! let nvim = Nvim::connect(ClientConfig::from_env()?).await?;
//! let answer = nvim.eval("(3+2)*4").await?;
//! let mut events = nvim.create_autocmd(&["BufEnter"], Default::default()).await?;
//! ```

pub mod api;
pub mod config;
pub mod message;
pub mod rpc;
pub mod value;

pub use api::{AutocmdOptions, Nvim};
pub use config::{ClientConfig, ConfigError, Endpoint};
pub use message::{Message, MessageKind, RemoteError};
pub use rpc::{Client, ConnectionState, RpcError, Subscription};
pub use value::Value;
