//! Typed wrappers over a subset of the Neovim API.
//!
//! Each wrapper is a single [`Client::call`] plus a conversion of the result.
//! Shape mismatches in results are reported as `RpcError::Convert`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::config::ClientConfig;
use crate::rpc::{Client, RpcError, Subscription};
use crate::value::Value;

/// Registers an autocmd whose callback forwards the event dict to this
/// client as a notification. Arguments: events, opts, channel, topic.
const CREATE_AUTOCMD_LUA: &str = r#"
local events, opts, channel, topic = ...
opts.callback = function(ev)
  vim.rpcnotify(channel, topic, ev)
end
return vim.api.nvim_create_autocmd(events, opts)
"#;

/// Options for [`Nvim::create_autocmd`]. Unset fields are left out of the
/// options dict.
#[derive(Debug, Clone, Default)]
pub struct AutocmdOptions {
    /// Augroup id, see [`Nvim::create_augroup`]
    pub group: Option<i64>,
    pub pattern: Vec<String>,
    pub buffer: Option<i64>,
    pub once: bool,
    pub desc: Option<String>,
}

impl AutocmdOptions {
    fn to_value(&self) -> Value {
        let mut opts: Vec<(Value, Value)> = Vec::new();
        if let Some(group) = self.group {
            opts.push(("group".into(), group.into()));
        }
        if !self.pattern.is_empty() {
            opts.push(("pattern".into(), self.pattern.clone().into()));
        }
        if let Some(buffer) = self.buffer {
            opts.push(("buffer".into(), buffer.into()));
        }
        if self.once {
            opts.push(("once".into(), true.into()));
        }
        if let Some(desc) = &self.desc {
            opts.push(("desc".into(), desc.as_str().into()));
        }
        Value::Map(opts)
    }
}

#[derive(Debug, Deserialize)]
struct Exec2Output {
    #[serde(default)]
    output: String,
}

/// A Neovim instance reached through a [`Client`].
pub struct Nvim {
    client: Client,
    channel: OnceCell<i64>,
    next_topic: AtomicU64,
}

impl Nvim {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            channel: OnceCell::new(),
            next_topic: AtomicU64::new(0),
        }
    }

    /// Connect to `config.endpoint` and wrap the resulting client.
    pub async fn connect(config: ClientConfig) -> Result<Self, RpcError> {
        Ok(Self::new(Client::connect(config).await?))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// `nvim_get_api_info`: this client's channel id and the API metadata.
    pub async fn get_api_info(&self) -> Result<(i64, Value), RpcError> {
        let info = self.client.call("nvim_get_api_info", vec![]).await?;
        let mut items = info
            .into_array()
            .filter(|items| items.len() == 2)
            .ok_or_else(|| {
                RpcError::Convert("nvim_get_api_info: expected [channel, metadata]".to_string())
            })?;

        let metadata = items.pop().unwrap_or_default();
        let channel = expect_i64("nvim_get_api_info", &items[0])?;
        Ok((channel, metadata))
    }

    /// Channel id of this connection, as seen by Neovim. Fetched once.
    pub async fn channel_id(&self) -> Result<i64, RpcError> {
        self.channel
            .get_or_try_init(|| async {
                let (channel, _) = self.get_api_info().await?;
                debug!("RPC channel id is {}", channel);
                Ok::<_, RpcError>(channel)
            })
            .await
            .copied()
    }

    /// `nvim_eval`: evaluate a Vimscript expression.
    pub async fn eval(&self, expr: &str) -> Result<Value, RpcError> {
        self.client.call("nvim_eval", vec![expr.into()]).await
    }

    /// `nvim_command`: run an Ex command.
    pub async fn command(&self, command: &str) -> Result<(), RpcError> {
        self.client.call("nvim_command", vec![command.into()]).await?;
        Ok(())
    }

    /// `nvim_exec2`: run a Vimscript chunk. Returns its output when `output`
    /// is set, an empty string otherwise.
    pub async fn exec2(&self, src: &str, output: bool) -> Result<String, RpcError> {
        let opts: Value = [("output", output)].into_iter().collect();
        let result: Exec2Output = self
            .client
            .call_as("nvim_exec2", vec![src.into(), opts])
            .await?;
        Ok(result.output)
    }

    /// `nvim_exec_lua`: run a Lua chunk with `...` bound to `args`.
    pub async fn exec_lua(&self, code: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self.client
            .call("nvim_exec_lua", vec![code.into(), Value::Array(args)])
            .await
    }

    /// `nvim_get_current_buf`
    pub async fn get_current_buf(&self) -> Result<i64, RpcError> {
        let buf = self.client.call("nvim_get_current_buf", vec![]).await?;
        handle_from_value("nvim_get_current_buf", &buf)
    }

    /// `nvim_get_current_win`
    pub async fn get_current_win(&self) -> Result<i64, RpcError> {
        let win = self.client.call("nvim_get_current_win", vec![]).await?;
        handle_from_value("nvim_get_current_win", &win)
    }

    /// `nvim_buf_set_lines`: replace lines `start..end` (end-exclusive,
    /// negative indices count from the end) of `buffer`.
    pub async fn buf_set_lines(
        &self,
        buffer: i64,
        start: i64,
        end: i64,
        strict_indexing: bool,
        lines: &[&str],
    ) -> Result<(), RpcError> {
        let lines: Vec<Value> = lines.iter().map(|l| Value::from(*l)).collect();
        self.client
            .call(
                "nvim_buf_set_lines",
                vec![
                    buffer.into(),
                    start.into(),
                    end.into(),
                    strict_indexing.into(),
                    Value::Array(lines),
                ],
            )
            .await?;
        Ok(())
    }

    /// `nvim_create_augroup`
    pub async fn create_augroup(&self, name: &str, clear: bool) -> Result<i64, RpcError> {
        let opts: Value = [("clear", clear)].into_iter().collect();
        let id = self
            .client
            .call("nvim_create_augroup", vec![name.into(), opts])
            .await?;
        expect_i64("nvim_create_augroup", &id)
    }

    /// Create an autocmd for `events` and subscribe to its firings.
    ///
    /// Each firing arrives as the notification params `[ev]`, where `ev` is
    /// the event dict Neovim passes to autocmd callbacks (`event`, `buf`,
    /// `file`, ...). The subscription is registered before the autocmd, so no
    /// firing is missed.
    pub async fn create_autocmd(
        &self,
        events: &[&str],
        opts: AutocmdOptions,
    ) -> Result<Subscription, RpcError> {
        let channel = self.channel_id().await?;
        let topic = format!(
            "nvim_rpc.autocmd.{}",
            self.next_topic.fetch_add(1, Ordering::Relaxed)
        );
        let subscription = self.client.subscribe(topic.as_str());

        let events: Vec<Value> = events.iter().map(|e| Value::from(*e)).collect();
        let id = self
            .exec_lua(
                CREATE_AUTOCMD_LUA,
                vec![
                    Value::Array(events),
                    opts.to_value(),
                    channel.into(),
                    topic.as_str().into(),
                ],
            )
            .await?;
        debug!("Created autocmd {} notifying {}", id, topic);

        Ok(subscription)
    }
}

fn expect_i64(method: &str, value: &Value) -> Result<i64, RpcError> {
    value.as_i64().ok_or_else(|| {
        RpcError::Convert(format!(
            "{method}: expected integer, got {}",
            value.type_name()
        ))
    })
}

/// Buffer, window and tabpage handles arrive as msgpack ext values whose
/// payload is the msgpack-encoded integer id.
fn handle_from_value(method: &str, value: &Value) -> Result<i64, RpcError> {
    match value {
        Value::Ext(_, data) => {
            let inner = rmpv::decode::read_value(&mut data.as_slice())
                .map_err(|e| RpcError::Convert(format!("{method}: bad handle: {e}")))?;
            expect_i64(method, &Value::from(inner))
        }
        other => expect_i64(method, other),
    }
}
