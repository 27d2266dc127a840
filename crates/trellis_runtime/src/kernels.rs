//! Built-in kernels.
//!
//! | name          | inputs | outputs | behaviour                                  |
//! |---------------|--------|---------|--------------------------------------------|
//! | `source`      |        | `out`   | emits the configured `values`              |
//! | `passthrough` | `in`   | `out`   | forwards every item                        |
//! | `collect`     | `in`   |         | appends items to the graph result          |
//! | `async_wait`  | `in`   | `out`   | forwards whatever arrives on its pipe      |
//! | `fail`        | `in`   | `out`   | fails on its first compute                 |
//! | `border_send` | `in`   |         | encodes items into border frames           |
//! | `border_recv` |        | `out`   | decodes border frames arriving on its pipe |

use crate::data::{ANY_TYPE, Data, DataCodecs, data};
use crate::error::KernelError;
use crate::kernel::{ComputeContext, ComputeStatus, InitContext, Kernel, KernelDef, KernelRegistry};
use crate::pipe::{ActivateStrategy, AsyncPipe};
use crate::border::BorderHub;
use bytes::Bytes;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use trellis_core::{BorderFrame, ConfigContext, CoreError};

/// Kernel name of [`Source`]
pub const SOURCE: &str = "source";
/// Kernel name of [`Passthrough`]
pub const PASSTHROUGH: &str = "passthrough";
/// Kernel name of [`Collect`]
pub const COLLECT: &str = "collect";
/// Kernel name of [`AsyncWait`]
pub const ASYNC_WAIT: &str = "async_wait";
/// Kernel name of [`Fail`]
pub const FAIL: &str = "fail";
/// Kernel name of [`BorderSend`]
pub const BORDER_SEND: &str = "border_send";
/// Kernel name of [`BorderRecv`]
pub const BORDER_RECV: &str = "border_recv";

/// Config key naming a border port
pub const PORT_KEY: &str = "port_key";
/// Config key naming the peer a border sender targets
pub const PEER_KEY: &str = "peer";

pub(crate) fn register_builtins(registry: &mut KernelRegistry) {
    registry.register(SOURCE, Source::default);
    registry.register(PASSTHROUGH, || Passthrough);
    registry.register(COLLECT, || Collect);
    registry.register(ASYNC_WAIT, || AsyncWait);
    registry.register(FAIL, Fail::default);
    registry.register(BORDER_SEND, BorderSend::default);
    registry.register(BORDER_RECV, BorderRecv::default);
}

fn invalid(key: &str, reason: impl Into<String>) -> KernelError {
    KernelError::Config(CoreError::InvalidConfig {
        key: key.to_string(),
        reason: reason.into(),
    })
}

/// Emits `values` on `out`, `batch` per compute (all at once by default).
///
/// `type` picks the item type: `json` (default) emits `serde_json::Value`,
/// `i64` emits `i64`, `string` emits `String`.
#[derive(Debug, Default)]
pub struct Source {
    pending: VecDeque<Data>,
    batch: usize,
}

impl Kernel for Source {
    fn define(&self, def: &mut KernelDef) {
        def.output("out", ANY_TYPE);
    }

    fn config(&mut self, ctx: &ConfigContext<'_>) -> Result<(), KernelError> {
        let values: Vec<Value> = ctx.required("values")?;
        let kind: String = ctx.get_or("type", "json".to_string())?;
        self.batch = ctx.get_or("batch", 0usize)?;
        self.pending = values
            .into_iter()
            .map(|value| match kind.as_str() {
                "json" => Ok(data(value)),
                "i64" => value
                    .as_i64()
                    .map(data)
                    .ok_or_else(|| invalid("values", format!("{} is not an i64", value))),
                "string" => match value {
                    Value::String(s) => Ok(data(s)),
                    other => Ok(data(other.to_string())),
                },
                other => Err(invalid("type", format!("unknown item type {}", other))),
            })
            .collect::<Result<_, _>>()?;
        Ok(())
    }

    fn compute(&mut self, ctx: &mut ComputeContext<'_>) -> Result<ComputeStatus, KernelError> {
        let count = if self.batch == 0 {
            self.pending.len()
        } else {
            self.batch.min(self.pending.len())
        };
        for item in self.pending.drain(..count) {
            ctx.write(0, item)?;
        }
        if self.pending.is_empty() {
            Ok(ComputeStatus::Finished)
        } else {
            Ok(ComputeStatus::Continue)
        }
    }
}

/// Forwards `in` to `out`
#[derive(Debug, Default)]
pub struct Passthrough;

impl Kernel for Passthrough {
    fn define(&self, def: &mut KernelDef) {
        def.input("in", ANY_TYPE).output("out", ANY_TYPE);
    }

    fn compute(&mut self, ctx: &mut ComputeContext<'_>) -> Result<ComputeStatus, KernelError> {
        for item in ctx.read_all(0) {
            ctx.write(0, item)?;
        }
        Ok(if ctx.is_eof(0) {
            ComputeStatus::Finished
        } else {
            ComputeStatus::Continue
        })
    }
}

/// Appends `in` to the graph result under the node's name
#[derive(Debug, Default)]
pub struct Collect;

impl Kernel for Collect {
    fn define(&self, def: &mut KernelDef) {
        def.input("in", ANY_TYPE);
    }

    fn compute(&mut self, ctx: &mut ComputeContext<'_>) -> Result<ComputeStatus, KernelError> {
        for item in ctx.read_all(0) {
            ctx.collect(item);
        }
        Ok(if ctx.is_eof(0) {
            ComputeStatus::Finished
        } else {
            ComputeStatus::Continue
        })
    }
}

/// Forwards items fed into its pipe by outside code; finishes on pipe EOF.
///
/// Items on `in` only trigger the first compute and are discarded.
#[derive(Debug, Default)]
pub struct AsyncWait;

impl Kernel for AsyncWait {
    fn define(&self, def: &mut KernelDef) {
        def.input("in", ANY_TYPE)
            .output("out", ANY_TYPE)
            .async_pipe(ActivateStrategy::Any, 1024);
    }

    fn compute(&mut self, ctx: &mut ComputeContext<'_>) -> Result<ComputeStatus, KernelError> {
        ctx.read_all(0);
        let pipe = Arc::clone(ctx.pipe(0)?);
        drain_pipe(&pipe, |item| ctx.write(0, item))
    }
}

// Forward everything pending; Finished on EOF, Suspended when dry.
fn drain_pipe(
    pipe: &AsyncPipe,
    mut emit: impl FnMut(Data) -> Result<(), KernelError>,
) -> Result<ComputeStatus, KernelError> {
    loop {
        let (item, eof) = pipe.get_data();
        let got = item.is_some();
        if let Some(item) = item {
            emit(item)?;
        }
        if eof {
            return Ok(ComputeStatus::Finished);
        }
        if !got {
            return Ok(ComputeStatus::Suspended);
        }
    }
}

/// Fails on its first compute: with `Err(message)`, or by returning
/// `Aborted` when `abort` is set
#[derive(Debug, Default)]
pub struct Fail {
    message: String,
    abort: bool,
}

impl Kernel for Fail {
    fn define(&self, def: &mut KernelDef) {
        def.input("in", ANY_TYPE).output("out", ANY_TYPE);
    }

    fn config(&mut self, ctx: &ConfigContext<'_>) -> Result<(), KernelError> {
        self.message = ctx.get_or("message", "kernel failed".to_string())?;
        self.abort = ctx.get_or("abort", false)?;
        Ok(())
    }

    fn compute(&mut self, _ctx: &mut ComputeContext<'_>) -> Result<ComputeStatus, KernelError> {
        if self.abort {
            Ok(ComputeStatus::Aborted)
        } else {
            Err(KernelError::Failed(self.message.clone()))
        }
    }
}

/// Sends `in` across the border as `port_key` frames to `peer` (the empty
/// peer is the hub's default outlet), then an EOF frame
#[derive(Default)]
pub struct BorderSend {
    port_key: String,
    peer: String,
    hub: Option<Arc<BorderHub>>,
    codecs: Option<Arc<DataCodecs>>,
}

impl Kernel for BorderSend {
    fn define(&self, def: &mut KernelDef) {
        def.input("in", ANY_TYPE);
    }

    fn config(&mut self, ctx: &ConfigContext<'_>) -> Result<(), KernelError> {
        self.port_key = ctx.required(PORT_KEY)?;
        self.peer = ctx.get_or(PEER_KEY, String::new())?;
        Ok(())
    }

    fn init(&mut self, ctx: &mut InitContext<'_>) -> Result<(), KernelError> {
        self.hub = Some(Arc::clone(ctx.border()));
        self.codecs = Some(Arc::clone(ctx.codecs()));
        Ok(())
    }

    fn compute(&mut self, ctx: &mut ComputeContext<'_>) -> Result<ComputeStatus, KernelError> {
        let (Some(hub), Some(codecs)) = (&self.hub, &self.codecs) else {
            return Err(KernelError::Border("border sender not initialized".to_string()));
        };
        for item in ctx.read_all(0) {
            let payload = codecs
                .encode(&item)
                .map_err(|e| KernelError::Codec(e.to_string()))?;
            hub.send(&self.peer, BorderFrame::data(self.port_key.clone(), payload))
                .map_err(KernelError::Border)?;
        }
        if !ctx.is_eof(0) {
            return Ok(ComputeStatus::Continue);
        }
        hub.send(&self.peer, BorderFrame::eof(self.port_key.clone()))
            .map_err(KernelError::Border)?;
        Ok(ComputeStatus::Finished)
    }
}

/// Emits the items of `port_key` frames arriving through the border hub
#[derive(Default)]
pub struct BorderRecv {
    port_key: String,
    pipe: Option<Arc<AsyncPipe>>,
    codecs: Option<Arc<DataCodecs>>,
}

impl Kernel for BorderRecv {
    fn define(&self, def: &mut KernelDef) {
        def.output("out", ANY_TYPE)
            .async_pipe(ActivateStrategy::Any, usize::MAX);
    }

    fn config(&mut self, ctx: &ConfigContext<'_>) -> Result<(), KernelError> {
        self.port_key = ctx.required(PORT_KEY)?;
        Ok(())
    }

    fn init(&mut self, ctx: &mut InitContext<'_>) -> Result<(), KernelError> {
        let pipe = ctx.pipe(0)?;
        ctx.border().register_inbound(&self.port_key, Arc::clone(&pipe));
        self.pipe = Some(pipe);
        self.codecs = Some(Arc::clone(ctx.codecs()));
        Ok(())
    }

    fn compute(&mut self, ctx: &mut ComputeContext<'_>) -> Result<ComputeStatus, KernelError> {
        let (Some(pipe), Some(codecs)) = (&self.pipe, &self.codecs) else {
            return Err(KernelError::Border("border receiver not initialized".to_string()));
        };
        drain_pipe(pipe, |item| {
            let payload = item.downcast_ref::<Bytes>().ok_or_else(|| {
                KernelError::Border("border payload is not bytes".to_string())
            })?;
            let decoded = codecs
                .decode(payload)
                .map_err(|e| KernelError::Codec(e.to_string()))?;
            ctx.write(0, decoded)
        })
    }
}
