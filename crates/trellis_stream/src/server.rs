//! Stream server: runs sub-graphs forked to this process.

use crate::creator::StreamCreator;
use crate::error::{StreamError, StreamResult};
use crate::stream::ServerStream;
use crate::transport::Channel;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use trellis_runtime::Engine;

/// Stream server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamServerConfig {
    /// Start sub-graphs from the requested task queue instead of the stream task
    pub async_mode: bool,
    /// Poll interval while stopping
    pub stop_poll_ms: u64,
}

impl Default for StreamServerConfig {
    fn default() -> Self {
        Self {
            async_mode: true,
            stop_poll_ms: 10,
        }
    }
}

impl StreamServerConfig {
    /// Set async mode
    #[must_use]
    pub fn with_async_mode(mut self, async_mode: bool) -> Self {
        self.async_mode = async_mode;
        self
    }

    /// Set the stop poll interval
    #[must_use]
    pub fn with_stop_poll_ms(mut self, stop_poll_ms: u64) -> Self {
        self.stop_poll_ms = stop_poll_ms;
        self
    }
}

/// Accepts streams and runs one sub-graph per stream
#[derive(Debug)]
pub struct StreamServer {
    engine: Arc<Engine>,
    creator: Arc<StreamCreator>,
    config: StreamServerConfig,
    runtime: Handle,
}

impl StreamServer {
    /// Create a server on the current tokio runtime
    ///
    /// # Errors
    ///
    /// Returns error if called outside a tokio runtime
    pub fn new(engine: Arc<Engine>, config: StreamServerConfig) -> StreamResult<Arc<Self>> {
        let runtime = Handle::try_current().map_err(|e| StreamError::NoRuntime(e.to_string()))?;
        Ok(Self::with_runtime(engine, config, runtime))
    }

    /// Create a server spawning stream tasks on `runtime`
    #[must_use]
    pub fn with_runtime(engine: Arc<Engine>, config: StreamServerConfig, runtime: Handle) -> Arc<Self> {
        let creator = StreamCreator::new(Duration::from_millis(config.stop_poll_ms));
        Arc::new(Self {
            engine,
            creator,
            config,
            runtime,
        })
    }

    /// The engine sub-graphs run on
    #[must_use]
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Streams in flight
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.creator.outstanding()
    }

    /// Take over one end of a stream
    ///
    /// # Errors
    ///
    /// Returns `Stopped` once [`StreamServer::stop`] was called
    pub fn accept(&self, channel: Channel) -> StreamResult<()> {
        let guard = self.creator.acquire().ok_or(StreamError::Stopped)?;
        let Channel { sender, receiver } = channel;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let stream = ServerStream::new(
            Arc::clone(&self.engine),
            self.config.async_mode,
            sender,
            events_tx,
        );
        self.runtime.spawn(stream.run(receiver, events_rx, guard));
        Ok(())
    }

    /// Refuse new streams and wait for running ones to end
    pub async fn stop(&self) {
        self.creator.stop().await;
    }
}
