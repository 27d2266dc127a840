//! Border hub: where frames leave and enter a graph.
//!
//! Outbound frames go to an outlet chosen by peer name; a forked sub-graph
//! registers its sending side as an outlet, and a remote side sends back
//! through its default outlet. Inbound frames are routed by port key to the
//! pipe a receiving kernel registered. Frames that arrive before the
//! receiver registers are held until it does.

use crate::data::data;
use crate::pipe::AsyncPipe;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use trellis_core::BorderFrame;

fn feed(pipe: &AsyncPipe, frame: BorderFrame) {
    let BorderFrame { port, payload, eof } = frame;
    if !payload.is_empty() || !eof {
        if let Err(e) = pipe.set_data(data(payload)) {
            tracing::warn!(port = %port, error = %e, "Dropped inbound border frame");
            return;
        }
    }
    if eof {
        if let Err(e) = pipe.set_eof() {
            tracing::debug!(port = %port, error = %e, "Border EOF on closed pipe");
        }
    }
}

/// Destination of outbound frames
pub trait BorderOutlet: Send + Sync {
    /// Deliver one frame
    ///
    /// # Errors
    ///
    /// Returns error if the other side is gone
    fn send(&self, frame: BorderFrame) -> Result<(), String>;
}

enum Inbound {
    Pending(Vec<BorderFrame>),
    Bound(Arc<AsyncPipe>),
}

/// Per-graph frame router
#[derive(Default)]
pub struct BorderHub {
    inbound: Mutex<IndexMap<String, Inbound>>,
    outlets: RwLock<IndexMap<String, Arc<dyn BorderOutlet>>>,
    default_outlet: RwLock<Option<Arc<dyn BorderOutlet>>>,
}

impl BorderHub {
    /// Create an empty hub
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route frames for `port` into `pipe`, flushing any held frames
    pub fn register_inbound(&self, port: &str, pipe: Arc<AsyncPipe>) {
        let held = {
            let mut inbound = self.inbound.lock();
            match inbound.insert(port.to_string(), Inbound::Bound(Arc::clone(&pipe))) {
                Some(Inbound::Pending(frames)) => frames,
                _ => Vec::new(),
            }
        };
        for frame in held {
            feed(&pipe, frame);
        }
    }

    /// Route one inbound frame
    pub fn deliver(&self, frame: BorderFrame) {
        let pipe = {
            let mut inbound = self.inbound.lock();
            match inbound.get_mut(&frame.port) {
                Some(Inbound::Bound(pipe)) => Arc::clone(pipe),
                Some(Inbound::Pending(frames)) => {
                    frames.push(frame);
                    return;
                }
                None => {
                    inbound.insert(frame.port.clone(), Inbound::Pending(vec![frame]));
                    return;
                }
            }
        };
        feed(&pipe, frame);
    }

    /// Frames held for ports nobody registered yet
    #[must_use]
    pub fn pending_frames(&self) -> usize {
        self.inbound
            .lock()
            .values()
            .map(|entry| match entry {
                Inbound::Pending(frames) => frames.len(),
                Inbound::Bound(_) => 0,
            })
            .sum()
    }

    /// Send frames for `peer` to `outlet`
    pub fn add_outlet(&self, peer: &str, outlet: Arc<dyn BorderOutlet>) {
        self.outlets.write().insert(peer.to_string(), outlet);
    }

    /// Outlet used for the empty peer name
    pub fn set_default_outlet(&self, outlet: Arc<dyn BorderOutlet>) {
        *self.default_outlet.write() = Some(outlet);
    }

    /// Whether frames for `peer` have somewhere to go
    #[must_use]
    pub fn has_outlet(&self, peer: &str) -> bool {
        if peer.is_empty() {
            self.default_outlet.read().is_some()
        } else {
            self.outlets.read().contains_key(peer)
        }
    }

    /// Send a frame towards `peer`; the empty name selects the default
    /// outlet
    ///
    /// # Errors
    ///
    /// Returns error if no outlet matches or the outlet fails
    pub fn send(&self, peer: &str, frame: BorderFrame) -> Result<(), String> {
        let outlet = if peer.is_empty() {
            self.default_outlet.read().clone()
        } else {
            self.outlets.read().get(peer).cloned()
        };
        match outlet {
            Some(outlet) => outlet.send(frame),
            None => Err(format!("No border outlet for peer '{}'", peer)),
        }
    }
}

impl std::fmt::Debug for BorderHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BorderHub")
            .field("inbound", &self.inbound.lock().len())
            .field("outlets", &self.outlets.read().len())
            .finish_non_exhaustive()
    }
}

/// Outlet that delivers straight into another hub in the same process
#[derive(Debug, Clone)]
pub struct HubOutlet(Weak<BorderHub>);

impl HubOutlet {
    /// Create an outlet into `hub`
    #[must_use]
    pub fn new(hub: &Arc<BorderHub>) -> Self {
        Self(Arc::downgrade(hub))
    }
}

impl BorderOutlet for HubOutlet {
    fn send(&self, frame: BorderFrame) -> Result<(), String> {
        let hub = self
            .0
            .upgrade()
            .ok_or_else(|| "Border hub dropped".to_string())?;
        hub.deliver(frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::ReadyBitMap;
    use crate::pipe::PipeSpec;
    use bytes::Bytes;

    fn pipe() -> Arc<AsyncPipe> {
        Arc::new(AsyncPipe::new(
            PipeSpec::default(),
            Arc::new(ReadyBitMap::new(0, 1)),
            0,
        ))
    }

    fn payload(item: &Option<crate::data::Data>) -> Option<Bytes> {
        item.as_ref()
            .and_then(|d| d.downcast_ref::<Bytes>().cloned())
    }

    #[test]
    fn test_frames_held_until_registration() {
        let hub = BorderHub::new();
        hub.deliver(BorderFrame::data("p", vec![1u8]));
        hub.deliver(BorderFrame::eof("p"));
        assert_eq!(hub.pending_frames(), 2);

        let pipe = pipe();
        hub.register_inbound("p", Arc::clone(&pipe));
        assert_eq!(hub.pending_frames(), 0);

        let (item, eof) = pipe.get_data();
        assert_eq!(payload(&item), Some(Bytes::from_static(&[1])));
        assert!(eof);
    }

    #[test]
    fn test_deliver_after_registration() {
        let hub = BorderHub::new();
        let pipe = pipe();
        hub.register_inbound("p", Arc::clone(&pipe));
        hub.deliver(BorderFrame::data("p", vec![7u8]));
        assert_eq!(pipe.len(), 1);
    }

    #[test]
    fn test_outlets() {
        let target = Arc::new(BorderHub::new());
        let hub = BorderHub::new();
        assert!(hub.send("peer", BorderFrame::eof("p")).is_err());

        hub.add_outlet("peer", Arc::new(HubOutlet::new(&target)));
        hub.set_default_outlet(Arc::new(HubOutlet::new(&target)));
        assert!(hub.has_outlet("peer"));
        assert!(hub.has_outlet(""));
        hub.send("peer", BorderFrame::data("p", vec![1u8])).unwrap();
        hub.send("", BorderFrame::data("p", vec![2u8])).unwrap();
        assert_eq!(target.pending_frames(), 2);

        drop(target);
        assert!(hub.send("peer", BorderFrame::eof("p")).is_err());
    }
}
