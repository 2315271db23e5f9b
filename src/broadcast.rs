//! Canonical workspace state and fan-out to connected views
//!
//! A view starts uninitialized when it attaches. Once it sends `ready` it
//! gets a full snapshot and from then on every published delta. Every ready
//! view receives its own copy of each message; a view whose sink fails is
//! detached. Sinks must not block: socket views queue their frames for a
//! writer thread.

use anyhow::Result;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::ipc::ViewWriter;
use crate::protocol::{InboundMessage, StateDelta, WorkspaceState};

/// Where messages for one view go
pub trait ViewSink: Send {
    fn send(&mut self, message: &InboundMessage) -> Result<()>;
}

impl ViewSink for ViewWriter {
    fn send(&mut self, message: &InboundMessage) -> Result<()> {
        ViewWriter::send(self, message)
    }
}

pub type ViewId = u64;

struct View {
    sink: Box<dyn ViewSink>,
    ready: bool,
}

pub struct StateBroadcaster {
    state: WorkspaceState,
    views: BTreeMap<ViewId, View>,
}

impl Default for StateBroadcaster {
    fn default() -> Self {
        Self::new(WorkspaceState::default())
    }
}

impl StateBroadcaster {
    pub fn new(state: WorkspaceState) -> Self {
        Self {
            state,
            views: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> &WorkspaceState {
        &self.state
    }

    /// Register a view; it receives nothing until it is ready
    pub fn attach(&mut self, id: ViewId, sink: Box<dyn ViewSink>) {
        self.views.insert(id, View { sink, ready: false });
        debug!(view = id, "View attached");
    }

    pub fn detach(&mut self, id: ViewId) {
        if self.views.remove(&id).is_some() {
            debug!(view = id, "View detached");
        }
    }

    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    pub fn is_ready(&self, id: ViewId) -> bool {
        self.views.get(&id).is_some_and(|view| view.ready)
    }

    /// Mark a view ready and send it the full state
    pub fn ready(&mut self, id: ViewId) {
        let snapshot = InboundMessage::State(self.state.snapshot());
        let Some(view) = self.views.get_mut(&id) else {
            warn!(view = id, "Ready from unknown view");
            return;
        };
        view.ready = true;
        info!(view = id, "View ready");
        if let Err(e) = view.sink.send(&snapshot) {
            warn!(view = id, error = ?e, "Failed to send snapshot, detaching view");
            self.views.remove(&id);
        }
    }

    /// Apply `delta` to the canonical state and push it to every ready view
    pub fn publish(&mut self, delta: StateDelta) {
        if delta.is_empty() {
            return;
        }
        self.state.apply(delta.clone());
        self.broadcast(&InboundMessage::State(delta));
    }

    /// Send a message to every ready view
    pub fn broadcast(&mut self, message: &InboundMessage) {
        let mut failed = Vec::new();
        for (id, view) in self.views.iter_mut().filter(|(_, view)| view.ready) {
            if let Err(e) = view.sink.send(message) {
                warn!(view = id, error = ?e, "Failed to send to view, detaching");
                failed.push(*id);
            }
        }
        for id in failed {
            self.views.remove(&id);
        }
    }

    /// Send a message to one view, ready or not
    pub fn send_to(&mut self, id: ViewId, message: &InboundMessage) {
        let Some(view) = self.views.get_mut(&id) else {
            debug!(view = id, "Reply to detached view dropped");
            return;
        };
        if let Err(e) = view.sink.send(message) {
            warn!(view = id, error = ?e, "Failed to send to view, detaching");
            self.views.remove(&id);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::{Arc, Mutex};

    /// Sink that records everything it is sent
    #[derive(Clone, Default)]
    pub(crate) struct RecordingSink {
        pub messages: Arc<Mutex<Vec<InboundMessage>>>,
    }

    impl RecordingSink {
        pub(crate) fn states(&self) -> Vec<StateDelta> {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .filter_map(|m| match m {
                    InboundMessage::State(delta) => Some(delta.clone()),
                    _ => None,
                })
                .collect()
        }

        pub(crate) fn take(&self) -> Vec<InboundMessage> {
            std::mem::take(&mut *self.messages.lock().unwrap())
        }
    }

    impl ViewSink for RecordingSink {
        fn send(&mut self, message: &InboundMessage) -> Result<()> {
            self.messages.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    struct BrokenSink;

    impl ViewSink for BrokenSink {
        fn send(&mut self, _message: &InboundMessage) -> Result<()> {
            Err(anyhow!("broken pipe"))
        }
    }

    fn running(value: bool) -> StateDelta {
        StateDelta {
            build_running: Some(value),
            ..Default::default()
        }
    }

    #[test]
    fn test_snapshot_on_ready_then_deltas() {
        let mut broadcaster = StateBroadcaster::default();
        broadcaster.publish(running(true));

        let sink = RecordingSink::default();
        let id = 1;
        broadcaster.attach(id, Box::new(sink.clone()));
        broadcaster.publish(running(false));
        assert!(sink.take().is_empty());

        broadcaster.ready(id);
        let snapshot = sink.states();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].build_running, Some(false));
        assert!(snapshot[0].current_unit.is_some());
        sink.take();

        broadcaster.publish(running(true));
        assert_eq!(sink.states(), vec![running(true)]);
    }

    #[test]
    fn test_every_ready_view_gets_a_copy() {
        let mut broadcaster = StateBroadcaster::default();
        let sinks: Vec<RecordingSink> = (0..3).map(|_| RecordingSink::default()).collect();
        for (id, sink) in (1..).zip(&sinks) {
            broadcaster.attach(id, Box::new(sink.clone()));
            broadcaster.ready(id);
            sink.take();
        }
        broadcaster.publish(running(true));
        for sink in &sinks {
            assert_eq!(sink.states(), vec![running(true)]);
        }
        assert!(broadcaster.state().build_running);
    }

    #[test]
    fn test_empty_delta_is_not_sent() {
        let mut broadcaster = StateBroadcaster::default();
        let sink = RecordingSink::default();
        broadcaster.attach(7, Box::new(sink.clone()));
        broadcaster.ready(7);
        sink.take();
        broadcaster.publish(StateDelta::default());
        assert!(sink.take().is_empty());
    }

    #[test]
    fn test_failing_view_is_detached() {
        let mut broadcaster = StateBroadcaster::default();
        let good = RecordingSink::default();
        let (good_id, bad_id) = (1, 2);
        broadcaster.attach(good_id, Box::new(good.clone()));
        broadcaster.ready(good_id);
        broadcaster.attach(bad_id, Box::new(BrokenSink));
        assert_eq!(broadcaster.view_count(), 2);

        broadcaster.ready(bad_id);
        assert_eq!(broadcaster.view_count(), 1);
        broadcaster.publish(running(true));
        assert!(broadcaster.is_ready(good_id));
        assert!(!broadcaster.is_ready(bad_id));
    }

    #[test]
    fn test_send_to_reaches_only_one_view() {
        let mut broadcaster = StateBroadcaster::default();
        let a = RecordingSink::default();
        let b = RecordingSink::default();
        let a_id = 1;
        broadcaster.attach(a_id, Box::new(a.clone()));
        broadcaster.attach(2, Box::new(b.clone()));
        let msg = InboundMessage::Clipboard {
            text: "foo".to_string(),
        };
        broadcaster.send_to(a_id, &msg);
        assert_eq!(a.take(), vec![msg]);
        assert!(b.take().is_empty());
    }
}
