// src/runtime/subscriber.rs

use std::collections::BTreeSet;
use tokio::time::Instant;

use crate::error::ModelError;
use crate::model::{Definition, Mapping};
use crate::network::SubscriptionSocket;

/// Where filter changes are applied. Implemented by the real subscription
/// socket; tests substitute a recorder.
pub trait FilterSink: Send {
    fn subscribe(&self, output: &str);
    fn unsubscribe(&self, output: &str);
}

impl FilterSink for SubscriptionSocket {
    fn subscribe(&self, output: &str) {
        SubscriptionSocket::subscribe(self, output)
    }

    fn unsubscribe(&self, output: &str) {
        SubscriptionSocket::unsubscribe(self, output)
    }
}

/// Receiving side for one remote peer: socket, active filters and the
/// peer's last definition/mapping.
pub struct Subscriber {
    peer_id: String,
    peer_name: String,
    sink: Box<dyn FilterSink>,
    filters: BTreeSet<String>,
    definition: Option<Definition>,
    mapping: Option<Mapping>,
    outputs_request_at: Option<Instant>,
    /// Next resolution drops every filter it does not want, whatever the policy.
    reset_pending: bool,
}

impl Subscriber {
    pub fn new(peer_id: &str, peer_name: &str, sink: Box<dyn FilterSink>) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            peer_name: peer_name.to_string(),
            sink,
            filters: BTreeSet::new(),
            definition: None,
            mapping: None,
            outputs_request_at: None,
            reset_pending: false,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    pub fn filters(&self) -> &BTreeSet<String> {
        &self.filters
    }

    pub fn definition(&self) -> Option<&Definition> {
        self.definition.as_ref()
    }

    pub fn mapping(&self) -> Option<&Mapping> {
        self.mapping.as_ref()
    }

    /// Returns false when the filter was already active.
    pub fn subscribe(&mut self, output: &str) -> bool {
        if !self.filters.insert(output.to_string()) {
            return false;
        }
        self.sink.subscribe(output);
        true
    }

    /// Returns false when the filter was not active.
    pub fn unsubscribe(&mut self, output: &str) -> bool {
        if !self.filters.remove(output) {
            return false;
        }
        self.sink.unsubscribe(output);
        true
    }

    pub fn clear_filters(&mut self) {
        for output in std::mem::take(&mut self.filters) {
            self.sink.unsubscribe(&output);
        }
    }

    /// Replace the cached definition wholesale. The next resolution pass
    /// keeps only the filters the new schema still supports.
    pub fn apply_external_definition(&mut self, json: &str) -> Result<(), ModelError> {
        let definition = Definition::from_json(json)?;
        self.definition = Some(definition);
        self.reset_pending = true;
        Ok(())
    }

    /// Make the next resolution shed stale filters.
    pub fn mark_reset(&mut self) {
        self.reset_pending = true;
    }

    pub fn take_reset(&mut self) -> bool {
        std::mem::take(&mut self.reset_pending)
    }

    pub fn apply_external_mapping(&mut self, json: &str) -> Result<(), ModelError> {
        self.mapping = Some(Mapping::from_json(json)?);
        Ok(())
    }

    /// Arm (or push back) the one-shot deadline for requesting the peer's outputs.
    pub fn arm_outputs_request(&mut self, at: Instant) {
        self.outputs_request_at = Some(at);
    }

    pub fn outputs_request_deadline(&self) -> Option<Instant> {
        self.outputs_request_at
    }

    /// Consume the deadline if it has passed.
    pub fn take_due_outputs_request(&mut self, now: Instant) -> bool {
        match self.outputs_request_at {
            Some(at) if at <= now => {
                self.outputs_request_at = None;
                true
            }
            _ => false,
        }
    }

    /// Unsubscribe everything and release the socket and caches.
    pub fn teardown(mut self) {
        self.clear_filters();
        self.outputs_request_at = None;
        self.definition = None;
        self.mapping = None;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    /// Records every filter operation sent to the socket.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingSink {
        pub ops: Arc<Mutex<Vec<String>>>,
    }

    impl FilterSink for RecordingSink {
        fn subscribe(&self, output: &str) {
            self.ops.lock().push(format!("SUB {}", output));
        }

        fn unsubscribe(&self, output: &str) {
            self.ops.lock().push(format!("UNSUB {}", output));
        }
    }

    pub(crate) fn recorded(name: &str) -> (Subscriber, RecordingSink) {
        let sink = RecordingSink::default();
        (Subscriber::new("peer-1", name, Box::new(sink.clone())), sink)
    }

    #[test]
    fn subscribe_and_unsubscribe_are_idempotent() {
        let (mut sub, sink) = recorded("A");
        assert!(sub.subscribe("temp"));
        assert!(!sub.subscribe("temp"));
        assert!(!sub.unsubscribe("other"));
        assert!(sub.unsubscribe("temp"));
        assert_eq!(*sink.ops.lock(), vec!["SUB temp", "UNSUB temp"]);
    }

    #[test]
    fn bad_definition_keeps_previous_cache() {
        let (mut sub, _sink) = recorded("A");
        let mut def = Definition::new("A");
        def.create(crate::model::IopKind::Output, "temp", crate::model::IopType::Double, None)
            .unwrap();
        sub.apply_external_definition(&def.to_json()).unwrap();
        sub.subscribe("temp");
        assert!(sub.apply_external_definition("{not json").is_err());
        assert!(sub.definition().unwrap().output("temp").is_some());
        assert!(sub.filters().contains("temp"));
    }

    #[test]
    fn definition_replacement_defers_reset_to_resolution() {
        let (mut sub, sink) = recorded("A");
        sub.subscribe("temp");
        sub.apply_external_definition(&Definition::new("A").to_json())
            .unwrap();
        assert!(sub.filters().contains("temp"));
        assert_eq!(*sink.ops.lock(), vec!["SUB temp"]);
        assert!(sub.take_reset());
        assert!(!sub.take_reset());
    }

    #[test]
    fn outputs_request_fires_once() {
        let (mut sub, _sink) = recorded("A");
        let now = Instant::now();
        sub.arm_outputs_request(now + Duration::from_millis(100));
        assert!(!sub.take_due_outputs_request(now));
        assert!(sub.take_due_outputs_request(now + Duration::from_millis(100)));
        assert!(!sub.take_due_outputs_request(now + Duration::from_secs(1)));
    }

    #[test]
    fn teardown_unsubscribes_everything() {
        let (mut sub, sink) = recorded("A");
        sub.subscribe("a");
        sub.subscribe("b");
        sub.teardown();
        let ops = sink.ops.lock();
        assert!(ops.contains(&"UNSUB a".to_string()));
        assert!(ops.contains(&"UNSUB b".to_string()));
    }
}
