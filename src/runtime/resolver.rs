// src/runtime/resolver.rs

//! Decides which outputs each subscriber should be filtering.

use std::collections::BTreeSet;

use crate::config::FilterPolicy;
use crate::model::{Definition, Mapping};
use crate::runtime::subscriber::Subscriber;

/// Outputs of `peer_name` that some local mapping element resolves to.
///
/// An element resolves when it targets the peer (by name or wildcard), the
/// output exists in the peer's definition, the input exists locally and the
/// input type accepts the output type. Anything missing leaves the element
/// unresolved.
pub fn desired_filters(
    local: &Definition,
    mapping: &Mapping,
    peer_name: &str,
    peer_definition: Option<&Definition>,
) -> BTreeSet<String> {
    let Some(peer_definition) = peer_definition else {
        return BTreeSet::new();
    };
    mapping
        .elements()
        .filter(|e| e.targets_agent(peer_name))
        .filter_map(|e| {
            let output = peer_definition.output(&e.output_name)?;
            let input = local.input(&e.input_name)?;
            input
                .iop_type
                .accepts(output.iop_type)
                .then(|| output.name.clone())
        })
        .collect()
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FilterDelta {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// The pass followed a wholesale replacement
    pub reset: bool,
}

impl FilterDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Bring a subscriber's filters in line with `desired`.
///
/// Under `Retain` filters are only ever added; stale ones stay active until
/// the caller clears them on a wholesale replacement.
pub fn apply(subscriber: &mut Subscriber, desired: &BTreeSet<String>, policy: FilterPolicy) -> FilterDelta {
    let mut delta = FilterDelta::default();
    for output in desired {
        if subscriber.subscribe(output) {
            delta.added.push(output.clone());
        }
    }
    if policy == FilterPolicy::Prune {
        let stale: Vec<String> = subscriber
            .filters()
            .difference(desired)
            .cloned()
            .collect();
        for output in stale {
            if subscriber.unsubscribe(&output) {
                delta.removed.push(output);
            }
        }
    }
    delta
}

/// Recompute and apply filters for one subscriber. After a wholesale
/// replacement the pass prunes once regardless of `policy`.
pub fn resolve(
    subscriber: &mut Subscriber,
    local: &Definition,
    mapping: &Mapping,
    policy: FilterPolicy,
) -> FilterDelta {
    let desired = desired_filters(
        local,
        mapping,
        subscriber.peer_name(),
        subscriber.definition(),
    );
    let reset = subscriber.take_reset();
    let policy = if reset { FilterPolicy::Prune } else { policy };
    let mut delta = apply(subscriber, &desired, policy);
    delta.reset = reset;
    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{IopKind, IopType};
    use crate::runtime::subscriber::tests::recorded;

    fn peer_a() -> Definition {
        let mut def = Definition::new("A");
        def.create(IopKind::Output, "temp", IopType::Double, None)
            .unwrap();
        def.create(IopKind::Output, "label", IopType::Data, None)
            .unwrap();
        def
    }

    fn local_b() -> Definition {
        let mut def = Definition::new("B");
        def.create(IopKind::Input, "t", IopType::Double, None).unwrap();
        def.create(IopKind::Input, "n", IopType::Integer, None).unwrap();
        def
    }

    fn subscriber_with(def: &Definition) -> (Subscriber, crate::runtime::subscriber::tests::RecordingSink) {
        let (mut sub, sink) = recorded("A");
        sub.apply_external_definition(&def.to_json()).unwrap();
        (sub, sink)
    }

    #[test]
    fn resolving_twice_keeps_a_single_filter() {
        let local = local_b();
        let mut mapping = Mapping::new("B");
        mapping.add("t", "A", "temp").unwrap();
        let (mut sub, sink) = subscriber_with(&peer_a());

        let first = resolve(&mut sub, &local, &mapping, FilterPolicy::Retain);
        let second = resolve(&mut sub, &local, &mapping, FilterPolicy::Retain);
        assert_eq!(first.added, vec!["temp".to_string()]);
        assert!(second.is_empty());
        assert_eq!(sub.filters().len(), 1);
        assert_eq!(*sink.ops.lock(), vec!["SUB temp"]);
    }

    #[test]
    fn retain_keeps_filter_after_element_removal() {
        let local = local_b();
        let mut mapping = Mapping::new("B");
        mapping.add("t", "A", "temp").unwrap();
        let (mut sub, _sink) = subscriber_with(&peer_a());
        resolve(&mut sub, &local, &mapping, FilterPolicy::Retain);

        mapping.remove("t", "A", "temp").unwrap();
        let delta = resolve(&mut sub, &local, &mapping, FilterPolicy::Retain);
        assert!(delta.is_empty());
        assert!(sub.filters().contains("temp"));
    }

    #[test]
    fn prune_drops_filter_after_element_removal() {
        let local = local_b();
        let mut mapping = Mapping::new("B");
        mapping.add("t", "A", "temp").unwrap();
        let (mut sub, sink) = subscriber_with(&peer_a());
        resolve(&mut sub, &local, &mapping, FilterPolicy::Prune);

        mapping.remove("t", "A", "temp").unwrap();
        let delta = resolve(&mut sub, &local, &mapping, FilterPolicy::Prune);
        assert_eq!(delta.removed, vec!["temp".to_string()]);
        assert!(sub.filters().is_empty());
        assert_eq!(sink.ops.lock().last().map(String::as_str), Some("UNSUB temp"));
    }

    #[test]
    fn unresolved_elements_produce_nothing() {
        let local = local_b();
        let mut mapping = Mapping::new("B");
        mapping.add("t", "C", "temp").unwrap(); // other agent
        mapping.add("t", "A", "pressure").unwrap(); // unknown output
        mapping.add("missing", "A", "temp").unwrap(); // unknown input
        mapping.add("n", "A", "label").unwrap(); // data cannot feed integer
        let (mut sub, sink) = subscriber_with(&peer_a());
        assert!(resolve(&mut sub, &local, &mapping, FilterPolicy::Retain).is_empty());
        assert!(sink.ops.lock().is_empty());

        // No cached definition yet: nothing resolves either.
        let (mut fresh, _) = recorded("A");
        mapping.add("t", "A", "temp").unwrap();
        assert!(resolve(&mut fresh, &local, &mapping, FilterPolicy::Retain).is_empty());
    }

    #[test]
    fn definition_rebroadcast_does_not_churn_filters() {
        let local = local_b();
        let mut mapping = Mapping::new("B");
        mapping.add("t", "A", "temp").unwrap();
        mapping.add("n", "A", "temp").unwrap();
        let (mut sub, sink) = subscriber_with(&peer_a());
        resolve(&mut sub, &local, &mapping, FilterPolicy::Retain);

        sub.apply_external_definition(&peer_a().to_json()).unwrap();
        let delta = resolve(&mut sub, &local, &mapping, FilterPolicy::Retain);
        assert!(delta.is_empty());
        assert!(delta.reset);
        assert_eq!(*sink.ops.lock(), vec!["SUB temp"]);
    }

    #[test]
    fn definition_replacement_sheds_vanished_outputs() {
        let local = local_b();
        let mut mapping = Mapping::new("B");
        mapping.add("t", "A", "temp").unwrap();
        let (mut sub, sink) = subscriber_with(&peer_a());
        resolve(&mut sub, &local, &mapping, FilterPolicy::Retain);

        let mut renamed = Definition::new("A");
        renamed
            .create(IopKind::Output, "temperature", IopType::Double, None)
            .unwrap();
        sub.apply_external_definition(&renamed.to_json()).unwrap();
        let delta = resolve(&mut sub, &local, &mapping, FilterPolicy::Retain);
        assert_eq!(delta.removed, vec!["temp".to_string()]);
        assert!(sub.filters().is_empty());
        assert_eq!(*sink.ops.lock(), vec!["SUB temp", "UNSUB temp"]);
    }

    #[test]
    fn wildcard_and_conversions_resolve() {
        let local = local_b();
        let mut mapping = Mapping::new("B");
        mapping.add("n", "*", "temp").unwrap();
        let desired = desired_filters(&local, &mapping, "A", Some(&peer_a()));
        assert_eq!(desired.into_iter().collect::<Vec<_>>(), vec!["temp"]);
    }
}
