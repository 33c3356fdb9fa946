//! Target selection for outbound envelopes.
//!
//! Selection composes two strategies:
//! - [`RoundRobin`]: cycles through the live list, one position per call
//! - [`StickyMap`]: remembers which child a caller-supplied key last landed on
//!
//! A sticky entry is only a hint. If the remembered child is gone, the key
//! falls through to round-robin and is re-pinned to whatever that picks.
//! Entries pinned to children that have left are dropped whenever the live
//! set changes.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use crate::bridge::envelope::{ChildId, Envelope};
use crate::bridge::link::{ChildRegistry, Link};
use crate::error::{BroadcastError, RouterError};

/// Round-robin cursor over a list whose length may change between calls.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: usize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index to use for a list of `len` entries, advancing the cursor.
    pub fn next(&mut self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        let index = self.cursor % len;
        self.cursor = (index + 1) % len;
        Some(index)
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }
}

/// Key-to-child hints.
#[derive(Debug, Default)]
pub struct StickyMap {
    entries: HashMap<String, ChildId>,
}

impl StickyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&ChildId> {
        self.entries.get(key)
    }

    pub fn pin(&mut self, key: &str, child: ChildId) {
        self.entries.insert(key.to_string(), child);
    }

    pub fn remove(&mut self, key: &str) -> Option<ChildId> {
        self.entries.remove(key)
    }

    /// Drop every entry pinned to a child not in `live`. Returns how many went.
    pub fn retain_live(&mut self, live: &[ChildId]) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, child| live.contains(child));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Default)]
struct RoutingState {
    round_robin: RoundRobin,
    sticky: StickyMap,
    /// Live set seen by the previous selection; sticky entries are pruned when it changes.
    last_live: Vec<ChildId>,
}

impl RoutingState {
    fn observe_live(&mut self, live: &[(ChildId, Arc<dyn Link>)]) {
        let unchanged = self.last_live.len() == live.len()
            && self.last_live.iter().zip(live).all(|(seen, (id, _))| seen == id);
        if unchanged {
            return;
        }
        self.last_live = live.iter().map(|(id, _)| id.clone()).collect();
        let dropped = self.sticky.retain_live(&self.last_live);
        if dropped > 0 {
            tracing::debug!(dropped, remaining = self.sticky.len(), "Pruned sticky keys for departed children");
        }
    }
}

/// A resolved destination.
#[derive(Clone)]
pub struct Target {
    /// `None` when the destination is the parent.
    pub id: Option<ChildId>,
    pub link: Arc<dyn Link>,
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target").field("id", &self.id).finish()
    }
}

/// Where outbound envelopes can go, fixed at construction.
#[derive(Clone)]
pub enum Destinations {
    Children(Arc<dyn ChildRegistry>),
    Parent(Arc<dyn Link>),
}

pub struct Dispatcher {
    destinations: Destinations,
    state: StdMutex<RoutingState>,
}

impl Dispatcher {
    pub fn new(destinations: Destinations) -> Self {
        Self {
            destinations,
            state: StdMutex::new(RoutingState::default()),
        }
    }

    pub fn destinations(&self) -> &Destinations {
        &self.destinations
    }

    /// Pick the target for one envelope.
    ///
    /// In the child role this is always the parent. In the parent role, a hint
    /// naming a live child wins, then a live sticky entry for the hint, then
    /// round-robin (which pins the hint, if any, to the chosen child).
    pub fn select(&self, hint: Option<&str>) -> Result<Target, RouterError> {
        let registry = match &self.destinations {
            Destinations::Parent(link) => {
                return Ok(Target {
                    id: None,
                    link: Arc::clone(link),
                });
            }
            Destinations::Children(registry) => registry,
        };

        let mut live = registry.live_children();

        if let Some(hint) = hint
            && let Some(pos) = live.iter().position(|(id, _)| id.as_str() == hint)
        {
            let (id, link) = live.swap_remove(pos);
            tracing::trace!(child = %id, "Selected child by explicit id");
            return Ok(Target { id: Some(id), link });
        }

        let mut state = self.lock_state();
        state.observe_live(&live);

        if let Some(hint) = hint
            && let Some(pinned) = state.sticky.get(hint)
        {
            match live.iter().position(|(id, _)| id == pinned) {
                Some(pos) => {
                    let (id, link) = live.swap_remove(pos);
                    tracing::trace!(child = %id, key = %hint, "Selected child by sticky key");
                    return Ok(Target { id: Some(id), link });
                }
                None => {
                    state.sticky.remove(hint);
                }
            }
        }

        let index = state
            .round_robin
            .next(live.len())
            .ok_or(RouterError::NoTargetAvailable)?;
        let (id, link) = live.swap_remove(index);

        if let Some(hint) = hint {
            tracing::debug!(child = %id, key = %hint, "Pinning sticky key");
            state.sticky.pin(hint, id.clone());
        }
        tracing::trace!(child = %id, index, "Selected child by round-robin");

        Ok(Target { id: Some(id), link })
    }

    /// Transmit a copy of `envelope` to every live child.
    ///
    /// Every child is attempted; failures are reported together afterwards.
    /// Returns the number of children reached.
    pub fn publish_all(&self, envelope: &Envelope) -> Result<usize, RouterError> {
        let registry = match &self.destinations {
            Destinations::Children(registry) => registry,
            Destinations::Parent(_) => return Err(RouterError::RoleViolation),
        };

        let live = registry.live_children();
        if live.is_empty() {
            return Err(RouterError::NoTargetAvailable);
        }

        let mut delivered = 0;
        let mut failures = Vec::new();
        for (id, link) in live {
            match link.transmit(envelope.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(child = %id, error = %e, channel = %envelope.channel, "Broadcast to child failed");
                    failures.push((id, e));
                }
            }
        }

        if failures.is_empty() {
            Ok(delivered)
        } else {
            Err(BroadcastError {
                delivered,
                failures,
            }
            .into())
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RoutingState> {
        // Routing state is always consistent between statements, so a poisoned
        // lock can be reused as-is.
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Routing state mutex poisoned - recovering");
            poisoned.into_inner()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::link::TransportError;
    use serde_json::json;

    struct RecordingLink {
        sent: StdMutex<Vec<Envelope>>,
        fail: bool,
    }

    impl RecordingLink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: StdMutex::new(Vec::new()),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                sent: StdMutex::new(Vec::new()),
                fail: true,
            })
        }

        fn count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    impl Link for RecordingLink {
        fn transmit(&self, envelope: Envelope) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::Closed);
            }
            self.sent.lock().unwrap().push(envelope);
            Ok(())
        }
    }

    /// Registry whose membership tests can change.
    struct MutableRegistry {
        children: StdMutex<Vec<(ChildId, Arc<dyn Link>)>>,
    }

    impl MutableRegistry {
        fn with(ids: &[&str]) -> Arc<Self> {
            let children = ids
                .iter()
                .map(|id| (ChildId::from(*id), RecordingLink::new() as Arc<dyn Link>))
                .collect();
            Arc::new(Self {
                children: StdMutex::new(children),
            })
        }

        fn add(&self, id: &str, link: Arc<dyn Link>) {
            self.children.lock().unwrap().push((ChildId::from(id), link));
        }

        fn remove(&self, id: &str) {
            self.children
                .lock()
                .unwrap()
                .retain(|(child, _)| child.as_str() != id);
        }
    }

    impl ChildRegistry for MutableRegistry {
        fn live_children(&self) -> Vec<(ChildId, Arc<dyn Link>)> {
            self.children.lock().unwrap().clone()
        }
    }

    fn dispatcher(registry: &Arc<MutableRegistry>) -> Dispatcher {
        Dispatcher::new(Destinations::Children(
            Arc::clone(registry) as Arc<dyn ChildRegistry>
        ))
    }

    fn pick(dispatcher: &Dispatcher, hint: Option<&str>) -> String {
        dispatcher.select(hint).unwrap().id.unwrap().to_string()
    }

    #[test]
    fn round_robin_wraps_and_handles_shrinking_lists() {
        let mut rr = RoundRobin::new();
        assert_eq!(rr.next(0), None);
        assert_eq!(rr.next(3), Some(0));
        assert_eq!(rr.next(3), Some(1));
        assert_eq!(rr.next(3), Some(2));
        assert_eq!(rr.next(3), Some(0));
        assert_eq!(rr.next(3), Some(1));
        // list shrank below the cursor
        assert_eq!(rr.next(2), Some(0));
        assert_eq!(rr.cursor(), 1);
    }

    #[test]
    fn sticky_map_pins_and_overwrites() {
        let mut sticky = StickyMap::new();
        assert!(sticky.is_empty());
        sticky.pin("user-1", ChildId::from("a"));
        sticky.pin("user-1", ChildId::from("b"));
        assert_eq!(sticky.get("user-1"), Some(&ChildId::from("b")));
        assert_eq!(sticky.len(), 1);
    }

    #[test]
    fn selection_cycles_through_children() {
        let registry = MutableRegistry::with(&["a", "b", "c"]);
        let dispatcher = dispatcher(&registry);

        let picks: Vec<_> = (0..7).map(|_| pick(&dispatcher, None)).collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c", "a"]);
    }

    #[test]
    fn explicit_id_selects_that_child_without_moving_cursor() {
        let registry = MutableRegistry::with(&["a", "b", "c"]);
        let dispatcher = dispatcher(&registry);

        assert_eq!(pick(&dispatcher, Some("c")), "c");
        assert_eq!(pick(&dispatcher, Some("c")), "c");
        assert_eq!(pick(&dispatcher, None), "a");
    }

    #[test]
    fn sticky_key_returns_first_choice_while_live() {
        let registry = MutableRegistry::with(&["a", "b", "c"]);
        let dispatcher = dispatcher(&registry);

        assert_eq!(pick(&dispatcher, None), "a");
        assert_eq!(pick(&dispatcher, Some("session-9")), "b");
        for _ in 0..5 {
            assert_eq!(pick(&dispatcher, None).len(), 1);
            assert_eq!(pick(&dispatcher, Some("session-9")), "b");
        }
    }

    #[test]
    fn sticky_key_falls_back_when_child_leaves() {
        let registry = MutableRegistry::with(&["a", "b"]);
        let dispatcher = dispatcher(&registry);

        assert_eq!(pick(&dispatcher, Some("k")), "a");
        registry.remove("a");
        registry.add("c", RecordingLink::new());

        // live list is now [b, c], cursor at 1
        assert_eq!(pick(&dispatcher, Some("k")), "c");
        assert_eq!(pick(&dispatcher, Some("k")), "c");
    }

    #[test]
    fn sticky_map_retains_only_live_children() {
        let mut sticky = StickyMap::new();
        sticky.pin("k1", ChildId::from("a"));
        sticky.pin("k2", ChildId::from("b"));
        sticky.pin("k3", ChildId::from("a"));

        assert_eq!(sticky.retain_live(&[ChildId::from("b")]), 2);
        assert_eq!(sticky.get("k2"), Some(&ChildId::from("b")));
        assert_eq!(sticky.remove("k2"), Some(ChildId::from("b")));
        assert!(sticky.is_empty());
    }

    #[test]
    fn departed_child_releases_its_sticky_keys() {
        let registry = MutableRegistry::with(&["a", "b"]);
        let dispatcher = dispatcher(&registry);

        assert_eq!(pick(&dispatcher, Some("k1")), "a");
        assert_eq!(pick(&dispatcher, Some("k2")), "b");
        registry.remove("a");

        assert_eq!(pick(&dispatcher, None), "b");
        let state = dispatcher.lock_state();
        assert_eq!(state.sticky.len(), 1);
        assert_eq!(state.sticky.get("k2"), Some(&ChildId::from("b")));
    }

    #[test]
    fn per_request_keys_do_not_outlive_children() {
        let registry = MutableRegistry::with(&["a", "b"]);
        let dispatcher = dispatcher(&registry);

        for i in 0..10_000 {
            dispatcher.select(Some(&format!("req-{i}"))).unwrap();
        }
        assert_eq!(dispatcher.lock_state().sticky.len(), 10_000);

        registry.remove("a");
        registry.remove("b");
        assert_eq!(
            dispatcher.select(None).unwrap_err(),
            RouterError::NoTargetAvailable
        );
        assert!(dispatcher.lock_state().sticky.is_empty());
    }

    #[test]
    fn empty_registry_has_no_target() {
        let registry = MutableRegistry::with(&[]);
        let dispatcher = dispatcher(&registry);

        assert_eq!(
            dispatcher.select(None).unwrap_err(),
            RouterError::NoTargetAvailable
        );
        assert_eq!(
            dispatcher.select(Some("k")).unwrap_err(),
            RouterError::NoTargetAvailable
        );
    }

    #[test]
    fn child_role_always_selects_parent() {
        let parent = RecordingLink::new();
        let dispatcher = Dispatcher::new(Destinations::Parent(parent.clone()));

        let target = dispatcher.select(Some("anything")).unwrap();
        assert!(target.id.is_none());
        target
            .link
            .transmit(Envelope::message("up", json!(1)))
            .unwrap();
        assert_eq!(parent.count(), 1);
    }

    #[test]
    fn publish_reaches_every_child() {
        let a = RecordingLink::new();
        let b = RecordingLink::new();
        let registry = MutableRegistry::with(&[]);
        registry.add("a", a.clone());
        registry.add("b", b.clone());
        let dispatcher = dispatcher(&registry);

        let delivered = dispatcher
            .publish_all(&Envelope::message("config", json!({"v": 2})))
            .unwrap();
        assert_eq!(delivered, 2);
        assert_eq!(a.count(), 1);
        assert_eq!(b.count(), 1);
    }

    #[test]
    fn publish_attempts_all_children_before_reporting() {
        let a = RecordingLink::new();
        let c = RecordingLink::new();
        let registry = MutableRegistry::with(&[]);
        registry.add("a", a.clone());
        registry.add("b", RecordingLink::failing());
        registry.add("c", c.clone());
        let dispatcher = dispatcher(&registry);

        let err = dispatcher
            .publish_all(&Envelope::message("config", json!(null)))
            .unwrap_err();
        assert_eq!(
            err,
            RouterError::Broadcast(BroadcastError {
                delivered: 2,
                failures: vec![(ChildId::from("b"), TransportError::Closed)],
            })
        );
        assert_eq!(a.count(), 1);
        assert_eq!(c.count(), 1);
    }

    #[test]
    fn publish_without_children_fails() {
        let registry = MutableRegistry::with(&[]);
        let dispatcher = dispatcher(&registry);

        assert_eq!(
            dispatcher
                .publish_all(&Envelope::message("x", json!(null)))
                .unwrap_err(),
            RouterError::NoTargetAvailable
        );
    }

    #[test]
    fn publish_from_child_role_is_rejected() {
        let dispatcher = Dispatcher::new(Destinations::Parent(RecordingLink::new()));
        assert_eq!(
            dispatcher
                .publish_all(&Envelope::message("x", json!(null)))
                .unwrap_err(),
            RouterError::RoleViolation
        );
    }
}
