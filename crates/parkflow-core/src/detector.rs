use std::collections::BTreeMap;

use crate::error::Result;
use crate::policy::ChangePolicy;
use crate::state::StateStore;
use crate::types::{ChangeEvent, Record, StateEntry};

/// Compare one record against its prior state.
///
/// Returns the entry to store (always the new reading, changed or not) and
/// the event describing the decision.
pub fn transition(
    prior: Option<&StateEntry>,
    record: &Record,
    policy: ChangePolicy,
) -> (StateEntry, ChangeEvent) {
    let changed = policy.is_change(prior, record);
    let event = ChangeEvent {
        record: record.clone(),
        changed,
        previous: prior.copied(),
    };
    (StateEntry::from(record), event)
}

/// The outcome of running one batch through the detector.
#[derive(Debug, Default)]
pub struct Detection {
    /// One event per input record, in arrival order.
    pub events: Vec<ChangeEvent>,
    /// Final state per facility after the batch.
    pub updates: BTreeMap<String, StateEntry>,
}

impl Detection {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn changed(&self) -> impl Iterator<Item = &ChangeEvent> {
        self.events.iter().filter(|e| e.changed)
    }

    pub fn changed_count(&self) -> usize {
        self.changed().count()
    }

    pub fn unchanged_count(&self) -> usize {
        self.events.len() - self.changed_count()
    }

    /// The records that should be forwarded to sinks.
    pub fn changed_records(&self) -> Vec<Record> {
        self.changed().map(|e| e.record.clone()).collect()
    }
}

/// Classifies records as changed or unchanged against a [`StateStore`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeDetector {
    policy: ChangePolicy,
}

impl ChangeDetector {
    pub fn new(policy: ChangePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ChangePolicy {
        self.policy
    }

    /// Evaluate a batch without writing to the store.
    ///
    /// Records for the same facility see the state left by the previous
    /// record of the batch, not the pre-batch state.
    pub fn detect<S: StateStore + ?Sized>(
        &self,
        state: &S,
        records: Vec<Record>,
    ) -> Result<Detection> {
        let mut detection = Detection::default();

        for record in records {
            let prior = match detection.updates.get(&record.facility_key) {
                Some(entry) => Some(*entry),
                None => state.get(&record.facility_key)?,
            };

            let (next, event) = transition(prior.as_ref(), &record, self.policy);
            detection.updates.insert(record.facility_key, next);
            detection.events.push(event);
        }

        Ok(detection)
    }

    /// Evaluate a batch and write the resulting state.
    pub fn process<S: StateStore + ?Sized>(
        &self,
        state: &S,
        records: Vec<Record>,
    ) -> Result<Detection> {
        let detection = self.detect(state, records)?;
        if !detection.updates.is_empty() {
            state.put_all(&detection.updates)?;
        }
        Ok(detection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::state::MemoryStateStore;

    fn spaces(store: &MemoryStateStore, key: &str) -> Option<i64> {
        store.get(key).unwrap().map(|e| e.available_spaces)
    }

    fn seed(store: &MemoryStateStore, key: &str, value: i64) {
        store
            .put(
                key,
                StateEntry {
                    available_spaces: value,
                    closed: false,
                },
            )
            .unwrap();
    }

    #[test]
    fn test_first_observation_on_empty_state() {
        let store = MemoryStateStore::new();
        let detection = ChangeDetector::default()
            .process(&store, vec![Record::new("P1", 10, false)])
            .unwrap();

        assert_eq!(detection.events.len(), 1);
        assert!(detection.events[0].changed);
        assert!(detection.events[0].is_first_observation());
        assert_eq!(detection.changed_records()[0].available_spaces, 10);
        assert_eq!(spaces(&store, "P1"), Some(10));
    }

    #[test]
    fn test_unchanged_value_is_filtered() {
        let store = MemoryStateStore::new();
        seed(&store, "P1", 10);

        let detection = ChangeDetector::default()
            .process(&store, vec![Record::new("P1", 10, false)])
            .unwrap();

        assert_eq!(detection.events.len(), 1);
        assert!(!detection.events[0].changed);
        assert!(detection.changed_records().is_empty());
        assert_eq!(spaces(&store, "P1"), Some(10));
    }

    #[test]
    fn test_changed_value_updates_state() {
        let store = MemoryStateStore::new();
        seed(&store, "P1", 10);

        let detection = ChangeDetector::default()
            .process(&store, vec![Record::new("P1", 7, false)])
            .unwrap();

        assert_eq!(detection.changed_count(), 1);
        assert_eq!(detection.events[0].previous.unwrap().available_spaces, 10);
        assert_eq!(spaces(&store, "P1"), Some(7));
    }

    #[test]
    fn test_same_key_twice_in_one_batch() {
        let store = MemoryStateStore::new();
        let detection = ChangeDetector::default()
            .process(
                &store,
                vec![Record::new("P1", 5, false), Record::new("P1", 5, false)],
            )
            .unwrap();

        let flags: Vec<_> = detection.events.iter().map(|e| e.changed).collect();
        assert_eq!(flags, vec![true, false]);
        assert_eq!(detection.unchanged_count(), 1);
        assert_eq!(spaces(&store, "P1"), Some(5));
    }

    #[test]
    fn test_first_observation_of_zero_is_a_change() {
        let store = MemoryStateStore::new();
        let detection = ChangeDetector::default()
            .process(&store, vec![Record::new("P9", 0, true)])
            .unwrap();
        assert!(detection.events[0].changed);
    }

    #[test]
    fn test_arrival_order_preserved_across_keys() {
        let store = MemoryStateStore::new();
        seed(&store, "B", 3);

        let detection = ChangeDetector::default()
            .process(
                &store,
                vec![
                    Record::new("A", 1, false),
                    Record::new("B", 3, false),
                    Record::new("A", 2, false),
                    Record::new("B", 4, false),
                ],
            )
            .unwrap();

        let seen: Vec<_> = detection
            .events
            .iter()
            .map(|e| (e.record.facility_key.as_str(), e.changed))
            .collect();
        assert_eq!(
            seen,
            vec![("A", true), ("B", false), ("A", true), ("B", true)]
        );
        assert_eq!(spaces(&store, "A"), Some(2));
        assert_eq!(spaces(&store, "B"), Some(4));
    }

    #[test]
    fn test_detect_does_not_write() {
        let store = MemoryStateStore::new();
        let detection = ChangeDetector::default()
            .detect(&store, vec![Record::new("P1", 1, false)])
            .unwrap();

        assert_eq!(detection.updates.len(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_empty_batch_is_a_no_op() {
        let store = MemoryStateStore::new();
        let detection = ChangeDetector::default().process(&store, vec![]).unwrap();
        assert!(detection.is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn test_closed_policy_reports_closing() {
        let store = MemoryStateStore::new();
        seed(&store, "P1", 10);

        let detector = ChangeDetector::new(ChangePolicy::AvailableSpacesOrClosed);
        let detection = detector
            .process(&store, vec![Record::new("P1", 10, true)])
            .unwrap();

        assert!(detection.events[0].changed);
        assert!(store.get("P1").unwrap().unwrap().closed);
    }

    struct BrokenStore;

    impl StateStore for BrokenStore {
        fn get(&self, _: &str) -> Result<Option<StateEntry>> {
            Err(Error::StateStore("disk gone".into()))
        }

        fn put(&self, _: &str, _: StateEntry) -> Result<()> {
            Err(Error::StateStore("disk gone".into()))
        }
    }

    #[test]
    fn test_store_failure_aborts_batch() {
        let result = ChangeDetector::default().process(&BrokenStore, vec![Record::new("P1", 1, false)]);
        assert!(matches!(result, Err(Error::StateStore(_))));
    }
}
