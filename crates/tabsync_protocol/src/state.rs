//! The replicated collection as seen by one replica.

use crate::error::{ProtocolError, ProtocolResult};
use crate::record::{Record, RecordId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The full logical collection held by a replica.
///
/// # Invariants
///
/// - Records are sorted by identifier
/// - Identifiers are unique
/// - A tombstone marks an explicit deletion and the time it happened
///
/// Both the bare JSON array form (`[record, ...]`) and the full object form
/// (`{"records": [...], "tombstones": {...}}`) decode into a state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StateRepr")]
pub struct ReplicaState {
    records: Vec<Record>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    tombstones: BTreeMap<RecordId, u64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StateRepr {
    Bare(Vec<Record>),
    Full {
        records: Vec<Record>,
        #[serde(default)]
        tombstones: BTreeMap<RecordId, u64>,
    },
}

impl TryFrom<StateRepr> for ReplicaState {
    type Error = ProtocolError;

    fn try_from(repr: StateRepr) -> ProtocolResult<Self> {
        match repr {
            StateRepr::Bare(records) => Self::from_records(records),
            StateRepr::Full {
                records,
                tombstones,
            } => Self::from_parts(records, tombstones),
        }
    }
}

impl ReplicaState {
    /// Creates an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a state from unordered records.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::DuplicateId`] if an identifier repeats, or
    /// [`ProtocolError::InvalidRecord`] if a record is malformed.
    pub fn from_records(records: Vec<Record>) -> ProtocolResult<Self> {
        Self::from_parts(records, BTreeMap::new())
    }

    /// Builds a state from records and tombstones.
    ///
    /// # Errors
    ///
    /// Same as [`ReplicaState::from_records`].
    pub fn from_parts(
        mut records: Vec<Record>,
        tombstones: BTreeMap<RecordId, u64>,
    ) -> ProtocolResult<Self> {
        for record in &records {
            record.validate()?;
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        if let Some(pair) = records.windows(2).find(|w| w[0].id == w[1].id) {
            return Err(ProtocolError::DuplicateId(pair[0].id.clone()));
        }
        Ok(Self {
            records,
            tombstones,
        })
    }

    /// Returns the records in identifier order.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Consumes the state, returning its records.
    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    /// Iterates records in identifier order.
    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    /// Returns the number of live records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if there are no live records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn position(&self, id: &RecordId) -> Result<usize, usize> {
        self.records.binary_search_by(|r| r.id.cmp(id))
    }

    /// Returns the record with the given identifier.
    pub fn get(&self, id: &RecordId) -> Option<&Record> {
        self.position(id).ok().map(|i| &self.records[i])
    }

    /// Returns true if a live record has the identifier.
    pub fn contains(&self, id: &RecordId) -> bool {
        self.position(id).is_ok()
    }

    /// Inserts or replaces a record, returning the previous version.
    ///
    /// A local write supersedes any tombstone for the same identifier.
    pub fn upsert(&mut self, record: Record) -> Option<Record> {
        self.tombstones.remove(&record.id);
        match self.position(&record.id) {
            Ok(i) => Some(std::mem::replace(&mut self.records[i], record)),
            Err(i) => {
                self.records.insert(i, record);
                None
            }
        }
    }

    /// Removes a record and leaves a tombstone stamped `deleted_at`.
    ///
    /// The tombstone is recorded even if the record is not present locally,
    /// so the deletion still propagates.
    pub fn remove(&mut self, id: &RecordId, deleted_at: u64) -> Option<Record> {
        let stamp = self.tombstones.entry(id.clone()).or_insert(deleted_at);
        *stamp = (*stamp).max(deleted_at);
        self.position(id).ok().map(|i| self.records.remove(i))
    }

    /// Returns the tombstones.
    pub fn tombstones(&self) -> &BTreeMap<RecordId, u64> {
        &self.tombstones
    }

    /// Returns the deletion time of an identifier, if it was deleted.
    pub fn tombstone(&self, id: &RecordId) -> Option<u64> {
        self.tombstones.get(id).copied()
    }

    /// Drops tombstones older than `cutoff`. Returns how many were dropped.
    pub fn prune_tombstones(&mut self, cutoff: u64) -> usize {
        let before = self.tombstones.len();
        self.tombstones.retain(|_, deleted_at| *deleted_at >= cutoff);
        before - self.tombstones.len()
    }

    /// Returns the largest numeric identifier among records and tombstones.
    pub fn max_numeric_id(&self) -> Option<u64> {
        self.records
            .iter()
            .map(|r| &r.id)
            .chain(self.tombstones.keys())
            .filter_map(RecordId::as_number)
            .max()
    }

    /// Returns every identifier, live or tombstoned.
    pub fn known_ids(&self) -> impl Iterator<Item = &RecordId> {
        self.records.iter().map(|r| &r.id).chain(self.tombstones.keys())
    }

    /// Returns the newest `last_updated` of any record or tombstone.
    pub fn newest_timestamp(&self) -> u64 {
        self.records
            .iter()
            .map(|r| r.last_updated)
            .chain(self.tombstones.values().copied())
            .max()
            .unwrap_or(0)
    }

    /// Encodes the state as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a state from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed JSON, malformed records or duplicate
    /// identifiers.
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::UpdatedBy;

    fn rec(id: &str, ts: u64) -> Record {
        Record::new(id, ts, UpdatedBy::SecondaryWriter).with_field("title", id)
    }

    #[test]
    fn from_records_sorts() {
        let state = ReplicaState::from_records(vec![rec("10", 1), rec("2", 1), rec("x", 1)]).unwrap();
        let ids: Vec<&str> = state.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "10", "x"]);
    }

    #[test]
    fn from_records_rejects_duplicates() {
        let result = ReplicaState::from_records(vec![rec("1", 1), rec("1", 2)]);
        assert!(matches!(result, Err(ProtocolError::DuplicateId(_))));
    }

    #[test]
    fn upsert_and_remove() {
        let mut state = ReplicaState::new();
        assert!(state.upsert(rec("5", 1)).is_none());
        assert!(state.upsert(rec("3", 1)).is_none());
        let previous = state.upsert(rec("5", 2)).unwrap();
        assert_eq!(previous.last_updated, 1);
        assert_eq!(state.len(), 2);
        assert_eq!(state.records()[0].id.as_str(), "3");

        let removed = state.remove(&RecordId::from(5), 10).unwrap();
        assert_eq!(removed.last_updated, 2);
        assert_eq!(state.tombstone(&RecordId::from(5)), Some(10));
        assert!(!state.contains(&RecordId::from(5)));

        // Re-adding clears the tombstone
        state.upsert(rec("5", 11));
        assert_eq!(state.tombstone(&RecordId::from(5)), None);
    }

    #[test]
    fn remove_missing_still_tombstones() {
        let mut state = ReplicaState::new();
        assert!(state.remove(&RecordId::from(9), 4).is_none());
        assert_eq!(state.tombstone(&RecordId::from(9)), Some(4));
    }

    #[test]
    fn max_numeric_id_includes_tombstones() {
        let mut state = ReplicaState::from_records(vec![rec("4", 1), rec("abc", 1)]).unwrap();
        assert_eq!(state.max_numeric_id(), Some(4));
        state.remove(&RecordId::from(12), 5);
        assert_eq!(state.max_numeric_id(), Some(12));
        assert_eq!(ReplicaState::new().max_numeric_id(), None);
    }

    #[test]
    fn prune_tombstones_by_cutoff() {
        let mut state = ReplicaState::new();
        state.remove(&RecordId::from(1), 100);
        state.remove(&RecordId::from(2), 300);
        assert_eq!(state.prune_tombstones(200), 1);
        assert_eq!(state.tombstones().len(), 1);
    }

    #[test]
    fn json_forms() {
        let bare = r#"[{"id":2,"fields":{"title":"Scarf"},"lastUpdated":5,"updatedBy":"secondary-writer"}]"#;
        let state = ReplicaState::from_json(bare).unwrap();
        assert_eq!(state.len(), 1);
        assert_eq!(state.records()[0].id.as_str(), "2");

        let mut with_tombstone = state.clone();
        with_tombstone.remove(&RecordId::from(8), 9);
        let json = with_tombstone.to_json().unwrap();
        let back = ReplicaState::from_json(&json).unwrap();
        assert_eq!(back, with_tombstone);

        let duplicate = r#"[{"id":1,"lastUpdated":1,"updatedBy":"merged"},{"id":"1","lastUpdated":2,"updatedBy":"merged"}]"#;
        assert!(ReplicaState::from_json(duplicate).is_err());
    }
}
