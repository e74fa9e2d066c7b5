//! Deterministic conflict resolution.
//!
//! The resolver is a pair of pure functions. It is a heuristic, not a CRDT:
//! authority and recency resolution are commutative, the field-level union
//! used for equal timestamps is not, and merging a value with itself always
//! returns it unchanged.

use crate::record::{Record, RecordId, UpdatedBy};
use crate::state::ReplicaState;
use std::collections::{BTreeMap, BTreeSet};

/// Two independently minted records that shared an identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdCollision {
    /// The contested identifier.
    pub id: RecordId,
    /// Origin of the record that kept the identifier.
    pub kept_origin: String,
    /// Origin of the record that was moved.
    pub moved_origin: String,
    /// New identifier of the moved record.
    pub moved_to: RecordId,
}

/// Result of merging an incoming collection into a local one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// The merged collection.
    pub state: ReplicaState,
    /// Identifiers that are new relative to the local collection.
    pub added: Vec<RecordId>,
    /// Identifiers whose local record changed.
    pub updated: Vec<RecordId>,
    /// Identifiers removed from the local collection by tombstones.
    pub removed: Vec<RecordId>,
    /// Identifier collisions that were separated.
    pub collisions: Vec<IdCollision>,
}

impl MergeOutcome {
    /// Returns true if the merged collection differs from the local one.
    pub fn changed_local(&self) -> bool {
        !self.added.is_empty() || !self.updated.is_empty() || !self.removed.is_empty()
    }
}

/// Resolves two versions of the same record.
///
/// Rules, each short-circuiting:
/// 1. Identical inputs return the input.
/// 2. If exactly one side was written by a primary writer, it wins.
/// 3. Otherwise the strictly newer `last_updated` wins.
/// 4. Otherwise the fields are unioned: start from `a` and fill every empty
///    or absent field from `b`. The result is marked [`UpdatedBy::Merged`]
///    and stamped `merged_at` (never earlier than the inputs).
///
/// Claim status is resolved before any of the rules above: a `Claimed` input
/// makes the result `Claimed` regardless of which side wins.
pub fn resolve_record(a: &Record, b: &Record, merged_at: u64) -> Record {
    if a == b {
        return a.clone();
    }

    let status = a.status.max(b.status);

    let mut winner = if a.is_primary() != b.is_primary() {
        if a.is_primary() {
            a.clone()
        } else {
            b.clone()
        }
    } else if a.last_updated != b.last_updated {
        if a.last_updated > b.last_updated {
            a.clone()
        } else {
            b.clone()
        }
    } else {
        union_fields(a, b, merged_at)
    };

    winner.status = status;
    winner
}

fn union_fields(a: &Record, b: &Record, merged_at: u64) -> Record {
    let mut merged = a.clone();
    for (name, value) in &b.fields {
        if value.is_empty() {
            continue;
        }
        let slot = merged.fields.entry(name.clone()).or_default();
        if slot.is_empty() {
            slot.clone_from(value);
        }
    }
    if merged.origin.is_none() {
        merged.origin.clone_from(&b.origin);
    }
    merged.updated_by = UpdatedBy::Merged;
    merged.last_updated = merged_at.max(a.last_updated);
    merged
}

fn collision_between(a: &Record, b: &Record) -> Option<(String, String)> {
    match (&a.origin, &b.origin) {
        (Some(x), Some(y)) if x != y => Some((x.clone(), y.clone())),
        _ => None,
    }
}

fn moved_id(id: &RecordId, origin: &str) -> RecordId {
    RecordId::new(format!("{id}~{origin}"))
}

fn place(out: &mut BTreeMap<RecordId, Record>, record: Record, merged_at: u64) {
    match out.remove(&record.id) {
        Some(existing) => {
            let resolved = resolve_record(&existing, &record, merged_at);
            out.insert(resolved.id.clone(), resolved);
        }
        None => {
            out.insert(record.id.clone(), record);
        }
    }
}

/// Merges an incoming collection into a local one.
///
/// - Records only in `incoming` are adopted.
/// - Records only in `local` are kept: absence is ambiguous between
///   "deleted" and "not yet seen", so it never removes anything.
/// - Records in both are resolved with [`resolve_record`].
/// - Records that share an identifier but were minted by different
///   replicas are both kept. The one whose origin sorts greater moves to
///   `"{id}~{origin}"`; every replica computes the same move.
/// - Tombstones from both sides are unioned; a tombstone removes a record
///   unless the record was written after the deletion.
pub fn merge_collections(
    local: &ReplicaState,
    incoming: &ReplicaState,
    merged_at: u64,
) -> MergeOutcome {
    let mut tombstones = local.tombstones().clone();
    for (id, deleted_at) in incoming.tombstones() {
        let stamp = tombstones.entry(id.clone()).or_insert(*deleted_at);
        *stamp = (*stamp).max(*deleted_at);
    }

    let ids: BTreeSet<&RecordId> = local
        .iter()
        .map(|r| &r.id)
        .chain(incoming.iter().map(|r| &r.id))
        .collect();

    let mut out: BTreeMap<RecordId, Record> = BTreeMap::new();
    let mut collisions = Vec::new();

    for id in ids {
        match (local.get(id), incoming.get(id)) {
            (Some(l), Some(i)) => match collision_between(l, i) {
                Some((local_origin, incoming_origin)) => {
                    let (kept, moved) = if local_origin < incoming_origin {
                        (l.clone(), i.clone())
                    } else {
                        (i.clone(), l.clone())
                    };
                    let kept_origin = kept.origin.clone().unwrap_or_default();
                    let moved_origin = moved.origin.clone().unwrap_or_default();
                    let moved_to = moved_id(id, &moved_origin);

                    let mut moved = moved;
                    moved.id = moved_to.clone();

                    place(&mut out, kept, merged_at);
                    place(&mut out, moved, merged_at);
                    collisions.push(IdCollision {
                        id: id.clone(),
                        kept_origin,
                        moved_origin,
                        moved_to,
                    });
                }
                None => place(&mut out, resolve_record(l, i, merged_at), merged_at),
            },
            (Some(only), None) | (None, Some(only)) => place(&mut out, only.clone(), merged_at),
            (None, None) => {}
        }
    }

    out.retain(|id, record| match tombstones.get(id) {
        Some(deleted_at) => record.last_updated > *deleted_at,
        None => true,
    });

    let mut added = Vec::new();
    let mut updated = Vec::new();
    for (id, record) in &out {
        match local.get(id) {
            None => added.push(id.clone()),
            Some(previous) if previous != record => updated.push(id.clone()),
            Some(_) => {}
        }
    }
    let removed: Vec<RecordId> = local
        .iter()
        .filter(|r| !out.contains_key(&r.id))
        .map(|r| r.id.clone())
        .collect();

    let state = ReplicaState::from_parts(out.into_values().collect(), tombstones)
        .unwrap_or_else(|_| local.clone());

    MergeOutcome {
        state,
        added,
        updated,
        removed,
        collisions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ClaimStatus;
    use proptest::prelude::*;

    fn secondary(id: &str, ts: u64) -> Record {
        Record::new(id, ts, UpdatedBy::SecondaryWriter)
    }

    fn primary(id: &str, ts: u64) -> Record {
        Record::new(id, ts, UpdatedBy::PrimaryWriter)
    }

    #[test]
    fn identical_records_resolve_to_themselves() {
        let r = secondary("1", 10).with_field("title", "Lamp");
        assert_eq!(resolve_record(&r, &r, 999), r);
    }

    #[test]
    fn primary_writer_beats_newer_secondary() {
        let p = primary("1", 10).with_field("title", "Admin title");
        let s = secondary("1", 50).with_field("title", "Tab title");

        assert_eq!(resolve_record(&p, &s, 100), p);
        assert_eq!(resolve_record(&s, &p, 100), p);
    }

    #[test]
    fn newer_timestamp_wins_between_peers() {
        let old = secondary("1", 10).with_field("title", "Old");
        let new = secondary("1", 20).with_field("title", "New");
        assert_eq!(resolve_record(&old, &new, 100), new);
        assert_eq!(resolve_record(&new, &old, 100), new);

        let old = primary("1", 10).with_field("title", "Old");
        let new = primary("1", 20).with_field("title", "New");
        assert_eq!(resolve_record(&old, &new, 100), new);
    }

    #[test]
    fn equal_timestamps_union_fields() {
        let a = secondary("1", 10)
            .with_field("title", "Keys")
            .with_field("location", "");
        let b = secondary("1", 10)
            .with_field("title", "Car keys")
            .with_field("location", "Lobby")
            .with_field("color", "Black");

        let merged = resolve_record(&a, &b, 500);
        assert_eq!(merged.field("title"), Some("Keys"));
        assert_eq!(merged.field("location"), Some("Lobby"));
        assert_eq!(merged.field("color"), Some("Black"));
        assert_eq!(merged.updated_by, UpdatedBy::Merged);
        assert_eq!(merged.last_updated, 500);
    }

    #[test]
    fn merge_time_never_moves_backwards() {
        let a = secondary("1", 900).with_field("title", "A");
        let b = secondary("1", 900).with_field("note", "B");
        assert_eq!(resolve_record(&a, &b, 100).last_updated, 900);
    }

    #[test]
    fn claim_dominates_authority() {
        // Secondary claims at t=100, primary edits the description at t=90.
        let claimed = secondary("1", 100)
            .with_field("description", "Blue")
            .with_status(ClaimStatus::Claimed);
        let edited = primary("1", 90)
            .with_field("description", "Navy blue backpack")
            .with_status(ClaimStatus::Unclaimed);

        let result = resolve_record(&claimed, &edited, 200);
        assert_eq!(result.field("description"), Some("Navy blue backpack"));
        assert_eq!(result.updated_by, UpdatedBy::PrimaryWriter);
        assert_eq!(result.status, ClaimStatus::Claimed);

        let reversed = resolve_record(&edited, &claimed, 200);
        assert_eq!(reversed, result);
    }

    #[test]
    fn merge_keeps_local_only_records() {
        let local = ReplicaState::from_records(vec![secondary("1", 1), secondary("2", 1)]).unwrap();
        let incoming = ReplicaState::from_records(vec![secondary("1", 1)]).unwrap();

        let outcome = merge_collections(&local, &incoming, 10);
        assert_eq!(outcome.state, local);
        assert!(!outcome.changed_local());
    }

    #[test]
    fn merge_adopts_incoming_only_records() {
        let local = ReplicaState::from_records(vec![secondary("1", 1)]).unwrap();
        let incoming = ReplicaState::from_records(vec![secondary("3", 4)]).unwrap();

        let outcome = merge_collections(&local, &incoming, 10);
        assert_eq!(outcome.state.len(), 2);
        assert_eq!(outcome.added, vec![RecordId::from(3)]);
        assert!(outcome.changed_local());
    }

    #[test]
    fn merge_applies_tombstones() {
        let local = ReplicaState::from_records(vec![secondary("1", 5), secondary("2", 5)]).unwrap();
        let mut incoming = local.clone();
        incoming.remove(&RecordId::from(1), 6);

        let outcome = merge_collections(&local, &incoming, 10);
        assert!(!outcome.state.contains(&RecordId::from(1)));
        assert_eq!(outcome.removed, vec![RecordId::from(1)]);
        assert_eq!(outcome.state.tombstone(&RecordId::from(1)), Some(6));
    }

    #[test]
    fn write_after_delete_survives_tombstone() {
        let mut local = ReplicaState::new();
        local.remove(&RecordId::from(1), 6);
        let incoming = ReplicaState::from_records(vec![secondary("1", 7)]).unwrap();

        let outcome = merge_collections(&local, &incoming, 10);
        assert!(outcome.state.contains(&RecordId::from(1)));
    }

    #[test]
    fn collision_separates_records_deterministically() {
        let mine = secondary("7", 10)
            .with_field("title", "Blue Backpack")
            .with_origin("tab-a");
        let theirs = secondary("7", 12)
            .with_field("title", "Blue Backpack")
            .with_field("location", "Gym")
            .with_origin("tab-b");

        let on_a = merge_collections(
            &ReplicaState::from_records(vec![mine.clone()]).unwrap(),
            &ReplicaState::from_records(vec![theirs.clone()]).unwrap(),
            50,
        );
        let on_b = merge_collections(
            &ReplicaState::from_records(vec![theirs.clone()]).unwrap(),
            &ReplicaState::from_records(vec![mine.clone()]).unwrap(),
            50,
        );

        assert_eq!(on_a.state, on_b.state);
        assert_eq!(on_a.state.len(), 2);
        assert_eq!(on_a.state.get(&RecordId::from(7)), Some(&mine));

        let moved = on_a.state.get(&RecordId::new("7~tab-b")).unwrap();
        assert_eq!(moved.field("location"), Some("Gym"));

        assert_eq!(on_a.collisions.len(), 1);
        assert_eq!(on_a.collisions[0].kept_origin, "tab-a");
        assert_eq!(on_a.collisions[0].moved_to, RecordId::new("7~tab-b"));
    }

    #[test]
    fn same_origin_is_an_update_not_a_collision() {
        let v1 = secondary("a-1", 1).with_origin("tab-a").with_field("title", "v1");
        let v2 = primary("a-1", 2).with_origin("tab-a").with_field("title", "v2");
        let outcome = merge_collections(
            &ReplicaState::from_records(vec![v1]).unwrap(),
            &ReplicaState::from_records(vec![v2.clone()]).unwrap(),
            5,
        );
        assert!(outcome.collisions.is_empty());
        assert_eq!(outcome.state.records(), &[v2]);
    }

    fn record_strategy() -> impl Strategy<Value = Record> {
        (
            0u64..20,
            0u64..5,
            prop_oneof![
                Just(UpdatedBy::PrimaryWriter),
                Just(UpdatedBy::SecondaryWriter),
                Just(UpdatedBy::Merged)
            ],
            prop::collection::btree_map("[a-c]", "[a-z]{0,3}", 0..3),
            any::<bool>(),
        )
            .prop_map(|(id, ts, by, fields, claimed)| Record {
                id: RecordId::from(id),
                fields,
                status: if claimed {
                    ClaimStatus::Claimed
                } else {
                    ClaimStatus::Unclaimed
                },
                last_updated: ts,
                updated_by: by,
                origin: None,
            })
    }

    fn state_strategy() -> impl Strategy<Value = ReplicaState> {
        prop::collection::btree_map(0u64..20, record_strategy(), 0..8).prop_map(|m| {
            let records = m
                .into_iter()
                .map(|(id, mut r)| {
                    r.id = RecordId::from(id);
                    r
                })
                .collect();
            ReplicaState::from_records(records).unwrap()
        })
    }

    proptest! {
        #[test]
        fn merge_is_idempotent(state in state_strategy()) {
            let outcome = merge_collections(&state, &state, 1_000);
            prop_assert_eq!(outcome.state, state);
            prop_assert!(outcome.added.is_empty());
            prop_assert!(outcome.updated.is_empty());
        }

        #[test]
        fn disjoint_additions_commute(a in state_strategy(), b in state_strategy()) {
            let b_only: Vec<Record> = b.iter().filter(|r| !a.contains(&r.id)).cloned().collect();
            let b = ReplicaState::from_records(b_only).unwrap();
            let ab = merge_collections(&a, &b, 1_000).state;
            let ba = merge_collections(&b, &a, 1_000).state;
            prop_assert_eq!(ab, ba);
        }

        #[test]
        fn primary_version_wins(mut p in record_strategy(), mut s in record_strategy()) {
            p.updated_by = UpdatedBy::PrimaryWriter;
            s.updated_by = UpdatedBy::SecondaryWriter;
            s.id = p.id.clone();
            s.status = p.status;
            prop_assert_eq!(resolve_record(&p, &s, 1_000), p.clone());
            prop_assert_eq!(resolve_record(&s, &p, 1_000), p);
        }

        #[test]
        fn newer_version_wins(mut a in record_strategy(), mut b in record_strategy(), primary_side in any::<bool>()) {
            let by = if primary_side { UpdatedBy::PrimaryWriter } else { UpdatedBy::SecondaryWriter };
            a.updated_by = by;
            b.updated_by = by;
            b.id = a.id.clone();
            b.status = a.status;
            prop_assume!(a.last_updated != b.last_updated);
            let newer = if a.last_updated > b.last_updated { a.clone() } else { b.clone() };
            prop_assert_eq!(resolve_record(&a, &b, 1_000), newer);
        }

        #[test]
        fn union_never_drops_fields(mut a in record_strategy(), mut b in record_strategy()) {
            b.id = a.id.clone();
            b.last_updated = a.last_updated;
            a.updated_by = UpdatedBy::SecondaryWriter;
            b.updated_by = UpdatedBy::SecondaryWriter;
            let merged = resolve_record(&a, &b, 1_000);
            for name in a.fields.keys().chain(b.fields.keys()) {
                if a.field(name).is_some() || b.field(name).is_some() {
                    prop_assert!(merged.field(name).is_some(), "field {} lost", name);
                }
            }
        }
    }
}
