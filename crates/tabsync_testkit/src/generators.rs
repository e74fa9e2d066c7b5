//! Property-based test generators using proptest.
//!
//! Generated records always satisfy record validation, so strategies compose
//! into valid [`ReplicaState`]s.

use proptest::prelude::*;
use std::collections::BTreeMap;
use tabsync_protocol::{ClaimStatus, Record, RecordId, ReplicaState, UpdatedBy};

/// Strategy for identifiers: small numbers (to force overlap) or
/// replica-scoped names.
pub fn record_id_strategy() -> impl Strategy<Value = RecordId> {
    prop_oneof![
        (1u64..8).prop_map(RecordId::from),
        ("[ab]", 1u64..4).prop_map(|(prefix, n)| RecordId::new(format!("{prefix}-{n}"))),
    ]
}

/// Strategy for field maps. `title` is always present; other fields may be
/// empty strings, which count as absent.
pub fn fields_strategy() -> impl Strategy<Value = BTreeMap<String, String>> {
    (
        "[A-Z][a-z]{1,8}",
        prop::collection::btree_map("(location|notes|color)", "[a-z]{0,6}", 0..3),
    )
        .prop_map(|(title, mut fields)| {
            fields.insert("title".into(), title);
            fields
        })
}

/// Strategy for writer markers.
pub fn updated_by_strategy() -> impl Strategy<Value = UpdatedBy> {
    prop_oneof![
        Just(UpdatedBy::PrimaryWriter),
        Just(UpdatedBy::SecondaryWriter),
        Just(UpdatedBy::Merged),
    ]
}

/// Strategy for claim status.
pub fn claim_status_strategy() -> impl Strategy<Value = ClaimStatus> {
    prop_oneof![Just(ClaimStatus::Unclaimed), Just(ClaimStatus::Claimed)]
}

/// Strategy for a record with the given identifier. Timestamps come from a
/// narrow range so that ties happen.
pub fn record_with_id(id: RecordId) -> impl Strategy<Value = Record> {
    (
        fields_strategy(),
        claim_status_strategy(),
        1u64..20,
        updated_by_strategy(),
    )
        .prop_map(move |(fields, status, last_updated, updated_by)| Record {
            id: id.clone(),
            fields,
            status,
            last_updated,
            updated_by,
            origin: None,
        })
}

/// Strategy for a record with any identifier.
pub fn record_strategy() -> impl Strategy<Value = Record> {
    record_id_strategy().prop_flat_map(record_with_id)
}

/// Strategy for a valid collection with optional tombstones.
pub fn replica_state_strategy() -> impl Strategy<Value = ReplicaState> {
    (
        prop::collection::vec(record_strategy(), 0..8),
        prop::collection::btree_map(record_id_strategy(), 1u64..20, 0..3),
    )
        .prop_map(|(records, tombstones)| {
            let unique: BTreeMap<RecordId, Record> =
                records.into_iter().map(|r| (r.id.clone(), r)).collect();
            ReplicaState::from_parts(unique.into_values().collect(), tombstones)
                .expect("generated records are valid")
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn generated_records_validate(record in record_strategy()) {
            prop_assert!(record.validate().is_ok());
            prop_assert!(record.field("title").is_some());
        }
    }
}
