//! Identifier assignment.

use crate::record::RecordId;
use crate::state::ReplicaState;

/// How new record identifiers are minted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IdStrategy {
    /// Largest numeric identifier plus one.
    ///
    /// Only safe with a single concurrent writer: two replicas adding while
    /// disconnected mint the same identifier. Merge detects the collision
    /// through record origins and separates the records.
    Sequential,
    /// `"{prefix}-{n}"` where the prefix is unique per replica and `n` counts
    /// up locally.
    #[default]
    ReplicaScoped,
}

/// Mints identifiers at mutation time.
#[derive(Debug, Clone)]
pub struct IdGenerator {
    strategy: IdStrategy,
    prefix: String,
    counter: u64,
}

impl IdGenerator {
    /// Creates a generator. `prefix` is used by [`IdStrategy::ReplicaScoped`].
    pub fn new(strategy: IdStrategy, prefix: impl Into<String>) -> Self {
        Self {
            strategy,
            prefix: prefix.into(),
            counter: 0,
        }
    }

    /// Returns the strategy.
    pub fn strategy(&self) -> IdStrategy {
        self.strategy
    }

    /// Mints the next identifier that does not clash with `state`.
    pub fn next_id(&mut self, state: &ReplicaState) -> RecordId {
        match self.strategy {
            IdStrategy::Sequential => {
                let next = match state.max_numeric_id() {
                    Some(n) => n.checked_add(1),
                    None => Some(1),
                }
                .zip(self.counter.checked_add(1))
                .map(|(a, b)| a.max(b));
                match next {
                    Some(next) => {
                        self.counter = next;
                        RecordId::from(next)
                    }
                    // Numeric space exhausted.
                    None => self.next_scoped(state),
                }
            }
            IdStrategy::ReplicaScoped => self.next_scoped(state),
        }
    }

    fn next_scoped(&mut self, state: &ReplicaState) -> RecordId {
        let scoped = format!("{}-", self.prefix);
        let highest = state
            .known_ids()
            .filter_map(|id| id.as_str().strip_prefix(&scoped))
            .filter_map(|suffix| suffix.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        self.counter = self.counter.max(highest).saturating_add(1);
        RecordId::new(format!("{}{}", scoped, self.counter))
    }
}
