//! Change messages exchanged between replicas.

use crate::error::ProtocolResult;
use crate::record::{Record, RecordId, WriterRole};
use crate::state::ReplicaState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kind of a change message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// A replica changed the collection.
    DataUpdate,
    /// A replica asks for a full state.
    SyncRequest,
    /// Full state answering a sync request.
    SyncResponse,
    /// Conflicting records were detected.
    ConflictNotice,
    /// A replica came online.
    PresenceOnline,
    /// A replica is going away.
    PresenceOffline,
    /// Liveness probe.
    Ping,
    /// Liveness answer.
    Pong,
    /// Any type this version does not know.
    #[serde(other)]
    Unknown,
}

impl MessageType {
    /// Returns the wire name of the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::DataUpdate => "data_update",
            MessageType::SyncRequest => "sync_request",
            MessageType::SyncResponse => "sync_response",
            MessageType::ConflictNotice => "conflict_notice",
            MessageType::PresenceOnline => "presence_online",
            MessageType::PresenceOffline => "presence_offline",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Unknown => "unknown",
        }
    }

    /// Returns true if messages of this type carry a collection snapshot.
    pub fn carries_state(&self) -> bool {
        matches!(
            self,
            MessageType::DataUpdate | MessageType::SyncResponse | MessageType::ConflictNotice
        )
    }
}

/// The envelope sent over every transport mechanism.
///
/// Wire form: `{"type": ..., "data"?: [...], "removed"?: {...},
/// "timestamp": ms, "source"?: "primary"|"secondary", "replica"?: id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMessage {
    /// Message kind.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Records carried by the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<Record>>,
    /// Explicit deletions carried by the message.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub removed: BTreeMap<RecordId, u64>,
    /// Send time in milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Role of the sending replica.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<WriterRole>,
    /// Identifier of the sending replica.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica: Option<String>,
}

impl ChangeMessage {
    /// Creates a message without payload.
    pub fn new(kind: MessageType, timestamp: u64) -> Self {
        Self {
            kind,
            data: None,
            removed: BTreeMap::new(),
            timestamp,
            source: None,
            replica: None,
        }
    }

    /// Creates a message carrying a full collection snapshot.
    pub fn with_state(kind: MessageType, state: &ReplicaState, timestamp: u64) -> Self {
        Self {
            data: Some(state.records().to_vec()),
            removed: state.tombstones().clone(),
            ..Self::new(kind, timestamp)
        }
    }

    /// Creates a `data_update` carrying `state`.
    pub fn data_update(state: &ReplicaState, timestamp: u64) -> Self {
        Self::with_state(MessageType::DataUpdate, state, timestamp)
    }

    /// Creates a `sync_response` carrying `state`.
    pub fn sync_response(state: &ReplicaState, timestamp: u64) -> Self {
        Self::with_state(MessageType::SyncResponse, state, timestamp)
    }

    /// Creates a `conflict_notice` carrying the conflicting records.
    pub fn conflict_notice(records: Vec<Record>, timestamp: u64) -> Self {
        Self {
            data: Some(records),
            ..Self::new(MessageType::ConflictNotice, timestamp)
        }
    }

    /// Sets the sender role.
    pub fn from_role(mut self, role: WriterRole) -> Self {
        self.source = Some(role);
        self
    }

    /// Sets the sender replica id.
    pub fn from_replica(mut self, replica: impl Into<String>) -> Self {
        self.replica = Some(replica.into());
        self
    }

    /// Returns true if the sender declared itself a primary writer.
    pub fn is_from_primary(&self) -> bool {
        self.source == Some(WriterRole::Primary)
    }

    /// Rebuilds the collection snapshot carried by the message.
    ///
    /// Returns `Ok(None)` for messages without records.
    ///
    /// # Errors
    ///
    /// Returns an error if a record is malformed or an identifier repeats.
    pub fn snapshot(&self) -> ProtocolResult<Option<ReplicaState>> {
        match &self.data {
            Some(records) => {
                ReplicaState::from_parts(records.clone(), self.removed.clone()).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Encodes the message as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a message from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed JSON or a missing `type`/`timestamp`.
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
