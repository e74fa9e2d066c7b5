//! Replicated records.

use crate::error::{ProtocolError, ProtocolResult};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Stable identifier of a record.
///
/// Identifiers are text. Numeric identifiers (as minted by the sequential
/// strategy) order numerically and sort before every non-numeric identifier,
/// so `"7" < "10" < "a1b2-1"`. JSON numbers are accepted when decoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordId(String);

impl RecordId {
    /// Creates an identifier from text.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the numeric value if the identifier is a plain integer.
    pub fn as_number(&self) -> Option<u64> {
        if self.0.is_empty() || !self.0.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        self.0.parse().ok()
    }

    /// Returns true if the identifier is empty or only whitespace.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl From<u64> for RecordId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Ord for RecordId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.as_number(), other.as_number()) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for RecordId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for RecordId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

struct RecordIdVisitor;

impl Visitor<'_> for RecordIdVisitor {
    type Value = RecordId;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a string or non-negative integer record id")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<RecordId, E> {
        Ok(RecordId::new(v))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<RecordId, E> {
        Ok(RecordId(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<RecordId, E> {
        Ok(RecordId::from(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<RecordId, E> {
        u64::try_from(v)
            .map(RecordId::from)
            .map_err(|_| E::custom("record id must not be negative"))
    }
}

impl<'de> Deserialize<'de> for RecordId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(RecordIdVisitor)
    }
}

/// Role a replica plays when writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriterRole {
    /// Authoritative writer (e.g. an administrative console).
    Primary,
    /// Any non-authoritative writer.
    Secondary,
}

impl WriterRole {
    /// Returns the `updated_by` marker for writes made in this role.
    pub fn updated_by(self) -> UpdatedBy {
        match self {
            WriterRole::Primary => UpdatedBy::PrimaryWriter,
            WriterRole::Secondary => UpdatedBy::SecondaryWriter,
        }
    }
}

/// Who produced the current version of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdatedBy {
    /// Written by a primary-writer replica.
    PrimaryWriter,
    /// Written by a secondary-writer replica.
    SecondaryWriter,
    /// Produced by a field-level merge.
    Merged,
}

/// Terminal claim state of a record.
///
/// `Claimed` dominates `Unclaimed` in every merge.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    /// Open.
    #[default]
    Unclaimed,
    /// Resolved; never reverts through a merge.
    Claimed,
}

/// A replicated record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Stable identifier.
    pub id: RecordId,
    /// Mutable text fields. An empty string counts as absent.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    /// Claim status.
    #[serde(default)]
    pub status: ClaimStatus,
    /// Milliseconds since the Unix epoch of the last write.
    pub last_updated: u64,
    /// Producer of this version.
    pub updated_by: UpdatedBy,
    /// Replica that minted the identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl Record {
    /// Creates a record with no fields.
    pub fn new(id: impl Into<RecordId>, last_updated: u64, updated_by: UpdatedBy) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
            status: ClaimStatus::Unclaimed,
            last_updated,
            updated_by,
            origin: None,
        }
    }

    /// Sets a field, builder style.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Sets the claim status, builder style.
    pub fn with_status(mut self, status: ClaimStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets the minting replica, builder style.
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Returns a field value, treating empty strings as absent.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Returns true if the record was written by a primary writer.
    pub fn is_primary(&self) -> bool {
        self.updated_by == UpdatedBy::PrimaryWriter
    }

    /// Checks the record's shape.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidRecord`] if the id is blank or a field
    /// name is empty.
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.id.is_blank() {
            return Err(ProtocolError::invalid_record("record id is empty"));
        }
        validate_field_names(&self.fields)
    }
}

pub(crate) fn validate_field_names(fields: &BTreeMap<String, String>) -> ProtocolResult<()> {
    if fields.keys().any(|k| k.trim().is_empty()) {
        return Err(ProtocolError::invalid_record("field name is empty"));
    }
    Ok(())
}

/// Caller input for a new record; the engine assigns identity and metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordDraft {
    /// Field values.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    /// Initial claim status.
    #[serde(default)]
    pub status: ClaimStatus,
}

impl RecordDraft {
    /// Creates an empty draft.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a field, builder style.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Sets the claim status, builder style.
    pub fn with_status(mut self, status: ClaimStatus) -> Self {
        self.status = status;
        self
    }

    /// Checks that the draft has fields and that `required` fields are set.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidRecord`] describing the first problem.
    pub fn validate(&self, required: &[String]) -> ProtocolResult<()> {
        if self.fields.is_empty() {
            return Err(ProtocolError::invalid_record("record has no fields"));
        }
        validate_field_names(&self.fields)?;
        for name in required {
            let present = self
                .fields
                .get(name)
                .is_some_and(|v| !v.trim().is_empty());
            if !present {
                return Err(ProtocolError::invalid_record(format!(
                    "required field {name:?} is missing"
                )));
            }
        }
        Ok(())
    }

    /// Turns the draft into a record.
    pub fn into_record(
        self,
        id: RecordId,
        last_updated: u64,
        updated_by: UpdatedBy,
        origin: Option<String>,
    ) -> Record {
        Record {
            id,
            fields: self.fields,
            status: self.status,
            last_updated,
            updated_by,
            origin,
        }
    }
}
