//! Append-only audit trail.
//!
//! Records are keyed by a global sequence number so concurrent writers get a
//! total order even when timestamps collide. Two secondary tables index the
//! log by entity and by actor. There is no update or delete path.

use std::{fmt, str::FromStr};

use redb::{
    Database,
    ReadableDatabase,
    ReadableTable,
    TableDefinition,
    WriteTransaction,
};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    store::next_sequence,
};

/// `seq -> json(AuditRecord)`
pub(crate) const AUDIT_LOG: TableDefinition<u64, &[u8]> =
    TableDefinition::new("audit_log");
/// `("<entity_type>:<entity_id>", per-entity ordinal) -> seq`
pub(crate) const AUDIT_BY_ENTITY: TableDefinition<(&str, u64), u64> =
    TableDefinition::new("audit_by_entity");
/// `(actor, seq) -> ()`
pub(crate) const AUDIT_BY_ACTOR: TableDefinition<(&str, u64), ()> =
    TableDefinition::new("audit_by_actor");

const AUDIT_SEQUENCE: &str = "audit";
const AUDIT_CLOCK: &str = "audit_clock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Form,
    FormVersion,
}

impl EntityType {
    pub const ALL: [EntityType; 2] =
        [EntityType::Form, EntityType::FormVersion];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Form => "forms",
            EntityType::FormVersion => "form_versions",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        EntityType::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| Error::Invalid(format!("unknown entity type '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    Transition,
    Upload,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::Create => "CREATE",
            AuditAction::Update => "UPDATE",
            AuditAction::Delete => "DELETE",
            AuditAction::Transition => "TRANSITION",
            AuditAction::Upload => "UPLOAD",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub action: AuditAction,
    pub actor: String,
    pub old_values: Option<serde_json::Value>,
    pub new_values: Option<serde_json::Value>,
    pub description: Option<String>,
    pub timestamp: u64,
}

/// An audit record before the log assigns its sequence and timestamp.
#[derive(Debug, Clone)]
pub(crate) struct NewAuditRecord {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub action: AuditAction,
    pub actor: String,
    pub old_values: Option<serde_json::Value>,
    pub new_values: Option<serde_json::Value>,
    pub description: Option<String>,
}

fn entity_key(entity_type: EntityType, entity_id: &str) -> String {
    format!("{}:{entity_id}", entity_type.as_str())
}

/// Append `record` inside the caller's write transaction.
///
/// The timestamp never goes backwards relative to earlier records, even if
/// the wall clock does.
pub(crate) fn append(
    txn: &WriteTransaction,
    record: NewAuditRecord,
    now: u64,
) -> Result<AuditRecord> {
    let seq = next_sequence(txn, AUDIT_SEQUENCE)?;
    let timestamp = {
        let mut clock = txn.open_table(crate::store::SEQUENCES)?;
        let last = clock.get(AUDIT_CLOCK)?.map(|v| v.value()).unwrap_or(0);
        let ts = now.max(last);
        clock.insert(AUDIT_CLOCK, ts)?;
        ts
    };

    let stored = AuditRecord {
        seq,
        entity_type: record.entity_type,
        entity_id: record.entity_id,
        action: record.action,
        actor: record.actor,
        old_values: record.old_values,
        new_values: record.new_values,
        description: record.description,
        timestamp,
    };

    let bytes = serde_json::to_vec(&stored)?;
    txn.open_table(AUDIT_LOG)?.insert(seq, bytes.as_slice())?;

    let key = entity_key(stored.entity_type, &stored.entity_id);
    {
        let mut by_entity = txn.open_table(AUDIT_BY_ENTITY)?;
        let ordinal = match by_entity
            .range((key.as_str(), 0)..=(key.as_str(), u64::MAX))?
            .next_back()
        {
            Some(entry) => entry?.0.value().1 + 1,
            None => 0,
        };
        by_entity.insert((key.as_str(), ordinal), seq)?;
    }
    txn.open_table(AUDIT_BY_ACTOR)?
        .insert((stored.actor.as_str(), seq), ())?;

    Ok(stored)
}

/// Read-only view over the audit trail.
pub struct AuditLog<'a> {
    db: &'a Database,
}

impl<'a> AuditLog<'a> {
    pub(crate) fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Every record about one entity, oldest first.
    pub fn find_by_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Vec<AuditRecord>> {
        let txn = self.db.begin_read()?;
        let index = txn.open_table(AUDIT_BY_ENTITY)?;
        let log = txn.open_table(AUDIT_LOG)?;

        let key = entity_key(entity_type, entity_id);
        let mut records = Vec::new();
        let range = (key.as_str(), 0)..=(key.as_str(), u64::MAX);
        for entry in index.range(range)? {
            let (_, seq) = entry?;
            records.push(load(&log, seq.value())?);
        }
        Ok(records)
    }

    /// Every record written by `actor`, oldest first.
    pub fn find_by_actor(&self, actor: &str) -> Result<Vec<AuditRecord>> {
        let txn = self.db.begin_read()?;
        let index = txn.open_table(AUDIT_BY_ACTOR)?;
        let log = txn.open_table(AUDIT_LOG)?;

        let mut records = Vec::new();
        for entry in index.range((actor, 0)..=(actor, u64::MAX))? {
            let (key, _) = entry?;
            records.push(load(&log, key.value().1)?);
        }
        Ok(records)
    }

    /// Records with `from <= timestamp <= to`, oldest first.
    pub fn find_in_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<AuditRecord>> {
        let txn = self.db.begin_read()?;
        let log = txn.open_table(AUDIT_LOG)?;

        let mut records = Vec::new();
        for entry in log.iter()? {
            let (_, v) = entry?;
            let record: AuditRecord = serde_json::from_slice(v.value())?;
            // timestamps are non-decreasing in seq order
            if record.timestamp > to {
                break;
            }
            if record.timestamp >= from {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub fn len(&self) -> Result<u64> {
        use redb::ReadableTableMetadata;

        let txn = self.db.begin_read()?;
        Ok(txn.open_table(AUDIT_LOG)?.len()?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

fn load(
    log: &impl ReadableTable<u64, &'static [u8]>,
    seq: u64,
) -> Result<AuditRecord> {
    let guard = log.get(seq)?.ok_or_else(|| Error::NotFound {
        kind: "audit record",
        name: seq.to_string(),
    })?;
    Ok(serde_json::from_slice(guard.value())?)
}
