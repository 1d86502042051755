use redb::{ReadableTable, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    form::FormId,
};

/// `(form_id, version_number) -> json(VersionRecord)`
pub(crate) const FORM_VERSIONS: TableDefinition<(u64, u32), &[u8]> =
    TableDefinition::new("form_versions");

/// Opaque reference to a file held by object storage. The core never sees
/// file bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub key: String,
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    pub change_notes: Option<String>,
}

impl FileRef {
    pub fn new(key: impl Into<String>, file_name: impl Into<String>) -> Self {
        let file_name = file_name.into();
        let file_type = file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        Self {
            key: key.into(),
            file_name,
            file_size: 0,
            file_type,
            change_notes: None,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.key.trim().is_empty() {
            return Err(Error::Invalid("file key must not be empty".into()));
        }
        if self.file_name.trim().is_empty() {
            return Err(Error::Invalid("file name must not be empty".into()));
        }
        Ok(())
    }
}

/// One uploaded file version. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub form_id: FormId,
    pub version_number: u32,
    pub file: FileRef,
    pub uploaded_by: String,
    pub uploaded_at: u64,
}

impl VersionRecord {
    /// Audit entity id of this version, e.g. `12/v3`.
    pub fn entity_id(&self) -> String {
        format!("{}/v{}", self.form_id.0, self.version_number)
    }
}

/// Append `record`. A record with the same `(form, version)` key means
/// another writer got there first.
pub(crate) fn append_version(
    txn: &WriteTransaction,
    record: &VersionRecord,
) -> Result<()> {
    let mut table = txn.open_table(FORM_VERSIONS)?;
    let key = (record.form_id.0, record.version_number);
    if table.get(key)?.is_some() {
        return Err(Error::ConcurrentModification {
            form: record.form_id,
        });
    }
    let bytes = serde_json::to_vec(record)?;
    table.insert(key, bytes.as_slice())?;
    Ok(())
}

/// All versions of a form, oldest first.
pub(crate) fn list_versions(
    table: &impl ReadableTable<(u64, u32), &'static [u8]>,
    form_id: FormId,
) -> Result<Vec<VersionRecord>> {
    let mut versions = Vec::new();
    for entry in table.range((form_id.0, 0)..=(form_id.0, u32::MAX))? {
        let (_, v) = entry?;
        versions.push(serde_json::from_slice(v.value())?);
    }
    Ok(versions)
}

/// Highest recorded version number, or 0 when nothing was uploaded.
pub fn max_version(versions: &[VersionRecord]) -> u32 {
    versions
        .iter()
        .map(|v| v.version_number)
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use redb::{Database, ReadableDatabase};

    use super::*;

    fn record(form: u64, n: u32) -> VersionRecord {
        VersionRecord {
            form_id: FormId(form),
            version_number: n,
            file: FileRef::new(format!("forms/{form}/{n}"), "permit.pdf"),
            uploaded_by: "alice".into(),
            uploaded_at: u64::from(n),
        }
    }

    fn test_db() -> (tempfile::TempDir, Database) {
        let tmp = tempfile::tempdir().unwrap();
        let db = Database::create(tmp.path().join("versions.redb")).unwrap();
        (tmp, db)
    }

    #[test]
    fn file_type_from_name() {
        assert_eq!(FileRef::new("k", "Permit.PDF").file_type, "pdf");
        assert_eq!(FileRef::new("k", "README").file_type, "");
        assert!(FileRef::new(" ", "a.pdf").validate().is_err());
    }

    #[test]
    fn duplicate_version_is_a_conflict() {
        let (_tmp, db) = test_db();

        let txn = db.begin_write().unwrap();
        append_version(&txn, &record(1, 1)).unwrap();
        txn.commit().unwrap();

        let txn = db.begin_write().unwrap();
        assert!(matches!(
            append_version(&txn, &record(1, 1)),
            Err(Error::ConcurrentModification { form: FormId(1) })
        ));
        txn.abort().unwrap();

        let txn = db.begin_write().unwrap();
        append_version(&txn, &record(2, 1)).unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn list_is_scoped_and_ordered() {
        let (_tmp, db) = test_db();

        let txn = db.begin_write().unwrap();
        for (form, n) in [(1, 2), (2, 1), (1, 1), (1, 3)] {
            append_version(&txn, &record(form, n)).unwrap();
        }
        txn.commit().unwrap();

        let txn = db.begin_read().unwrap();
        let table = txn.open_table(FORM_VERSIONS).unwrap();
        let versions = list_versions(&table, FormId(1)).unwrap();
        let numbers: Vec<u32> =
            versions.iter().map(|v| v.version_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(max_version(&versions), 3);
        assert_eq!(versions[2].entity_id(), "1/v3");
        assert_eq!(max_version(&[]), 0);
    }
}
