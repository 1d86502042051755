use std::path::Path;

use rayon::prelude::*;
use redb::{
    Database,
    ReadableDatabase,
    ReadableTable,
    ReadableTableMetadata,
    TableDefinition,
    WriteTransaction,
};
use serde::{Deserialize, Serialize};

use crate::{
    audit::{
        self,
        AUDIT_BY_ACTOR,
        AUDIT_BY_ENTITY,
        AUDIT_LOG,
        AuditLog,
        AuditRecord,
        NewAuditRecord,
    },
    error::{Error, Result},
    form::{Form, FormId},
    search_document::{SEARCH_DOCUMENTS, SearchDocument},
    versions::{self, FORM_VERSIONS, VersionRecord},
    workflow::{self, NewWorkflowEvent, WORKFLOW_EVENTS, WorkflowEvent},
};

const FORMS: TableDefinition<u64, &[u8]> = TableDefinition::new("forms");
pub(crate) const SEQUENCES: TableDefinition<&str, u64> =
    TableDefinition::new("sequences");
const SETTINGS: TableDefinition<&str, &str> = TableDefinition::new("settings");
/// `(form_id, ordinal) -> json(DownloadRecord)`
const DOWNLOADS: TableDefinition<(u64, u64), &[u8]> =
    TableDefinition::new("downloads");
const DOWNLOAD_COUNTS: TableDefinition<u64, u64> =
    TableDefinition::new("download_counts");

const FORM_SEQUENCE: &str = "forms";

/// Take the next value of the named sequence. Sequences start at 1.
pub(crate) fn next_sequence(
    txn: &WriteTransaction,
    name: &str,
) -> Result<u64> {
    let mut table = txn.open_table(SEQUENCES)?;
    let next = table.get(name)?.map(|v| v.value()).unwrap_or(0) + 1;
    table.insert(name, next)?;
    Ok(next)
}

/// Everything one form mutation writes. Applied in a single transaction.
#[derive(Debug)]
pub(crate) struct Mutation {
    /// New state of the form row.
    pub form: Form,
    /// Revision the writer loaded, or `None` for a new form.
    pub expected_revision: Option<u64>,
    pub version: Option<VersionRecord>,
    pub event: Option<NewWorkflowEvent>,
    pub audit: Vec<NewAuditRecord>,
}

#[derive(Debug)]
pub(crate) struct Committed {
    pub form: Form,
    pub event: Option<WorkflowEvent>,
    pub audit: Vec<AuditRecord>,
    pub document: SearchDocument,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub form_id: FormId,
    pub version_number: u32,
    pub actor: String,
    pub timestamp: u64,
}

/// Table sizes reported by `formdex status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CatalogStats {
    pub forms: u64,
    pub versions: u64,
    pub workflow_events: u64,
    pub audit_records: u64,
    pub downloads: u64,
}

/// The authoritative catalog: form rows, their append-only logs, the
/// search projection and settings, all in one redb file.
pub struct CatalogDb {
    db: Database,
}

impl CatalogDb {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).map_err(redb::Error::from)?;

        // Ensure all tables exist by opening them in a write transaction.
        let txn = db.begin_write()?;
        txn.open_table(FORMS)?;
        txn.open_table(SEQUENCES)?;
        txn.open_table(SETTINGS)?;
        txn.open_table(DOWNLOADS)?;
        txn.open_table(DOWNLOAD_COUNTS)?;
        txn.open_table(FORM_VERSIONS)?;
        txn.open_table(WORKFLOW_EVENTS)?;
        txn.open_table(AUDIT_LOG)?;
        txn.open_table(AUDIT_BY_ENTITY)?;
        txn.open_table(AUDIT_BY_ACTOR)?;
        txn.open_table(SEARCH_DOCUMENTS)?;
        txn.commit()?;

        Ok(Self { db })
    }

    #[cfg(test)]
    pub(crate) fn database(&self) -> &Database {
        &self.db
    }

    pub fn audit(&self) -> AuditLog<'_> {
        AuditLog::new(&self.db)
    }

    // -- Forms --

    /// Reserve a fresh form id.
    pub(crate) fn allocate_form_id(&self) -> Result<FormId> {
        let txn = self.db.begin_write()?;
        let id = next_sequence(&txn, FORM_SEQUENCE)?;
        txn.commit()?;
        Ok(FormId(id))
    }

    /// Load a form row, including soft-deleted ones.
    pub fn load_form(&self, id: FormId) -> Result<Option<Form>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(FORMS)?;
        match table.get(id.0)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    /// All form rows, including soft-deleted ones, ordered by id.
    pub fn list_forms(&self) -> Result<Vec<Form>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(FORMS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (_, v) = entry?;
            result.push(serde_json::from_slice(v.value())?);
        }
        Ok(result)
    }

    /// Apply `mutation` atomically.
    ///
    /// Fails with `ConcurrentModification` if the stored form changed since
    /// it was loaded, or if the version number is already taken. Nothing is
    /// written in that case.
    pub(crate) fn commit(&self, mutation: Mutation) -> Result<Committed> {
        let Mutation {
            mut form,
            expected_revision,
            version,
            event,
            audit: audit_records,
        } = mutation;
        let now = form.updated_at;

        let txn = self.db.begin_write()?;
        {
            let mut forms = txn.open_table(FORMS)?;
            let stored_revision = match forms.get(form.id.0)? {
                Some(v) => {
                    Some(serde_json::from_slice::<Form>(v.value())?.revision)
                }
                None => None,
            };
            if stored_revision != expected_revision {
                return Err(Error::ConcurrentModification { form: form.id });
            }
            form.revision = expected_revision.map_or(0, |r| r + 1);
            let bytes = serde_json::to_vec(&form)?;
            forms.insert(form.id.0, bytes.as_slice())?;
        }

        if let Some(version) = &version {
            versions::append_version(&txn, version)?;
        }

        let event = match event {
            Some(e) => Some(workflow::append_event(&txn, form.id, e, now)?),
            None => None,
        };

        let mut audit = Vec::with_capacity(audit_records.len());
        for record in audit_records {
            audit.push(audit::append(&txn, record, now)?);
        }

        let downloads = download_count_in(&txn, form.id)?;
        let document = SearchDocument::from_form(&form, downloads);
        put_document(&txn, &document)?;

        txn.commit()?;

        Ok(Committed {
            form,
            event,
            audit,
            document,
        })
    }

    /// Workflow events and version records of a form, oldest first.
    pub fn history(
        &self,
        id: FormId,
    ) -> Result<(Vec<WorkflowEvent>, Vec<VersionRecord>)> {
        let txn = self.db.begin_read()?;
        let events =
            workflow::list_events(&txn.open_table(WORKFLOW_EVENTS)?, id)?;
        let versions =
            versions::list_versions(&txn.open_table(FORM_VERSIONS)?, id)?;
        Ok((events, versions))
    }

    // -- Search projection --

    pub fn load_document(
        &self,
        id: FormId,
    ) -> Result<Option<SearchDocument>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SEARCH_DOCUMENTS)?;
        match table.get(id.0)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    /// Every stored projection, ordered by form id.
    pub fn list_documents(&self) -> Result<Vec<SearchDocument>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SEARCH_DOCUMENTS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (_, v) = entry?;
            result.push(serde_json::from_slice(v.value())?);
        }
        Ok(result)
    }

    /// Recompute every projection from the authoritative form rows and
    /// return the rows it was built from.
    ///
    /// Runs inside one write transaction, so no concurrent commit can slip
    /// between reading a row and writing its projection.
    pub(crate) fn rebuild_documents(&self) -> Result<Vec<Form>> {
        let txn = self.db.begin_write()?;
        let mut rows = Vec::new();
        {
            let forms = txn.open_table(FORMS)?;
            let counts = txn.open_table(DOWNLOAD_COUNTS)?;
            for entry in forms.iter()? {
                let (k, v) = entry?;
                let form: Form = serde_json::from_slice(v.value())?;
                let downloads =
                    counts.get(k.value())?.map(|c| c.value()).unwrap_or(0);
                rows.push((form, downloads));
            }
        }

        let documents: Vec<SearchDocument> = rows
            .par_iter()
            .map(|(form, count)| SearchDocument::from_form(form, *count))
            .collect();
        {
            let mut table = txn.open_table(SEARCH_DOCUMENTS)?;
            table.retain(|_, _| false)?;
        }
        for document in &documents {
            put_document(&txn, document)?;
        }
        txn.commit()?;

        Ok(rows.into_iter().map(|(form, _)| form).collect())
    }

    // -- Downloads --

    /// Record a download of the form's current version and return the new
    /// download count. The projection is updated in the same transaction.
    pub(crate) fn record_download(
        &self,
        form: &Form,
        actor: &str,
        now: u64,
    ) -> Result<u64> {
        let txn = self.db.begin_write()?;
        let count = {
            let mut downloads = txn.open_table(DOWNLOADS)?;
            let ordinal = match downloads
                .range((form.id.0, 0)..=(form.id.0, u64::MAX))?
                .next_back()
            {
                Some(entry) => entry?.0.value().1 + 1,
                None => 0,
            };
            let record = DownloadRecord {
                form_id: form.id,
                version_number: form.current_version,
                actor: actor.to_string(),
                timestamp: now,
            };
            let bytes = serde_json::to_vec(&record)?;
            downloads.insert((form.id.0, ordinal), bytes.as_slice())?;

            let mut counts = txn.open_table(DOWNLOAD_COUNTS)?;
            let count =
                counts.get(form.id.0)?.map(|v| v.value()).unwrap_or(0) + 1;
            counts.insert(form.id.0, count)?;
            count
        };

        let mut document = SearchDocument::from_form(form, count);
        {
            let table = txn.open_table(SEARCH_DOCUMENTS)?;
            if let Some(stored) = table.get(form.id.0)? {
                let stored: SearchDocument =
                    serde_json::from_slice(stored.value())?;
                document.updated_at = stored.updated_at;
            }
        }
        put_document(&txn, &document)?;

        txn.commit()?;
        Ok(count)
    }

    pub fn download_count(&self, id: FormId) -> Result<u64> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOWNLOAD_COUNTS)?;
        Ok(table.get(id.0)?.map(|v| v.value()).unwrap_or(0))
    }

    pub fn list_downloads(&self, id: FormId) -> Result<Vec<DownloadRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOWNLOADS)?;
        let mut result = Vec::new();
        for entry in table.range((id.0, 0)..=(id.0, u64::MAX))? {
            let (_, v) = entry?;
            result.push(serde_json::from_slice(v.value())?);
        }
        Ok(result)
    }

    pub fn stats(&self) -> Result<CatalogStats> {
        let txn = self.db.begin_read()?;
        Ok(CatalogStats {
            forms: txn.open_table(FORMS)?.len()?,
            versions: txn.open_table(FORM_VERSIONS)?.len()?,
            workflow_events: txn.open_table(WORKFLOW_EVENTS)?.len()?,
            audit_records: txn.open_table(AUDIT_LOG)?.len()?,
            downloads: txn.open_table(DOWNLOADS)?.len()?,
        })
    }

    // -- Settings --

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SETTINGS)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        Ok(table.get(key)?.map(|v| v.value().to_string()))
    }

    pub fn remove_setting(&self, key: &str) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(SETTINGS)?;
            table.remove(key)?.is_some()
        };
        txn.commit()?;
        Ok(removed)
    }

    pub fn list_settings(&self) -> Result<Vec<(String, String)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            result.push((k.value().to_string(), v.value().to_string()));
        }
        Ok(result)
    }
}

impl std::fmt::Debug for CatalogDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogDb").finish_non_exhaustive()
    }
}

fn put_document(
    txn: &WriteTransaction,
    document: &SearchDocument,
) -> Result<()> {
    let bytes = serde_json::to_vec(document)?;
    txn.open_table(SEARCH_DOCUMENTS)?
        .insert(document.form_id.0, bytes.as_slice())?;
    Ok(())
}

fn download_count_in(txn: &WriteTransaction, id: FormId) -> Result<u64> {
    let table = txn.open_table(DOWNLOAD_COUNTS)?;
    Ok(table.get(id.0)?.map(|v| v.value()).unwrap_or(0))
}
