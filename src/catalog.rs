//! The public face of the engine: every mutation and query goes through a
//! [`Catalog`].
//!
//! A mutation holds its form's writer lock from load to index refresh, and
//! commits the row, its log entries, its audit records and its search
//! projection in one transaction.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio::runtime::Handle;

use crate::{
    audit::{AuditAction, AuditLog, EntityType, NewAuditRecord},
    caller::{Caller, Capability},
    data_dir::DataDir,
    embedding::{EmbeddingProvider, provider_from_settings},
    embedding_db::EmbeddingDb,
    error::{Error, Result},
    form::{Form, FormId, FormPatch, NewForm, now_millis},
    indexer::{RebuildReport, SearchIndexer},
    locks::{FormLocks, hold},
    query::{QueryEngine, SearchPage, SearchRequest},
    search_index::SearchIndex,
    settings::{EmbedderKind, Settings, UploadPolicy},
    store::{CatalogDb, CatalogStats, Committed, Mutation},
    versions::{FileRef, VersionRecord},
    visibility,
    workflow::{
        self,
        NewWorkflowEvent,
        WorkflowAction,
        WorkflowEvent,
        WorkflowStatus,
    },
};

/// Ordered workflow and version history of one form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormHistory {
    pub form_id: FormId,
    pub status: WorkflowStatus,
    pub current_version: u32,
    pub events: Vec<WorkflowEvent>,
    pub versions: Vec<VersionRecord>,
}

/// What a caller receives for a download: the file of the current version.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Download {
    pub version: VersionRecord,
    /// Download count including this one.
    pub downloads: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogStatus {
    pub stats: CatalogStats,
    pub indexed_documents: u64,
    pub embeddings: usize,
    pub failing_embeddings: u64,
    pub embedder: EmbedderKind,
    pub model: String,
}

pub struct Catalog {
    db: Arc<CatalogDb>,
    index: Arc<SearchIndex>,
    embeddings: Arc<EmbeddingDb>,
    indexer: SearchIndexer,
    query: QueryEngine,
    provider: Arc<dyn EmbeddingProvider>,
    settings: Settings,
    locks: FormLocks,
}

impl Catalog {
    /// Open the catalog in `data_dir` with its stored settings and the
    /// embedder they select. Must be called inside a tokio runtime.
    pub fn open(data_dir: &DataDir) -> Result<Self> {
        let db = CatalogDb::open(&data_dir.catalog_db())?;
        let settings = Settings::load(&db)?;
        let provider = provider_from_settings(&settings);
        Self::assemble(db, data_dir, settings, provider)
    }

    /// Open with explicit settings and embedder.
    pub fn open_with(
        data_dir: &DataDir,
        settings: Settings,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let db = CatalogDb::open(&data_dir.catalog_db())?;
        Self::assemble(db, data_dir, settings, provider)
    }

    fn assemble(
        db: CatalogDb,
        data_dir: &DataDir,
        settings: Settings,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| {
            Error::Config("catalog opened outside a tokio runtime".into())
        })?;

        let db = Arc::new(db);
        let index = Arc::new(SearchIndex::open(&data_dir.tantivy_dir()?)?);
        let embeddings =
            Arc::new(EmbeddingDb::open(&data_dir.embeddings_db())?);

        let indexer = SearchIndexer::start(
            Arc::clone(&index),
            Arc::clone(&db),
            Arc::clone(&embeddings),
            Arc::clone(&provider),
            &settings,
            &runtime,
        )?;
        let query = QueryEngine::new(
            Arc::clone(&db),
            Arc::clone(&index),
            Arc::clone(&embeddings),
            Arc::clone(&provider),
            settings.clone(),
        );

        tracing::debug!(
            data_dir = %data_dir.root().display(),
            embedder = %settings.embedder,
            model = provider.model_id(),
            "opened catalog"
        );

        Ok(Self {
            db,
            index,
            embeddings,
            indexer,
            query,
            provider,
            settings,
            locks: FormLocks::default(),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn db(&self) -> &CatalogDb {
        &self.db
    }

    pub fn audit(&self) -> AuditLog<'_> {
        self.db.audit()
    }

    // -- Forms --

    pub fn create_form(&self, input: NewForm, caller: &Caller) -> Result<Form> {
        caller.require(Capability::FormCreate)?;

        let id = self.db.allocate_form_id()?;
        let form = input.into_form(id, &caller.id, now_millis())?;
        let snapshot = form.snapshot();

        let committed = self.db.commit(Mutation {
            form,
            expected_revision: None,
            version: None,
            event: Some(NewWorkflowEvent {
                action: WorkflowAction::Create,
                from: None,
                to: WorkflowStatus::Draft,
                actor: caller.id.clone(),
                reason: None,
            }),
            audit: vec![NewAuditRecord {
                entity_type: EntityType::Form,
                entity_id: id.0.to_string(),
                action: AuditAction::Create,
                actor: caller.id.clone(),
                old_values: None,
                new_values: Some(snapshot),
                description: Some("form created".into()),
            }],
        })?;

        tracing::info!(form = %id, actor = %caller.id, "created form");
        Ok(self.finish(committed))
    }

    /// Edit the metadata of a draft form.
    pub fn update_form(
        &self,
        id: FormId,
        patch: FormPatch,
        caller: &Caller,
    ) -> Result<Form> {
        caller.require(Capability::FormEdit)?;
        if patch.is_empty() {
            return Err(Error::Invalid("nothing to update".into()));
        }

        let slot = self.locks.slot(id);
        let _guard = hold(&slot);
        let current = self.get_form(id)?;
        if current.status != WorkflowStatus::Draft {
            return Err(Error::FormNotEditable {
                form: id,
                status: current.status,
            });
        }

        let mut form = current.clone();
        patch.apply(&mut form)?;
        form.updated_at = now_millis();

        let committed = self.db.commit(Mutation {
            expected_revision: Some(current.revision),
            version: None,
            event: None,
            audit: vec![NewAuditRecord {
                entity_type: EntityType::Form,
                entity_id: id.0.to_string(),
                action: AuditAction::Update,
                actor: caller.id.clone(),
                old_values: Some(current.snapshot()),
                new_values: Some(form.snapshot()),
                description: None,
            }],
            form,
        })?;

        tracing::info!(form = %id, actor = %caller.id, "updated form");
        Ok(self.finish(committed))
    }

    /// Soft-delete a form. Its history stays; it disappears from search
    /// for every role and behaves as not found afterwards.
    pub fn delete_form(&self, id: FormId, caller: &Caller) -> Result<Form> {
        caller.require(Capability::FormDelete)?;

        let slot = self.locks.slot(id);
        let _guard = hold(&slot);
        let current = self.get_form(id)?;

        let now = now_millis();
        let mut form = current.clone();
        form.deleted_at = Some(now);
        form.updated_at = now;

        let committed = self.db.commit(Mutation {
            expected_revision: Some(current.revision),
            version: None,
            event: None,
            audit: vec![NewAuditRecord {
                entity_type: EntityType::Form,
                entity_id: id.0.to_string(),
                action: AuditAction::Delete,
                actor: caller.id.clone(),
                old_values: Some(current.snapshot()),
                new_values: Some(json!({ "deleted_at": now })),
                description: Some("form deleted".into()),
            }],
            form,
        })?;

        tracing::info!(form = %id, actor = %caller.id, "deleted form");
        Ok(self.finish(committed))
    }

    /// A live form. Deleted forms are reported as not found.
    pub fn get_form(&self, id: FormId) -> Result<Form> {
        match self.db.load_form(id)? {
            Some(form) if !form.is_deleted() => Ok(form),
            _ => Err(Error::form_not_found(id)),
        }
    }

    // -- Workflow --

    /// Apply a workflow action. Nothing is written unless every check
    /// passes.
    pub fn transition(
        &self,
        id: FormId,
        action: WorkflowAction,
        caller: &Caller,
        reason: Option<String>,
    ) -> Result<WorkflowEvent> {
        let slot = self.locks.slot(id);
        let _guard = hold(&slot);
        let current = self.get_form(id)?;
        let step = workflow::plan(&current, action, caller)?;

        let mut form = current.clone();
        form.status = step.to;
        form.updated_at = now_millis();

        let committed = self.db.commit(Mutation {
            expected_revision: Some(current.revision),
            version: None,
            event: Some(NewWorkflowEvent {
                action,
                from: Some(step.from),
                to: step.to,
                actor: caller.id.clone(),
                reason: reason.clone(),
            }),
            audit: vec![NewAuditRecord {
                entity_type: EntityType::Form,
                entity_id: id.0.to_string(),
                action: AuditAction::Transition,
                actor: caller.id.clone(),
                old_values: Some(json!({ "status": step.from })),
                new_values: Some(json!({ "status": step.to })),
                description: Some(reason.unwrap_or_else(|| action.to_string())),
            }],
            form,
        })?;

        let event = committed.event.clone().ok_or_else(|| {
            Error::Invalid(format!("transition of form {id} left no event"))
        })?;
        tracing::info!(
            form = %id,
            actor = %caller.id,
            %action,
            from = %step.from,
            to = %step.to,
            "form transitioned"
        );
        self.finish(committed);
        Ok(event)
    }

    // -- Versions --

    /// Record a new file version as `current_version + 1`.
    ///
    /// Retries on `ConcurrentModification` up to `max_write_retries` times,
    /// re-reading the form each time, so a lost race moves on to the next
    /// number instead of reusing one.
    pub fn record_version(
        &self,
        id: FormId,
        file: FileRef,
        caller: &Caller,
    ) -> Result<VersionRecord> {
        caller.require(Capability::FormEdit)?;
        file.validate()?;

        let mut attempt = 0;
        loop {
            match self.try_record_version(id, &file, caller) {
                Err(e) if e.is_retryable()
                    && attempt < self.settings.max_write_retries =>
                {
                    attempt += 1;
                    tracing::debug!(form = %id, attempt, "retrying upload");
                }
                result => return result,
            }
        }
    }

    fn try_record_version(
        &self,
        id: FormId,
        file: &FileRef,
        caller: &Caller,
    ) -> Result<VersionRecord> {
        let slot = self.locks.slot(id);
        let _guard = hold(&slot);
        let current = self.get_form(id)?;

        let accepts = match self.settings.upload_policy {
            UploadPolicy::DraftOnly => current.status == WorkflowStatus::Draft,
            UploadPolicy::DraftOrPublished => matches!(
                current.status,
                WorkflowStatus::Draft | WorkflowStatus::Published
            ),
        };
        if !accepts {
            return Err(Error::FormNotEditable {
                form: id,
                status: current.status,
            });
        }

        let now = now_millis();
        let record = VersionRecord {
            form_id: id,
            version_number: current.current_version + 1,
            file: file.clone(),
            uploaded_by: caller.id.clone(),
            uploaded_at: now,
        };
        let mut form = current.clone();
        form.current_version = record.version_number;
        form.updated_at = now;

        let committed = self.db.commit(Mutation {
            expected_revision: Some(current.revision),
            version: Some(record.clone()),
            event: None,
            audit: vec![NewAuditRecord {
                entity_type: EntityType::FormVersion,
                entity_id: record.entity_id(),
                action: AuditAction::Upload,
                actor: caller.id.clone(),
                old_values: Some(json!({
                    "current_version": current.current_version,
                })),
                new_values: Some(serde_json::to_value(&record)?),
                description: record.file.change_notes.clone(),
            }],
            form,
        })?;

        tracing::info!(
            form = %id,
            actor = %caller.id,
            version = record.version_number,
            "recorded version"
        );
        self.finish(committed);
        Ok(record)
    }

    /// Ordered events and versions of a form, deleted or not.
    pub fn history(&self, id: FormId) -> Result<FormHistory> {
        let form = self
            .db
            .load_form(id)?
            .ok_or_else(|| Error::form_not_found(id))?;
        let (events, versions) = self.db.history(id)?;
        Ok(FormHistory {
            form_id: id,
            status: form.status,
            current_version: form.current_version,
            events,
            versions,
        })
    }

    // -- Downloads --

    /// Hand out the current file of a form the caller can see and count the
    /// download. Forms the caller cannot see are reported as not found.
    pub fn record_download(
        &self,
        id: FormId,
        caller: &Caller,
    ) -> Result<Download> {
        let slot = self.locks.slot(id);
        let _guard = hold(&slot);
        let form = self.get_form(id)?;
        if !visibility::visible(caller.role, form.is_public, form.status, false)
        {
            return Err(Error::form_not_found(id));
        }

        let (_, versions) = self.db.history(id)?;
        let version = versions
            .into_iter()
            .find(|v| v.version_number == form.current_version)
            .ok_or_else(|| Error::NotFound {
                kind: "file version",
                name: format!("{id}/v{}", form.current_version),
            })?;

        let downloads =
            self.db.record_download(&form, &caller.id, now_millis())?;
        tracing::debug!(form = %id, actor = %caller.id, downloads, "download");
        Ok(Download { version, downloads })
    }

    // -- Search --

    pub async fn search(
        &self,
        request: &SearchRequest,
        caller: &Caller,
    ) -> Result<SearchPage> {
        self.query.search(request, caller).await
    }

    /// A handle for running searches without borrowing the catalog.
    pub fn query_engine(&self) -> QueryEngine {
        self.query.clone()
    }

    // -- Index maintenance --

    /// Rebuild projections and the lexical index from the form rows and
    /// queue every live form for embedding. `progress` sees `(done, total)`.
    pub fn rebuild_index(
        &self,
        progress: impl FnMut(usize, usize),
    ) -> Result<RebuildReport> {
        let report = self.indexer.rebuild(&self.db, progress)?;
        tracing::info!(
            forms = report.forms,
            indexed = report.indexed,
            queued = report.queued,
            "rebuilt search index"
        );
        Ok(report)
    }

    /// Queue every live form whose embedding is missing or outdated.
    pub fn refresh_stale_embeddings(&self) -> Result<usize> {
        let mut queued = 0;
        for doc in self.db.list_documents()? {
            let stored = self.embeddings.text_hash(doc.form_id)?;
            if doc.deleted || stored == Some(doc.text_hash) {
                continue;
            }
            if let Some(form) = self.db.load_form(doc.form_id)?
                && self.indexer.schedule_embedding(&form)
            {
                queued += 1;
            }
        }
        tracing::info!(queued, "queued stale embeddings");
        Ok(queued)
    }

    /// Wait until every queued embedding refresh has been handled.
    pub async fn flush_embeddings(&self) -> Result<()> {
        self.indexer.flush().await
    }

    pub fn status(&self) -> Result<CatalogStatus> {
        Ok(CatalogStatus {
            stats: self.db.stats()?,
            indexed_documents: self.index.num_docs(),
            embeddings: self.embeddings.list_ids()?.len(),
            failing_embeddings: self.embeddings.failing()?,
            embedder: self.settings.embedder,
            model: self.provider.model_id().to_string(),
        })
    }

    fn finish(&self, committed: Committed) -> Form {
        tracing::debug!(
            form = %committed.form.id,
            revision = committed.form.revision,
            audit_records = committed.audit.len(),
            text_hash = committed.document.text_hash,
            "committed mutation"
        );
        self.indexer.refresh(&committed.form);
        committed.form
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    use crate::{
        audit::AuditAction,
        embedding::HashingEmbedder,
        versions::max_version,
        workflow::replay,
    };

    struct Fixture {
        _tmp: tempfile::TempDir,
        catalog: Catalog,
    }

    fn open(settings: Settings) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = DataDir::resolve(Some(tmp.path())).unwrap();
        let catalog = Catalog::open_with(
            &data_dir,
            settings,
            Arc::new(HashingEmbedder::default()),
        )
        .unwrap();
        Fixture { _tmp: tmp, catalog }
    }

    fn fixture() -> Fixture {
        open(Settings::default())
    }

    fn author() -> Caller {
        Caller::staff("alice", [Capability::FormCreate, Capability::FormEdit])
    }

    fn complete_draft(catalog: &Catalog, title: &str) -> Form {
        let mut input = NewForm::new(title, "permits");
        input.business_areas = vec!["transport".into()];
        input.is_public = true;
        let form = catalog.create_form(input, &author()).unwrap();
        catalog
            .record_version(form.id, FileRef::new("k1", "a.pdf"), &author())
            .unwrap();
        catalog.get_form(form.id).unwrap()
    }

    fn publish(catalog: &Catalog, id: FormId) {
        let admin = Caller::admin("root");
        catalog
            .transition(id, WorkflowAction::SubmitReview, &author(), None)
            .unwrap();
        catalog
            .transition(id, WorkflowAction::Approve, &admin, None)
            .unwrap();
        catalog
            .transition(id, WorkflowAction::Publish, &admin, None)
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_writes_event_audit_and_projection() {
        let fx = fixture();
        let form = fx
            .catalog
            .create_form(NewForm::new("Permit", "permits"), &author())
            .unwrap();

        let history = fx.catalog.history(form.id).unwrap();
        assert_eq!(history.events.len(), 1);
        assert_eq!(replay(&history.events).unwrap(), WorkflowStatus::Draft);

        let audit = fx
            .catalog
            .audit()
            .find_by_entity(EntityType::Form, &form.id.0.to_string())
            .unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, AuditAction::Create);

        let doc = fx.catalog.db().load_document(form.id).unwrap().unwrap();
        assert_eq!(doc.status, WorkflowStatus::Draft);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_requires_capability() {
        let fx = fixture();
        let err = fx
            .catalog
            .create_form(NewForm::new("Permit", "permits"), &Caller::public())
            .unwrap_err();
        assert_eq!(err.kind(), "permission_denied");
        assert_eq!(fx.catalog.db().stats().unwrap().forms, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn only_drafts_are_editable() {
        let fx = fixture();
        let form = complete_draft(&fx.catalog, "Permit");
        let patch = FormPatch {
            title: Some("Vehicle Permit".into()),
            ..Default::default()
        };
        let updated = fx
            .catalog
            .update_form(form.id, patch.clone(), &author())
            .unwrap();
        assert_eq!(updated.title, "Vehicle Permit");

        fx.catalog
            .transition(form.id, WorkflowAction::SubmitReview, &author(), None)
            .unwrap();
        let err = fx
            .catalog
            .update_form(form.id, patch, &author())
            .unwrap_err();
        assert_eq!(err.kind(), "form_not_editable");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_transition_changes_nothing() {
        let fx = fixture();
        let form = fx
            .catalog
            .create_form(NewForm::new("Permit", "permits"), &author())
            .unwrap();
        let audit_before = fx.catalog.audit().len().unwrap();

        let err = fx
            .catalog
            .transition(form.id, WorkflowAction::SubmitReview, &author(), None)
            .unwrap_err();
        assert_eq!(err.kind(), "incomplete_form");

        let err = fx
            .catalog
            .transition(form.id, WorkflowAction::Publish, &author(), None)
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_transition");

        assert_eq!(fx.catalog.get_form(form.id).unwrap(), form);
        assert_eq!(fx.catalog.history(form.id).unwrap().events.len(), 1);
        assert_eq!(fx.catalog.audit().len().unwrap(), audit_before);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transition_records_reason_and_status() {
        let fx = fixture();
        let form = complete_draft(&fx.catalog, "Permit");
        let reviewer = Caller::staff("rita", [Capability::Review]);
        fx.catalog
            .transition(form.id, WorkflowAction::SubmitReview, &author(), None)
            .unwrap();
        let event = fx
            .catalog
            .transition(
                form.id,
                WorkflowAction::Reject,
                &reviewer,
                Some("missing signature page".into()),
            )
            .unwrap();
        assert_eq!(event.to, WorkflowStatus::Draft);
        assert_eq!(event.reason.as_deref(), Some("missing signature page"));

        let audit = fx.catalog.audit().find_by_actor("rita").unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, AuditAction::Transition);
        assert_eq!(audit[0].new_values, Some(json!({ "status": "draft" })));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn versions_follow_upload_policy() {
        let fx = fixture();
        let form = complete_draft(&fx.catalog, "Permit");
        publish(&fx.catalog, form.id);

        let err = fx
            .catalog
            .record_version(form.id, FileRef::new("k2", "b.pdf"), &author())
            .unwrap_err();
        assert_eq!(err.kind(), "form_not_editable");

        drop(fx);
        let fx = open(Settings {
            upload_policy: UploadPolicy::DraftOrPublished,
            ..Settings::default()
        });
        let form = complete_draft(&fx.catalog, "Permit");
        publish(&fx.catalog, form.id);
        let record = fx
            .catalog
            .record_version(form.id, FileRef::new("k2", "b.pdf"), &author())
            .unwrap();
        assert_eq!(record.version_number, 2);

        let audit = fx
            .catalog
            .audit()
            .find_by_entity(EntityType::FormVersion, &record.entity_id())
            .unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, AuditAction::Upload);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn deleted_forms_vanish_but_keep_history() {
        let fx = fixture();
        let form = complete_draft(&fx.catalog, "Permit");
        publish(&fx.catalog, form.id);

        let admin = Caller::admin("root");
        fx.catalog.delete_form(form.id, &admin).unwrap();

        let err = fx.catalog.get_form(form.id).unwrap_err();
        assert_eq!(err.kind(), "not_found");
        let page = fx
            .catalog
            .search(&SearchRequest::new("permit"), &admin)
            .await
            .unwrap();
        assert_eq!(page.total, 0);

        let history = fx.catalog.history(form.id).unwrap();
        assert_eq!(history.events.len(), 4);
        assert_eq!(history.versions.len(), 1);

        let err = fx
            .catalog
            .transition(form.id, WorkflowAction::Archive, &admin, None)
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn downloads_respect_visibility() {
        let fx = fixture();
        let form = complete_draft(&fx.catalog, "Permit");

        let err = fx
            .catalog
            .record_download(form.id, &Caller::public())
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");

        publish(&fx.catalog, form.id);
        let download = fx
            .catalog
            .record_download(form.id, &Caller::public())
            .unwrap();
        assert_eq!(download.version.version_number, 1);
        assert_eq!(download.downloads, 1);
        assert_eq!(fx.catalog.db().download_count(form.id).unwrap(), 1);
    }

    /// Embeds like `HashingEmbedder` but rejects any text mentioning
    /// `refused`.
    struct Refusing {
        refused: &'static str,
        inner: HashingEmbedder,
    }

    impl EmbeddingProvider for Refusing {
        fn model_id(&self) -> &str {
            "refusing"
        }

        fn embed(&self, text: &str) -> Result<Vec<f32>> {
            if text.contains(self.refused) {
                return Err(Error::EmbeddingUnavailable("refused".into()));
            }
            self.inner.embed(text)
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_refresh_keeps_old_vector_and_flags_stale() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = DataDir::resolve(Some(tmp.path())).unwrap();
        let settings = Settings {
            embed_max_attempts: 2,
            embed_backoff_ms: 1,
            ..Settings::default()
        };
        let provider = Refusing {
            refused: "Angling",
            inner: HashingEmbedder::default(),
        };
        let catalog =
            Catalog::open_with(&data_dir, settings, Arc::new(provider))
                .unwrap();
        let admin = Caller::admin("root");

        let form = catalog
            .create_form(NewForm::new("Fishing License", "licenses"), &author())
            .unwrap();
        catalog.flush_embeddings().await.unwrap();
        let request = SearchRequest::new("license");
        let page = catalog.search(&request, &admin).await.unwrap();
        assert!(!page.items[0].embedding_stale);

        let patch = FormPatch {
            title: Some("Angling License".into()),
            ..FormPatch::default()
        };
        catalog.update_form(form.id, patch, &author()).unwrap();
        catalog.flush_embeddings().await.unwrap();

        let page = catalog.search(&request, &admin).await.unwrap();
        assert_eq!(page.items.len(), 1);
        let hit = &page.items[0];
        assert_eq!(hit.form_id, form.id);
        assert_eq!(hit.title, "Angling License");
        assert!(hit.embedding_stale);
        assert_eq!(hit.lexical_rank, Some(1));
        // Ranked against the vector of the previous title.
        assert_eq!(hit.semantic_rank, Some(1));
        assert!(page.notices.is_empty());
        assert_eq!(catalog.status().unwrap().failing_embeddings, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rebuild_and_refresh_heal_derived_state() {
        let fx = fixture();
        let form = complete_draft(&fx.catalog, "Fishing License");
        fx.catalog.flush_embeddings().await.unwrap();
        assert_eq!(fx.catalog.refresh_stale_embeddings().unwrap(), 0);

        fx.catalog.embeddings.remove(form.id).unwrap();
        assert_eq!(fx.catalog.refresh_stale_embeddings().unwrap(), 1);
        fx.catalog.flush_embeddings().await.unwrap();
        assert!(fx.catalog.embeddings.load(form.id).unwrap().is_some());

        let report = fx.catalog.rebuild_index(|_, _| {}).unwrap();
        assert_eq!(report.indexed, 1);
        let status = fx.catalog.status().unwrap();
        assert_eq!(status.indexed_documents, 1);
        assert_eq!(status.embeddings, 1);
        assert_eq!(status.model, "hashing");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn random_operations_keep_history_consistent(
            ops in proptest::collection::vec(0usize..10, 1..24)
        ) {
            let runtime = tokio::runtime::Runtime::new().unwrap();
            let _enter = runtime.enter();
            let fx = open(Settings {
                upload_policy: UploadPolicy::DraftOrPublished,
                ..Settings::default()
            });
            let admin = Caller::admin("root");
            let mut input = NewForm::new("Permit", "permits");
            input.business_areas = vec!["transport".into()];
            let form = fx.catalog.create_form(input, &author()).unwrap();

            for (i, op) in ops.into_iter().enumerate() {
                // Failures are expected; they must leave no trace.
                let _ = match op {
                    0 | 1 => fx
                        .catalog
                        .record_version(
                            form.id,
                            FileRef::new(format!("k{i}"), "a.pdf"),
                            &author(),
                        )
                        .map(|_| ()),
                    n => {
                        let action = WorkflowAction::ALL[n - 2];
                        let caller = if action == WorkflowAction::SubmitReview {
                            author()
                        } else {
                            admin.clone()
                        };
                        fx.catalog
                            .transition(form.id, action, &caller, None)
                            .map(|_| ())
                    }
                };
            }

            let current = fx.catalog.get_form(form.id).unwrap();
            let history = fx.catalog.history(form.id).unwrap();
            prop_assert_eq!(replay(&history.events).unwrap(), current.status);
            prop_assert_eq!(
                max_version(&history.versions),
                current.current_version
            );
        }
    }
}
