//! Keeps the derived search artifacts in step with committed forms.
//!
//! The tantivy index is refreshed synchronously by the writer that committed
//! the change. Embeddings are refreshed by a background worker fed through a
//! channel; a job whose text no longer matches the form is dropped, and a
//! job that keeps failing leaves the previous vector in place.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use serde::Serialize;
use tantivy::IndexWriter;
use tokio::{
    runtime::Handle,
    sync::{mpsc, oneshot},
};

use crate::{
    embedding::{EmbeddingProvider, embed_with_timeout},
    embedding_db::EmbeddingDb,
    error::{Error, Result},
    form::{Form, FormId},
    search_index::SearchIndex,
    settings::Settings,
    store::CatalogDb,
};

/// Memory budget of the shared tantivy writer.
const WRITER_MEMORY_BUDGET: usize = 15_000_000;

/// Outcome of a full index rebuild.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    pub forms: usize,
    pub indexed: usize,
    pub queued: usize,
}

#[derive(Debug)]
struct EmbedJob {
    form_id: FormId,
    text: String,
    text_hash: u64,
}

#[derive(Debug)]
enum Job {
    Refresh(EmbedJob),
    /// Answered once every job queued before it has been handled.
    Flush(oneshot::Sender<()>),
}

pub struct SearchIndexer {
    index: Arc<SearchIndex>,
    writer: Mutex<IndexWriter>,
    jobs: mpsc::UnboundedSender<Job>,
}

impl SearchIndexer {
    /// Create the indexer and spawn its embedding worker on `runtime`.
    pub fn start(
        index: Arc<SearchIndex>,
        db: Arc<CatalogDb>,
        embeddings: Arc<EmbeddingDb>,
        provider: Arc<dyn EmbeddingProvider>,
        settings: &Settings,
        runtime: &Handle,
    ) -> Result<Self> {
        let writer = index.writer(WRITER_MEMORY_BUDGET)?;
        let (jobs, rx) = mpsc::unbounded_channel();

        let worker = EmbeddingWorker {
            db,
            embeddings,
            provider,
            timeout: settings.embed_timeout(),
            max_attempts: settings.embed_max_attempts.max(1),
            backoff: Duration::from_millis(settings.embed_backoff_ms),
        };
        runtime.spawn(worker.run(rx));

        Ok(Self {
            index,
            writer: Mutex::new(writer),
            jobs,
        })
    }

    /// Bring the lexical index in line with `form` and queue an embedding
    /// refresh. Index failures are logged, never returned: the mutation that
    /// triggered the refresh has already committed.
    pub fn refresh(&self, form: &Form) {
        if let Err(e) = self.refresh_lexical(form) {
            tracing::warn!(
                form = %form.id,
                error = %e,
                "lexical index refresh failed, run `formdex rebuild`"
            );
        }
        if !form.is_deleted() {
            self.schedule_embedding(form);
        }
    }

    fn refresh_lexical(&self, form: &Form) -> Result<()> {
        let mut writer = self.lock_writer();
        if form.is_deleted() {
            self.index.delete(&writer, form.id);
        } else {
            self.index.upsert(&writer, form)?;
        }
        writer.commit()?;
        self.index.reload()
    }

    /// Queue an embedding refresh for the current text of `form`.
    pub fn schedule_embedding(&self, form: &Form) -> bool {
        let job = EmbedJob {
            form_id: form.id,
            text: form.semantic_text(),
            text_hash: form.semantic_hash(),
        };
        let queued = self.jobs.send(Job::Refresh(job)).is_ok();
        if !queued {
            tracing::warn!(form = %form.id, "embedding worker is gone");
        }
        queued
    }

    /// Wait until every embedding job queued so far has been handled.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let stopped =
            || Error::EmbeddingUnavailable("embedding worker stopped".into());
        self.jobs.send(Job::Flush(tx)).map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }

    /// Rebuild projections and the whole lexical index from the form rows,
    /// then queue an embedding refresh for every live form.
    ///
    /// Holds the index writer throughout, so a concurrent mutation either
    /// lands in the rows read here or refreshes the index afterwards.
    pub fn rebuild(
        &self,
        db: &CatalogDb,
        mut progress: impl FnMut(usize, usize),
    ) -> Result<RebuildReport> {
        let mut writer = self.lock_writer();
        let forms = db.rebuild_documents()?;

        writer.delete_all_documents()?;
        let live: Vec<&Form> =
            forms.iter().filter(|f| !f.is_deleted()).collect();
        for (i, form) in live.iter().enumerate() {
            self.index.upsert(&writer, form)?;
            progress(i + 1, live.len());
        }
        writer.commit()?;
        self.index.reload()?;
        drop(writer);

        let queued = live
            .iter()
            .filter(|form| self.schedule_embedding(form))
            .count();

        Ok(RebuildReport {
            forms: forms.len(),
            indexed: live.len(),
            queued,
        })
    }

    fn lock_writer(&self) -> MutexGuard<'_, IndexWriter> {
        self.writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for SearchIndexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchIndexer").finish_non_exhaustive()
    }
}

/// Delay before retry `attempt` (1-based): `base * 2^(attempt - 1)`.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
}

struct EmbeddingWorker {
    db: Arc<CatalogDb>,
    embeddings: Arc<EmbeddingDb>,
    provider: Arc<dyn EmbeddingProvider>,
    timeout: Duration,
    max_attempts: u32,
    backoff: Duration,
}

impl EmbeddingWorker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Job>) {
        while let Some(job) = rx.recv().await {
            match job {
                Job::Refresh(job) => self.refresh(job).await,
                Job::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        tracing::debug!("embedding worker stopped");
    }

    async fn refresh(&self, job: EmbedJob) {
        match self.is_outdated(&job) {
            Ok(false) => {}
            Ok(true) => {
                tracing::debug!(form = %job.form_id, "skipping outdated job");
                return;
            }
            Err(e) => {
                tracing::warn!(
                    form = %job.form_id,
                    error = %e,
                    "cannot check embedding state"
                );
                return;
            }
        }

        for attempt in 1..=self.max_attempts {
            let result = embed_with_timeout(
                Arc::clone(&self.provider),
                job.text.clone(),
                self.timeout,
            )
            .await;

            match result {
                Ok(vector) => {
                    match self.embeddings.store(
                        job.form_id,
                        job.text_hash,
                        &vector,
                    ) {
                        Ok(()) => tracing::debug!(
                            form = %job.form_id,
                            dimension = vector.len(),
                            "stored embedding"
                        ),
                        Err(e) => tracing::warn!(
                            form = %job.form_id,
                            error = %e,
                            "failed to store embedding"
                        ),
                    }
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        form = %job.form_id,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "embedding attempt failed"
                    );
                    if attempt < self.max_attempts {
                        let delay = backoff_delay(self.backoff, attempt);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        match self.embeddings.record_failure(job.form_id) {
            Ok(failures) => tracing::warn!(
                form = %job.form_id,
                failures,
                "embedding refresh abandoned, previous vector kept"
            ),
            Err(e) => tracing::warn!(
                form = %job.form_id,
                error = %e,
                "failed to record embedding failure"
            ),
        }
    }

    /// A job is outdated when the form moved on to other text, was deleted,
    /// or already has an embedding for exactly this text.
    fn is_outdated(&self, job: &EmbedJob) -> Result<bool> {
        let current = match self.db.load_document(job.form_id)? {
            Some(doc) if !doc.deleted => doc.text_hash,
            _ => return Ok(true),
        };
        if current != job.text_hash {
            return Ok(true);
        }
        Ok(self.embeddings.text_hash(job.form_id)? == Some(job.text_hash))
    }
}
