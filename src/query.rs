//! Hybrid search: lexical and semantic candidates, fused with RRF, then
//! scoped to what the caller may see.

use std::{
    cmp::Ordering,
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::Arc,
    time::Instant,
};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    caller::Caller,
    embedding::{EmbeddingProvider, cosine_similarity, embed_with_timeout},
    embedding_db::EmbeddingDb,
    error::{Error, Result},
    form::FormId,
    fusion::{Fused, rrf_fuse},
    search_document::SearchDocument,
    search_index::SearchIndex,
    settings::Settings,
    store::CatalogDb,
    visibility,
    workflow::WorkflowStatus,
};

/// Narrowing applied to both candidate lists before fusion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchFilters {
    pub category: Option<String>,
    pub business_area: Option<String>,
    /// Inclusive lower bound on `updated_at`.
    pub updated_from: Option<u64>,
    /// Inclusive upper bound on `updated_at`.
    pub updated_to: Option<u64>,
    pub status: Option<WorkflowStatus>,
    pub is_public: Option<bool>,
}

impl SearchFilters {
    /// Deleted documents never match. Category and business area compare
    /// ASCII case-insensitively.
    pub fn matches(&self, doc: &SearchDocument) -> bool {
        if doc.deleted {
            return false;
        }
        if let Some(category) = &self.category
            && !doc.category.eq_ignore_ascii_case(category)
        {
            return false;
        }
        if let Some(area) = &self.business_area
            && !doc.business_areas.iter().any(|a| a.eq_ignore_ascii_case(area))
        {
            return false;
        }
        if self.updated_from.is_some_and(|from| doc.updated_at < from) {
            return false;
        }
        if self.updated_to.is_some_and(|to| doc.updated_at > to) {
            return false;
        }
        if self.status.is_some_and(|status| doc.status != status) {
            return false;
        }
        if self.is_public.is_some_and(|public| doc.is_public != public) {
            return false;
        }
        true
    }

    /// Whether any filter is set. Without one, every live form matches.
    pub fn is_set(&self) -> bool {
        *self != Self::default()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Fused RRF score. Browsing without text falls back to `Date`.
    #[default]
    Relevance,
    /// By `updated_at`, newest first.
    Date,
    /// By `created_at`, newest first.
    Created,
    /// Case-insensitive title, A to Z.
    Title,
    /// Most downloaded first.
    Downloads,
}

impl SortOrder {
    pub const ALL: [SortOrder; 5] = [
        SortOrder::Relevance,
        SortOrder::Date,
        SortOrder::Created,
        SortOrder::Title,
        SortOrder::Downloads,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SortOrder::Relevance => "relevance",
            SortOrder::Date => "date",
            SortOrder::Created => "created",
            SortOrder::Title => "title",
            SortOrder::Downloads => "downloads",
        }
    }

    /// Direction used when the request names none.
    pub fn default_direction(self) -> SortDirection {
        match self {
            SortOrder::Title => SortDirection::Asc,
            _ => SortDirection::Desc,
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortOrder {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        SortOrder::ALL
            .into_iter()
            .find(|o| o.as_str() == s)
            .ok_or_else(|| Error::Invalid(format!("unknown sort order '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortDirection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "asc" => Ok(SortDirection::Asc),
            "desc" => Ok(SortDirection::Desc),
            _ => Err(Error::Invalid(format!("unknown sort direction '{s}'"))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchRequest {
    /// Free text. Blank text browses every form that passes the filters.
    pub text: String,
    pub filters: SearchFilters,
    pub sort: SortOrder,
    /// Overrides the natural direction of an explicit sort. Relevance
    /// ordering ignores it.
    pub direction: Option<SortDirection>,
    pub offset: usize,
    /// Requested page size; 0 selects the default, oversized values are
    /// clamped.
    pub limit: usize,
    /// Restrict admin callers to published forms.
    pub published_only: bool,
}

impl SearchRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub form_id: FormId,
    pub title: String,
    pub category: String,
    pub status: WorkflowStatus,
    pub is_public: bool,
    pub updated_at: u64,
    pub downloads: u64,
    /// Fused RRF score; 0 when browsing.
    pub score: f64,
    pub lexical_rank: Option<usize>,
    pub semantic_rank: Option<usize>,
    /// The stored embedding is missing or was computed from older text.
    pub embedding_stale: bool,
}

/// A non-fatal condition that degraded a search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub kind: &'static str,
    pub message: String,
}

impl From<&Error> for Notice {
    fn from(e: &Error) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchPage {
    pub items: Vec<SearchHit>,
    /// Visible matches across all pages.
    pub total: usize,
    pub offset: usize,
    /// Page size actually applied.
    pub limit: usize,
    /// A branch ran out of time; results may be incomplete.
    pub partial: bool,
    pub notices: Vec<Notice>,
}

/// Read-only search over the catalog. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct QueryEngine {
    db: Arc<CatalogDb>,
    index: Arc<SearchIndex>,
    embeddings: Arc<EmbeddingDb>,
    provider: Arc<dyn EmbeddingProvider>,
    settings: Arc<Settings>,
}

impl QueryEngine {
    pub fn new(
        db: Arc<CatalogDb>,
        index: Arc<SearchIndex>,
        embeddings: Arc<EmbeddingDb>,
        provider: Arc<dyn EmbeddingProvider>,
        settings: Settings,
    ) -> Self {
        Self {
            db,
            index,
            embeddings,
            provider,
            settings: Arc::new(settings),
        }
    }

    pub async fn search(
        &self,
        request: &SearchRequest,
        caller: &Caller,
    ) -> Result<SearchPage> {
        let started = Instant::now();
        let limit = self.settings.clamp_page_size(request.limit);
        let offset = request.offset;

        let db = Arc::clone(&self.db);
        let filters = request.filters.clone();
        let universe =
            tokio::task::spawn_blocking(move || load_universe(&db, &filters))
                .await??;

        let text = request.text.trim();
        let mut notices = Vec::new();
        let mut partial = false;

        let (mut ranked, sort) = if text.is_empty() {
            let browse: Vec<Fused> = universe
                .values()
                .map(|doc| Fused {
                    form_id: doc.form_id,
                    score: 0.0,
                    lexical_rank: None,
                    semantic_rank: None,
                    updated_at: doc.updated_at,
                })
                .collect();
            let sort = match request.sort {
                SortOrder::Relevance => SortOrder::Date,
                other => other,
            };
            (browse, sort)
        } else {
            let candidates = self
                .settings
                .candidate_limit(offset.saturating_add(limit));
            let deadline =
                tokio::time::Instant::now() + self.settings.query_timeout();
            let ids: Vec<FormId> = universe.keys().copied().collect();
            let scope = request.filters.is_set().then(|| ids.clone());

            let (lexical, semantic) = tokio::join!(
                self.lexical(text, scope, candidates, deadline),
                self.semantic(text, ids, candidates, deadline),
            );
            let mut lexical = settle(lexical, &mut notices, &mut partial)?;
            let mut semantic = settle(semantic, &mut notices, &mut partial)?;
            lexical.retain(|id| universe.contains_key(id));
            semantic.retain(|id| universe.contains_key(id));

            tracing::debug!(
                lexical = lexical.len(),
                semantic = semantic.len(),
                "candidates generated"
            );

            let fused =
                rrf_fuse(&lexical, &semantic, self.settings.rrf_k, |id| {
                    universe.get(&id).map_or(0, |doc| doc.updated_at)
                });
            (fused, request.sort)
        };

        if sort != SortOrder::Relevance {
            let direction =
                request.direction.unwrap_or(sort.default_direction());
            ranked
                .sort_by(|a, b| compare_by(sort, direction, a, b, &universe));
        }

        let visible: Vec<Fused> = ranked
            .into_iter()
            .filter(|c| {
                universe.get(&c.form_id).is_some_and(|doc| {
                    visibility::visible(
                        caller.role,
                        doc.is_public,
                        doc.status,
                        request.published_only,
                    )
                })
            })
            .collect();
        let total = visible.len();
        let page: Vec<Fused> =
            visible.into_iter().skip(offset).take(limit).collect();
        let items = self.hits(&page, &universe)?;

        tracing::debug!(
            role = %caller.role,
            total,
            returned = items.len(),
            partial,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "search complete"
        );

        Ok(SearchPage {
            items,
            total,
            offset,
            limit,
            partial,
            notices,
        })
    }

    /// Tantivy candidates. A `scope` keeps forms outside the filters from
    /// using up the candidate limit.
    async fn lexical(
        &self,
        text: &str,
        scope: Option<Vec<FormId>>,
        limit: usize,
        deadline: tokio::time::Instant,
    ) -> Result<Vec<FormId>> {
        let index = Arc::clone(&self.index);
        let text = text.to_string();
        let task = tokio::task::spawn_blocking(move || {
            index.search(&text, scope.as_deref(), limit)
        });
        let hits = tokio::time::timeout_at(deadline, task)
            .await
            .map_err(|_| self.timeout_error())???;
        Ok(hits.into_iter().map(|hit| hit.form_id).collect())
    }

    async fn semantic(
        &self,
        text: &str,
        ids: Vec<FormId>,
        limit: usize,
        deadline: tokio::time::Instant,
    ) -> Result<Vec<FormId>> {
        let embed = embed_with_timeout(
            Arc::clone(&self.provider),
            text.to_string(),
            self.settings.embed_timeout(),
        );
        let query = tokio::time::timeout_at(deadline, embed)
            .await
            .map_err(|_| self.timeout_error())??;

        let embeddings = Arc::clone(&self.embeddings);
        let min_similarity = self.settings.semantic_min_similarity;
        let task = tokio::task::spawn_blocking(move || {
            rank_by_similarity(&embeddings, &ids, &query, min_similarity, limit)
        });
        tokio::time::timeout_at(deadline, task)
            .await
            .map_err(|_| self.timeout_error())??
    }

    fn hits(
        &self,
        page: &[Fused],
        universe: &HashMap<FormId, SearchDocument>,
    ) -> Result<Vec<SearchHit>> {
        let ids: Vec<FormId> = page.iter().map(|c| c.form_id).collect();
        let stored = self.embeddings.batch_load(&ids)?;

        let mut items = Vec::with_capacity(page.len());
        for (candidate, (_, embedding)) in page.iter().zip(stored) {
            let Some(doc) = universe.get(&candidate.form_id) else {
                continue;
            };
            let embedding_stale = embedding
                .as_ref()
                .is_none_or(|e| e.text_hash != doc.text_hash);
            items.push(SearchHit {
                form_id: doc.form_id,
                title: doc.title.clone(),
                category: doc.category.clone(),
                status: doc.status,
                is_public: doc.is_public,
                updated_at: doc.updated_at,
                downloads: doc.downloads,
                score: candidate.score,
                lexical_rank: candidate.lexical_rank,
                semantic_rank: candidate.semantic_rank,
                embedding_stale,
            });
        }
        Ok(items)
    }

    fn timeout_error(&self) -> Error {
        Error::QueryTimeout(self.settings.query_timeout())
    }
}

impl std::fmt::Debug for QueryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEngine")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Live documents passing `filters`, keyed by form id.
fn load_universe(
    db: &CatalogDb,
    filters: &SearchFilters,
) -> Result<HashMap<FormId, SearchDocument>> {
    Ok(db
        .list_documents()?
        .into_iter()
        .filter(|doc| filters.matches(doc))
        .map(|doc| (doc.form_id, doc))
        .collect())
}

/// Turn a degraded branch into a notice and an empty candidate list.
/// Storage and index errors still fail the search.
fn settle(
    result: Result<Vec<FormId>>,
    notices: &mut Vec<Notice>,
    partial: &mut bool,
) -> Result<Vec<FormId>> {
    match result {
        Ok(ids) => Ok(ids),
        Err(e @ (Error::QueryTimeout(_) | Error::EmbeddingUnavailable(_))) => {
            if matches!(e, Error::QueryTimeout(_)) {
                *partial = true;
            }
            tracing::warn!(error = %e, "search branch degraded");
            if !notices.iter().any(|n| n.kind == e.kind()) {
                notices.push(Notice::from(&e));
            }
            Ok(Vec::new())
        }
        Err(e) => Err(e),
    }
}

/// Forms with a stored embedding scoring above `min_similarity`, best
/// first, at most `limit`.
fn rank_by_similarity(
    embeddings: &EmbeddingDb,
    ids: &[FormId],
    query: &[f32],
    min_similarity: f32,
    limit: usize,
) -> Result<Vec<FormId>> {
    let stored = embeddings.batch_load(ids)?;
    let mut scored: Vec<(FormId, f32)> = stored
        .par_iter()
        .filter_map(|(id, embedding)| {
            let score = cosine_similarity(query, &embedding.as_ref()?.vector);
            (score > min_similarity).then_some((*id, score))
        })
        .collect();

    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    scored.truncate(limit);
    Ok(scored.into_iter().map(|(id, _)| id).collect())
}

/// Order for explicit sorts. Ties fall back to most recent, then lowest id,
/// whatever the direction.
fn compare_by(
    sort: SortOrder,
    direction: SortDirection,
    a: &Fused,
    b: &Fused,
    universe: &HashMap<FormId, SearchDocument>,
) -> Ordering {
    let tie = || {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| a.form_id.cmp(&b.form_id))
    };
    let (Some(da), Some(db)) =
        (universe.get(&a.form_id), universe.get(&b.form_id))
    else {
        return tie();
    };
    let ascending = match sort {
        SortOrder::Relevance | SortOrder::Date => {
            da.updated_at.cmp(&db.updated_at)
        }
        SortOrder::Created => da.created_at.cmp(&db.created_at),
        SortOrder::Title => {
            da.title.to_lowercase().cmp(&db.title.to_lowercase())
        }
        SortOrder::Downloads => da.downloads.cmp(&db.downloads),
    };
    match direction {
        SortDirection::Asc => ascending,
        SortDirection::Desc => ascending.reverse(),
    }
    .then_with(tie)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        embedding::HashingEmbedder,
        form::{Form, NewForm},
        store::Mutation,
    };

    fn candidate(id: u64, updated_at: u64) -> Fused {
        Fused {
            form_id: FormId(id),
            score: 0.0,
            lexical_rank: None,
            semantic_rank: None,
            updated_at,
        }
    }

    fn document(id: u64, title: &str, updated_at: u64) -> SearchDocument {
        let mut input = NewForm::new(title, "permits");
        input.business_areas = vec!["Transport".into()];
        let form = input.into_form(FormId(id), "alice", updated_at).unwrap();
        SearchDocument::from_form(&form, 0)
    }

    #[test]
    fn filters_are_conjunctive() {
        let d = document(1, "Permit", 500);
        assert!(SearchFilters::default().matches(&d));

        let by_category = SearchFilters {
            category: Some("PERMITS".into()),
            ..Default::default()
        };
        assert!(by_category.matches(&d));

        let by_area = SearchFilters {
            business_area: Some("transport".into()),
            updated_from: Some(500),
            updated_to: Some(500),
            ..Default::default()
        };
        assert!(by_area.matches(&d));

        let too_new = SearchFilters {
            updated_to: Some(499),
            ..Default::default()
        };
        assert!(!too_new.matches(&d));

        let drafts = SearchFilters {
            status: Some(WorkflowStatus::Draft),
            is_public: Some(false),
            ..Default::default()
        };
        assert!(drafts.is_set());
        assert!(drafts.matches(&d));
        let published = SearchFilters {
            status: Some(WorkflowStatus::Published),
            ..Default::default()
        };
        assert!(!published.matches(&d));
        let public = SearchFilters {
            is_public: Some(true),
            ..Default::default()
        };
        assert!(!public.matches(&d));

        let mut deleted = d.clone();
        deleted.deleted = true;
        assert!(!SearchFilters::default().matches(&deleted));
        assert!(!SearchFilters::default().is_set());
    }

    #[test]
    fn explicit_sorts() {
        let mut universe = HashMap::new();
        for (id, title, at, created, downloads) in [
            (1, "beta", 10, 300, 5),
            (2, "Alpha", 30, 100, 1),
            (3, "gamma", 20, 200, 5),
        ] {
            let mut d = document(id, title, at);
            d.created_at = created;
            d.downloads = downloads;
            universe.insert(FormId(id), d);
        }
        let mut items: Vec<Fused> = universe
            .values()
            .map(|d| candidate(d.form_id.0, d.updated_at))
            .collect();
        let mut sorted = |sort: SortOrder, direction: Option<SortDirection>| {
            let direction = direction.unwrap_or(sort.default_direction());
            items.sort_by(|a, b| compare_by(sort, direction, a, b, &universe));
            items.iter().map(|c| c.form_id.0).collect::<Vec<u64>>()
        };
        use SortDirection::{Asc, Desc};

        assert_eq!(sorted(SortOrder::Date, None), vec![2, 3, 1]);
        assert_eq!(sorted(SortOrder::Date, Some(Asc)), vec![1, 3, 2]);
        assert_eq!(sorted(SortOrder::Created, None), vec![1, 3, 2]);
        assert_eq!(sorted(SortOrder::Created, Some(Asc)), vec![2, 3, 1]);
        assert_eq!(sorted(SortOrder::Title, None), vec![2, 1, 3]);
        assert_eq!(sorted(SortOrder::Title, Some(Desc)), vec![3, 1, 2]);
        assert_eq!(sorted(SortOrder::Downloads, None), vec![3, 1, 2]);
        // Equal download counts keep the newest-first tie break.
        assert_eq!(sorted(SortOrder::Downloads, Some(Asc)), vec![2, 3, 1]);
    }

    #[test]
    fn sort_order_parses() {
        for sort in SortOrder::ALL {
            assert_eq!(sort.as_str().parse::<SortOrder>().unwrap(), sort);
        }
        assert!("popularity".parse::<SortOrder>().is_err());
        let asc: SortDirection = "asc".parse().unwrap();
        assert_eq!(asc, SortDirection::Asc);
        assert!("up".parse::<SortDirection>().is_err());
    }

    #[test]
    fn similarity_ranking_respects_threshold_and_limit() {
        let tmp = tempfile::tempdir().unwrap();
        let db = EmbeddingDb::open(&tmp.path().join("e.redb")).unwrap();
        db.store(FormId(1), 0, &[1.0, 0.0]).unwrap();
        db.store(FormId(2), 0, &[0.6, 0.8]).unwrap();
        db.store(FormId(3), 0, &[-1.0, 0.0]).unwrap();

        let ids = [FormId(1), FormId(2), FormId(3), FormId(4)];
        let ranked =
            rank_by_similarity(&db, &ids, &[1.0, 0.0], 0.0, 10).unwrap();
        assert_eq!(ranked, vec![FormId(1), FormId(2)]);

        let top =
            rank_by_similarity(&db, &ids, &[1.0, 0.0], 0.0, 1).unwrap();
        assert_eq!(top, vec![FormId(1)]);
    }

    struct Stalled;

    impl EmbeddingProvider for Stalled {
        fn model_id(&self) -> &str {
            "stalled"
        }

        fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            std::thread::sleep(Duration::from_millis(500));
            Ok(vec![1.0])
        }
    }

    struct Offline;

    impl EmbeddingProvider for Offline {
        fn model_id(&self) -> &str {
            "offline"
        }

        fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Err(Error::EmbeddingUnavailable("offline".into()))
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        db: Arc<CatalogDb>,
        index: Arc<SearchIndex>,
        embeddings: Arc<EmbeddingDb>,
    }

    impl Fixture {
        /// Forms are indexed and embedded with the hashing embedder.
        fn new(forms: &[(&str, &str, bool, WorkflowStatus)]) -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let db =
                CatalogDb::open(&tmp.path().join("catalog.redb")).unwrap();
            let embeddings =
                EmbeddingDb::open(&tmp.path().join("embeddings.redb"))
                    .unwrap();
            let index = SearchIndex::open_in_ram().unwrap();
            let mut writer = index.writer(15_000_000).unwrap();
            let embedder = HashingEmbedder::default();

            for (i, (title, category, is_public, status)) in
                forms.iter().enumerate()
            {
                let id = db.allocate_form_id().unwrap();
                let mut form: Form = NewForm::new(*title, *category)
                    .into_form(id, "alice", 100 + i as u64)
                    .unwrap();
                form.is_public = *is_public;
                form.status = *status;
                let form = db
                    .commit(Mutation {
                        form,
                        expected_revision: None,
                        version: None,
                        event: None,
                        audit: vec![],
                    })
                    .unwrap()
                    .form;
                index.upsert(&writer, &form).unwrap();
                let vector = embedder.embed(&form.semantic_text()).unwrap();
                embeddings
                    .store(form.id, form.semantic_hash(), &vector)
                    .unwrap();
            }
            writer.commit().unwrap();
            index.reload().unwrap();

            Self {
                _tmp: tmp,
                db: Arc::new(db),
                index: Arc::new(index),
                embeddings: Arc::new(embeddings),
            }
        }

        fn engine(
            &self,
            provider: Arc<dyn EmbeddingProvider>,
            settings: Settings,
        ) -> QueryEngine {
            QueryEngine::new(
                Arc::clone(&self.db),
                Arc::clone(&self.index),
                Arc::clone(&self.embeddings),
                provider,
                settings,
            )
        }
    }

    fn sample() -> Fixture {
        use WorkflowStatus::*;
        Fixture::new(&[
            ("Oversize Vehicle Permit", "permits", true, Published),
            ("Internal Vehicle Inspection", "permits", false, Published),
            ("Vehicle Registration Draft", "permits", true, Draft),
            ("Fishing License", "permits", true, Published),
        ])
    }

    fn ids(page: &SearchPage) -> Vec<u64> {
        page.items.iter().map(|h| h.form_id.0).collect()
    }

    fn engine(fx: &Fixture) -> QueryEngine {
        fx.engine(Arc::new(HashingEmbedder::default()), Settings::default())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn results_are_scoped_by_role() {
        let fx = sample();
        let engine = engine(&fx);
        let request = SearchRequest::new("vehicle");

        let public = engine.search(&request, &Caller::public()).await;
        let public = ids(&public.unwrap());
        assert!(public.contains(&1));
        assert!(!public.contains(&2));
        assert!(!public.contains(&3));

        let staff = Caller::staff("sam", []);
        let staff = ids(&engine.search(&request, &staff).await.unwrap());
        assert!(staff.contains(&1) && staff.contains(&2));
        assert!(!staff.contains(&3));

        let admin = Caller::admin("root");
        let all = engine.search(&request, &admin).await.unwrap();
        assert!([1, 2, 3].iter().all(|id| ids(&all).contains(id)));
        assert!(!all.partial);
        assert!(all.items.iter().all(|h| !h.embedding_stale));

        let narrowed = SearchRequest {
            published_only: true,
            ..request.clone()
        };
        let narrowed = ids(&engine.search(&narrowed, &admin).await.unwrap());
        assert!(narrowed.contains(&1) && narrowed.contains(&2));
        assert!(!narrowed.contains(&3));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn blank_text_browses_by_date() {
        let fx = sample();
        let engine = engine(&fx);
        let page = engine
            .search(&SearchRequest::new("  "), &Caller::admin("root"))
            .await
            .unwrap();
        assert_eq!(ids(&page), vec![4, 3, 2, 1]);
        assert!(page.items.iter().all(|h| h.score == 0.0));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn oversized_pages_are_clamped() {
        let fx = sample();
        let settings = Settings {
            max_page_size: 2,
            ..Settings::default()
        };
        let engine = fx.engine(Arc::new(HashingEmbedder::default()), settings);
        let request = SearchRequest {
            limit: 500,
            offset: 1,
            ..SearchRequest::new("")
        };
        let admin = Caller::admin("root");
        let page = engine.search(&request, &admin).await.unwrap();
        assert_eq!(page.limit, 2);
        assert_eq!(page.total, 4);
        assert_eq!(ids(&page), vec![3, 2]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn slow_embedding_yields_partial_lexical_results() {
        let fx = sample();
        let settings = Settings {
            query_timeout_ms: 100,
            ..Settings::default()
        };
        let engine = fx.engine(Arc::new(Stalled), settings);
        let page = engine
            .search(&SearchRequest::new("fishing"), &Caller::public())
            .await
            .unwrap();
        assert!(page.partial);
        assert_eq!(page.notices[0].kind, "query_timeout");
        assert_eq!(ids(&page), vec![4]);
        assert_eq!(page.items[0].semantic_rank, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unavailable_embedding_degrades_to_lexical() {
        let fx = sample();
        let engine = fx.engine(Arc::new(Offline), Settings::default());
        let page = engine
            .search(&SearchRequest::new("fishing"), &Caller::public())
            .await
            .unwrap();
        assert!(!page.partial);
        assert_eq!(page.notices[0].kind, "embedding_unavailable");
        assert_eq!(ids(&page), vec![4]);
        assert_eq!(page.items[0].lexical_rank, Some(1));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn filters_apply_before_fusion() {
        let fx = sample();
        let engine = engine(&fx);
        let request = SearchRequest {
            filters: SearchFilters {
                category: Some("taxes".into()),
                ..Default::default()
            },
            ..SearchRequest::new("vehicle")
        };
        let admin = Caller::admin("root");
        let page = engine.search(&request, &admin).await.unwrap();
        assert_eq!(page.total, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn filtered_match_survives_crowded_index() {
        use WorkflowStatus::Published;
        let mut forms = vec![("Permit", "parking", true, Published); 80];
        forms.push((
            "Annual Roadside Vendor Stall Operating Permit",
            "vendors",
            true,
            Published,
        ));
        let fx = Fixture::new(&forms);
        let engine = fx.engine(Arc::new(Offline), Settings::default());

        let request = SearchRequest {
            filters: SearchFilters {
                category: Some("vendors".into()),
                ..Default::default()
            },
            ..SearchRequest::new("permit")
        };
        let page = engine.search(&request, &Caller::public()).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(ids(&page), vec![81]);
        assert_eq!(page.items[0].lexical_rank, Some(1));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn status_filter_lists_review_queue() {
        let fx = sample();
        let engine = engine(&fx);
        let request = SearchRequest {
            filters: SearchFilters {
                status: Some(WorkflowStatus::Draft),
                ..Default::default()
            },
            ..SearchRequest::new("")
        };
        let admin = Caller::admin("root");
        let page = engine.search(&request, &admin).await.unwrap();
        assert_eq!(ids(&page), vec![3]);

        let oldest_first = SearchRequest {
            sort: SortOrder::Created,
            direction: Some(SortDirection::Asc),
            ..SearchRequest::new("")
        };
        let page = engine.search(&oldest_first, &admin).await.unwrap();
        assert_eq!(ids(&page), vec![1, 2, 3, 4]);
    }
}
