//! formdex - a governed form catalog with hybrid keyword and semantic search.
//!
//! Forms move through a review workflow, carry immutable file versions, and
//! leave an append-only audit trail. Search fuses BM25 over
//! [Tantivy](https://github.com/quickwit-oss/tantivy) with embedding
//! similarity using reciprocal rank fusion, scoped by the caller's role.
//!
//! # Quick start
//!
//! ```no_run
//! use formdex::{Caller, Catalog, DataDir, NewForm, SearchRequest};
//!
//! # async fn run() -> formdex::Result<()> {
//! let data_dir = DataDir::resolve(None)?;
//! let catalog = Catalog::open(&data_dir)?;
//!
//! let admin = Caller::admin("ops");
//! let input = NewForm::new("Oversize Vehicle Permit", "permits");
//! catalog.create_form(input, &admin)?;
//!
//! let page = catalog
//!     .search(&SearchRequest::new("vehicle permit"), &admin)
//!     .await?;
//! for hit in &page.items {
//!     println!("{} {} (score: {:.4})", hit.form_id, hit.title, hit.score);
//! }
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod caller;
pub mod catalog;
pub mod data_dir;
pub mod embedding;
pub mod embedding_db;
pub mod error;
pub mod form;
pub mod fusion;
pub mod indexer;
mod locks;
pub mod mcp;
pub mod model_manager;
pub mod query;
pub mod search_document;
pub mod search_index;
pub mod settings;
pub mod store;
pub mod versions;
pub mod visibility;
pub mod workflow;

pub use audit::{AuditAction, AuditLog, AuditRecord, EntityType};
pub use caller::{Caller, Capability, Role};
pub use catalog::{Catalog, CatalogStatus, Download, FormHistory};
pub use data_dir::DataDir;
pub use embedding::{EmbeddingProvider, HashingEmbedder};
pub use embedding_db::EmbeddingDb;
pub use error::{Error, Result};
pub use form::{Form, FormId, FormPatch, NewForm};
pub use query::{
    QueryEngine,
    SearchFilters,
    SearchHit,
    SearchPage,
    SearchRequest,
    SortDirection,
    SortOrder,
};
pub use search_index::SearchIndex;
pub use settings::Settings;
pub use store::CatalogDb;
pub use versions::{FileRef, VersionRecord};
pub use workflow::{WorkflowAction, WorkflowEvent, WorkflowStatus};
