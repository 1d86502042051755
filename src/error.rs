use std::{path::PathBuf, time::Duration};

use crate::{
    caller::Capability,
    form::FormId,
    workflow::{WorkflowAction, WorkflowStatus},
};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("search index error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),

    #[error("cannot {action} a form that is {from}")]
    InvalidTransition {
        action: WorkflowAction,
        from: WorkflowStatus,
    },

    #[error("{actor} lacks the {capability} capability")]
    PermissionDenied {
        actor: String,
        capability: Capability,
    },

    #[error("{actor} created form {form} and cannot approve it")]
    SeparationOfDutyViolation { actor: String, form: FormId },

    #[error("form {form} is incomplete, missing: {}", .missing.join(", "))]
    IncompleteForm {
        form: FormId,
        missing: Vec<&'static str>,
    },

    #[error("form {form} is {status} and does not accept changes")]
    FormNotEditable { form: FormId, status: WorkflowStatus },

    #[error("form {form} changed since it was loaded, retry the operation")]
    ConcurrentModification { form: FormId },

    #[error("embedding provider unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("query exceeded its {0:?} time budget")]
    QueryTimeout(Duration),
}

impl Error {
    /// Stable, machine-readable kind for surfacing to callers.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Redb(_)
            | Error::RedbStorage(_)
            | Error::RedbTransaction(_)
            | Error::RedbTable(_)
            | Error::RedbCommit(_) => "storage",
            Error::Tantivy(_) => "search_index",
            Error::Json(_) => "serialization",
            Error::Task(_) => "task",
            Error::Config(_) => "config",
            Error::Invalid(_) => "invalid_input",
            Error::NotFound { .. } => "not_found",
            Error::DataDir(_) => "data_dir",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::PermissionDenied { .. } => "permission_denied",
            Error::SeparationOfDutyViolation { .. } => {
                "separation_of_duty_violation"
            }
            Error::IncompleteForm { .. } => "incomplete_form",
            Error::FormNotEditable { .. } => "form_not_editable",
            Error::ConcurrentModification { .. } => "concurrent_modification",
            Error::EmbeddingUnavailable(_) => "embedding_unavailable",
            Error::QueryTimeout(_) => "query_timeout",
        }
    }

    /// Whether the caller may simply repeat the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ConcurrentModification { .. })
    }

    pub(crate) fn form_not_found(id: FormId) -> Self {
        Error::NotFound {
            kind: "form",
            name: id.to_string(),
        }
    }
}
