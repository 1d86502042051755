use redb::TableDefinition;
use serde::{Deserialize, Serialize};

use crate::{
    form::{Form, FormId},
    workflow::WorkflowStatus,
};

/// `form_id -> json(SearchDocument)`
pub(crate) const SEARCH_DOCUMENTS: TableDefinition<u64, &[u8]> =
    TableDefinition::new("search_documents");

/// Derived, rebuildable projection of a form used by the query path.
///
/// Written in the same transaction as the mutation that produced it, so
/// visibility and filters always reflect committed state even when the
/// full-text index or the embedding lags behind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchDocument {
    pub form_id: FormId,
    pub title: String,
    pub is_public: bool,
    pub status: WorkflowStatus,
    pub category: String,
    pub business_areas: Vec<String>,
    #[serde(default)]
    pub created_at: u64,
    pub updated_at: u64,
    pub downloads: u64,
    pub deleted: bool,
    /// Hash of the text the embedding must be computed from.
    pub text_hash: u64,
}

impl SearchDocument {
    pub fn from_form(form: &Form, downloads: u64) -> Self {
        Self {
            form_id: form.id,
            title: form.title.clone(),
            is_public: form.is_public,
            status: form.status,
            category: form.category.clone(),
            business_areas: form.business_areas.clone(),
            created_at: form.created_at,
            updated_at: form.updated_at,
            downloads,
            deleted: form.is_deleted(),
            text_hash: form.semantic_hash(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::form::NewForm;

    #[test]
    fn projection_tracks_form() {
        let mut input = NewForm::new("Vehicle Permits", "permits");
        input.keywords = vec!["Trucks".into()];
        input.description = Some("Permits for oversized vehicles".into());
        let form = input.into_form(FormId(3), "alice", 7).unwrap();

        let doc = SearchDocument::from_form(&form, 4);
        assert_eq!(doc.form_id, FormId(3));
        assert_eq!(doc.category, "permits");
        assert_eq!(doc.downloads, 4);
        assert_eq!(doc.status, WorkflowStatus::Draft);
        assert!(!doc.deleted);
        assert_eq!(doc.text_hash, form.semantic_hash());
    }
}
