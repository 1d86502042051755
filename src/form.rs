use std::{
    fmt,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    error::{Error, Result},
    workflow::WorkflowStatus,
};

pub const MAX_TITLE_LEN: usize = 255;
pub const MAX_CATEGORY_LEN: usize = 100;
pub const MAX_DESCRIPTION_LEN: usize = 2000;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// First eight bytes of the BLAKE3 digest of `bytes`. Persisted, so it must
/// not depend on the toolchain.
pub fn stable_hash(bytes: &[u8]) -> u64 {
    let digest = blake3::hash(bytes);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(prefix)
}

/// Opaque form identifier, allocated from a monotonic sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
pub struct FormId(pub u64);

impl fmt::Display for FormId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl FromStr for FormId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let digits = s.strip_prefix('#').unwrap_or(s);
        digits
            .parse()
            .map(FormId)
            .map_err(|_| Error::Invalid(format!("invalid form id '{s}'")))
    }
}

/// The authoritative form row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Form {
    pub id: FormId,
    pub title: String,
    pub description: Option<String>,
    pub category: String,
    pub keywords: Vec<String>,
    pub business_areas: Vec<String>,
    pub is_public: bool,
    pub status: WorkflowStatus,
    pub current_version: u32,
    pub created_by: String,
    pub effective_date: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
    pub deleted_at: Option<u64>,
    /// Bumped on every committed change; used for optimistic concurrency.
    pub revision: u64,
}

impl Form {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Text the semantic embedding is computed from.
    pub fn semantic_text(&self) -> String {
        let mut parts = vec![self.title.clone()];
        if let Some(desc) = &self.description
            && !desc.trim().is_empty()
        {
            parts.push(desc.clone());
        }
        if !self.keywords.is_empty() {
            parts.push(self.keywords.join(" "));
        }
        parts.join("\n")
    }

    /// Stable hash of [`Form::semantic_text`], used to tell whether a stored
    /// embedding still matches the form.
    pub fn semantic_hash(&self) -> u64 {
        stable_hash(self.semantic_text().as_bytes())
    }

    /// Snapshot of the user-editable fields, as recorded in the audit log.
    pub fn snapshot(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "title": self.title,
            "description": self.description,
            "category": self.category,
            "keywords": self.keywords,
            "business_areas": self.business_areas,
            "is_public": self.is_public,
            "status": self.status,
            "current_version": self.current_version,
            "effective_date": self.effective_date,
        })
    }
}

/// Input for creating a form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewForm {
    pub title: String,
    pub description: Option<String>,
    pub category: String,
    pub keywords: Vec<String>,
    pub business_areas: Vec<String>,
    pub is_public: bool,
    pub effective_date: Option<u64>,
}

impl NewForm {
    pub fn new(title: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            category: category.into(),
            ..Default::default()
        }
    }

    pub(crate) fn into_form(
        self,
        id: FormId,
        created_by: &str,
        now: u64,
    ) -> Result<Form> {
        let title = validate_text("title", &self.title, MAX_TITLE_LEN)?;
        let category =
            validate_text("category", &self.category, MAX_CATEGORY_LEN)?;
        let description = validate_description(self.description)?;

        Ok(Form {
            id,
            title,
            description,
            category,
            keywords: normalize_tags(self.keywords),
            business_areas: normalize_tags(self.business_areas),
            is_public: self.is_public,
            status: WorkflowStatus::Draft,
            current_version: 0,
            created_by: created_by.to_string(),
            effective_date: self.effective_date,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            revision: 0,
        })
    }
}

/// Partial update of a form's editable fields. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormPatch {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub category: Option<String>,
    pub keywords: Option<Vec<String>>,
    pub business_areas: Option<Vec<String>>,
    pub is_public: Option<bool>,
    pub effective_date: Option<Option<u64>>,
}

impl FormPatch {
    pub fn is_empty(&self) -> bool {
        *self == FormPatch::default()
    }

    pub(crate) fn apply(self, form: &mut Form) -> Result<()> {
        if let Some(title) = self.title {
            form.title = validate_text("title", &title, MAX_TITLE_LEN)?;
        }
        if let Some(description) = self.description {
            form.description = validate_description(description)?;
        }
        if let Some(category) = self.category {
            form.category =
                validate_text("category", &category, MAX_CATEGORY_LEN)?;
        }
        if let Some(keywords) = self.keywords {
            form.keywords = normalize_tags(keywords);
        }
        if let Some(areas) = self.business_areas {
            form.business_areas = normalize_tags(areas);
        }
        if let Some(is_public) = self.is_public {
            form.is_public = is_public;
        }
        if let Some(effective_date) = self.effective_date {
            form.effective_date = effective_date;
        }
        Ok(())
    }
}

fn validate_text(field: &str, value: &str, max: usize) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::Invalid(format!("{field} must not be empty")));
    }
    if trimmed.chars().count() > max {
        return Err(Error::Invalid(format!(
            "{field} must be at most {max} characters"
        )));
    }
    Ok(trimmed.to_string())
}

fn validate_description(value: Option<String>) -> Result<Option<String>> {
    match value.map(|d| d.trim().to_string()) {
        Some(d) if d.is_empty() => Ok(None),
        Some(d) if d.chars().count() > MAX_DESCRIPTION_LEN => {
            Err(Error::Invalid(format!(
                "description must be at most {MAX_DESCRIPTION_LEN} characters"
            )))
        }
        other => Ok(other),
    }
}

/// Trim, drop empties, de-duplicate and sort.
fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = tags
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}
