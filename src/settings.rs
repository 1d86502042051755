use std::{fmt, str::FromStr, time::Duration};

use serde::Serialize;

use crate::{
    error::{Error, Result},
    store::CatalogDb,
};

pub const DEFAULT_MODEL_ID: &str = "lightonai/GTE-ModernColBERT-v1";
pub const MODEL_ENV_VAR: &str = "FORMDEX_MODEL";
pub const EMBEDDER_ENV_VAR: &str = "FORMDEX_EMBEDDER";

/// Upper bound on the internal candidate limit of each search branch.
pub const MAX_CANDIDATES: usize = 1000;

/// Which forms accept new file versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadPolicy {
    DraftOnly,
    DraftOrPublished,
}

impl UploadPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            UploadPolicy::DraftOnly => "draft_only",
            UploadPolicy::DraftOrPublished => "draft_or_published",
        }
    }
}

impl FromStr for UploadPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "draft_only" => Ok(UploadPolicy::DraftOnly),
            "draft_or_published" => Ok(UploadPolicy::DraftOrPublished),
            other => Err(Error::Config(format!(
                "upload_policy must be draft_only or draft_or_published, \
                 got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbedderKind {
    Colbert,
    Hashing,
}

impl EmbedderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EmbedderKind::Colbert => "colbert",
            EmbedderKind::Hashing => "hashing",
        }
    }
}

impl fmt::Display for EmbedderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmbedderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "colbert" => Ok(EmbedderKind::Colbert),
            "hashing" => Ok(EmbedderKind::Hashing),
            other => Err(Error::Config(format!(
                "embedder must be colbert or hashing, got '{other}'"
            ))),
        }
    }
}

/// Runtime tuning, persisted as strings in the catalog's settings table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    pub rrf_k: u32,
    pub default_page_size: usize,
    pub max_page_size: usize,
    pub candidate_multiplier: usize,
    pub query_timeout_ms: u64,
    pub embed_timeout_ms: u64,
    pub embed_max_attempts: u32,
    pub embed_backoff_ms: u64,
    pub max_write_retries: u32,
    pub upload_policy: UploadPolicy,
    pub semantic_min_similarity: f32,
    pub embedder: EmbedderKind,
    pub model: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rrf_k: 60,
            default_page_size: 20,
            max_page_size: 100,
            candidate_multiplier: 3,
            query_timeout_ms: 2000,
            embed_timeout_ms: 10_000,
            embed_max_attempts: 3,
            embed_backoff_ms: 250,
            max_write_retries: 5,
            upload_policy: UploadPolicy::DraftOnly,
            semantic_min_similarity: 0.0,
            embedder: EmbedderKind::Colbert,
            model: DEFAULT_MODEL_ID.to_string(),
        }
    }
}

impl Settings {
    pub const KEYS: [&'static str; 13] = [
        "rrf_k",
        "default_page_size",
        "max_page_size",
        "candidate_multiplier",
        "query_timeout_ms",
        "embed_timeout_ms",
        "embed_max_attempts",
        "embed_backoff_ms",
        "max_write_retries",
        "upload_policy",
        "semantic_min_similarity",
        "embedder",
        "model",
    ];

    /// Load settings from the catalog, then apply environment overrides.
    pub fn load(db: &CatalogDb) -> Result<Self> {
        let mut settings = Settings::default();
        for (key, value) in db.list_settings()? {
            if Self::KEYS.contains(&key.as_str()) {
                settings.apply(&key, &value)?;
            } else {
                tracing::warn!(key, "ignoring unknown setting");
            }
        }

        if let Ok(model) = std::env::var(MODEL_ENV_VAR) {
            settings.model = model;
        }
        if let Ok(embedder) = std::env::var(EMBEDDER_ENV_VAR) {
            settings.embedder = embedder.parse()?;
        }

        Ok(settings)
    }

    /// Validate and persist one setting.
    pub fn set(db: &CatalogDb, key: &str, value: &str) -> Result<()> {
        Settings::default().apply(key, value)?;
        db.set_setting(key, value)
    }

    /// Remove a persisted setting so its default applies again.
    pub fn clear(db: &CatalogDb, key: &str) -> Result<bool> {
        check_key(key)?;
        db.remove_setting(key)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "rrf_k" => self.rrf_k = parse(key, value)?,
            "default_page_size" => {
                self.default_page_size = parse_positive(key, value)?
            }
            "max_page_size" => self.max_page_size = parse_positive(key, value)?,
            "candidate_multiplier" => {
                self.candidate_multiplier = parse_positive(key, value)?
            }
            "query_timeout_ms" => {
                self.query_timeout_ms = parse_positive(key, value)?
            }
            "embed_timeout_ms" => {
                self.embed_timeout_ms = parse_positive(key, value)?
            }
            "embed_max_attempts" => {
                self.embed_max_attempts = parse_positive(key, value)?
            }
            "embed_backoff_ms" => self.embed_backoff_ms = parse(key, value)?,
            "max_write_retries" => self.max_write_retries = parse(key, value)?,
            "upload_policy" => self.upload_policy = value.parse()?,
            "semantic_min_similarity" => {
                let v: f32 = parse(key, value)?;
                if !(-1.0..=1.0).contains(&v) {
                    return Err(Error::Config(format!(
                        "{key} must be between -1 and 1"
                    )));
                }
                self.semantic_min_similarity = v;
            }
            "embedder" => self.embedder = value.parse()?,
            "model" => {
                if value.trim().is_empty() {
                    return Err(Error::Config("model must not be empty".into()));
                }
                self.model = value.to_string();
            }
            other => check_key(other)?,
        }
        Ok(())
    }

    /// Page size actually used for a requested `limit`. Zero selects the
    /// default; oversized requests are clamped.
    pub fn clamp_page_size(&self, limit: usize) -> usize {
        let limit = if limit == 0 {
            self.default_page_size
        } else {
            limit
        };
        limit.min(self.max_page_size)
    }

    /// Internal candidate limit of each search branch for a page ending at
    /// `page_end`.
    pub fn candidate_limit(&self, page_end: usize) -> usize {
        page_end
            .saturating_mul(self.candidate_multiplier)
            .clamp(1, MAX_CANDIDATES)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn embed_timeout(&self) -> Duration {
        Duration::from_millis(self.embed_timeout_ms)
    }

    /// Current value of `key` rendered as it would be stored.
    pub fn get(&self, key: &str) -> Result<String> {
        Ok(match key {
            "rrf_k" => self.rrf_k.to_string(),
            "default_page_size" => self.default_page_size.to_string(),
            "max_page_size" => self.max_page_size.to_string(),
            "candidate_multiplier" => self.candidate_multiplier.to_string(),
            "query_timeout_ms" => self.query_timeout_ms.to_string(),
            "embed_timeout_ms" => self.embed_timeout_ms.to_string(),
            "embed_max_attempts" => self.embed_max_attempts.to_string(),
            "embed_backoff_ms" => self.embed_backoff_ms.to_string(),
            "max_write_retries" => self.max_write_retries.to_string(),
            "upload_policy" => self.upload_policy.as_str().to_string(),
            "semantic_min_similarity" => {
                self.semantic_min_similarity.to_string()
            }
            "embedder" => self.embedder.to_string(),
            "model" => self.model.clone(),
            other => {
                return Err(Error::Config(format!("unknown setting '{other}'")));
            }
        })
    }
}

fn check_key(key: &str) -> Result<()> {
    if Settings::KEYS.contains(&key) {
        Ok(())
    } else {
        Err(Error::Config(format!("unknown setting '{key}'")))
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| {
            Error::Config(format!("invalid value '{value}' for {key}"))
        })
}

fn parse_positive<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr + PartialOrd + Default,
{
    let v: T = parse(key, value)?;
    if v <= T::default() {
        return Err(Error::Config(format!("{key} must be greater than zero")));
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, CatalogDb) {
        let tmp = tempfile::tempdir().unwrap();
        let db = CatalogDb::open(&tmp.path().join("catalog.redb")).unwrap();
        (tmp, db)
    }

    #[test]
    fn defaults_round_trip_through_get() {
        let settings = Settings::default();
        let mut copy = Settings::default();
        for key in Settings::KEYS {
            copy.apply(key, &settings.get(key).unwrap()).unwrap();
        }
        assert_eq!(copy, settings);
    }

    #[test]
    fn set_validates_before_persisting() {
        let (_tmp, db) = test_db();

        Settings::set(&db, "rrf_k", "30").unwrap();
        assert!(Settings::set(&db, "max_page_size", "0").is_err());
        assert!(Settings::set(&db, "upload_policy", "always").is_err());
        assert!(Settings::set(&db, "colour", "blue").is_err());
        assert_eq!(db.list_settings().unwrap().len(), 1);

        assert!(Settings::clear(&db, "rrf_k").unwrap());
        assert!(Settings::clear(&db, "colour").is_err());
    }

    #[test]
    fn load_applies_stored_values() {
        let (_tmp, db) = test_db();
        Settings::set(&db, "upload_policy", "draft_or_published").unwrap();
        Settings::set(&db, "query_timeout_ms", "50").unwrap();

        let settings = Settings::load(&db).unwrap();
        assert_eq!(settings.upload_policy, UploadPolicy::DraftOrPublished);
        assert_eq!(settings.query_timeout(), Duration::from_millis(50));
        assert_eq!(settings.rrf_k, 60);
    }

    #[test]
    fn page_size_is_clamped_not_rejected() {
        let settings = Settings::default();
        assert_eq!(settings.clamp_page_size(0), 20);
        assert_eq!(settings.clamp_page_size(7), 7);
        assert_eq!(settings.clamp_page_size(10_000), 100);
    }

    #[test]
    fn candidate_limit_is_bounded() {
        let settings = Settings::default();
        assert_eq!(settings.candidate_limit(20), 60);
        assert_eq!(settings.candidate_limit(0), 1);
        assert_eq!(settings.candidate_limit(usize::MAX), MAX_CANDIDATES);
    }

    #[test]
    fn upload_policy_parses() {
        assert_eq!(
            "draft_or_published".parse::<UploadPolicy>().unwrap(),
            UploadPolicy::DraftOrPublished
        );
        assert!("published".parse::<UploadPolicy>().is_err());
    }
}
