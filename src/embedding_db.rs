use std::path::Path;

use redb::{
    Database,
    ReadableDatabase,
    ReadableTable,
    ReadableTableMetadata,
    TableDefinition,
};

use crate::{error::Result, form::FormId};

const EMBEDDINGS: TableDefinition<u64, &[u8]> =
    TableDefinition::new("embeddings");
/// `form_id -> consecutive failed refresh jobs`
const FAILURES: TableDefinition<u64, u32> =
    TableDefinition::new("embedding_failures");

/// Header size: 4 bytes dimension + 8 bytes source text hash.
const HEADER_SIZE: usize = 12;

/// Stores one semantic embedding per form, keyed by form id.
///
/// Binary format per entry:
/// - 4 bytes: embedding dimension D (u32 LE)
/// - 8 bytes: hash of the text the vector was computed from (u64 LE)
/// - D * 4 bytes: f32 LE values
pub struct EmbeddingDb {
    db: Database,
}

/// A stored embedding and the text hash it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEmbedding {
    pub text_hash: u64,
    pub vector: Vec<f32>,
}

impl EmbeddingDb {
    /// Open or create an embeddings database at the given path.
    ///
    /// # Examples
    ///
    /// ```
    /// # let tmp = tempfile::tempdir().unwrap();
    /// use formdex::EmbeddingDb;
    ///
    /// let path = tmp.path().join("embeddings.redb");
    /// let db = EmbeddingDb::open(&path).unwrap();
    /// assert!(db.list_ids().unwrap().is_empty());
    /// ```
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).map_err(redb::Error::from)?;

        let txn = db.begin_write()?;
        txn.open_table(EMBEDDINGS)?;
        txn.open_table(FAILURES)?;
        txn.commit()?;

        Ok(Self { db })
    }

    /// Store the embedding of a form, replacing any previous one, and clear
    /// its failure counter.
    ///
    /// Uses `insert_reserve` for zero-copy writes.
    pub fn store(
        &self,
        id: FormId,
        text_hash: u64,
        vector: &[f32],
    ) -> Result<()> {
        let byte_len = HEADER_SIZE + std::mem::size_of_val(vector);
        let dimension = vector.len() as u32;

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(EMBEDDINGS)?;
            let mut guard = table.insert_reserve(id.0, byte_len)?;
            let dest = guard.as_mut();

            dest[0..4].copy_from_slice(&dimension.to_le_bytes());
            dest[4..12].copy_from_slice(&text_hash.to_le_bytes());
            dest[HEADER_SIZE..].copy_from_slice(bytemuck::cast_slice(vector));
        }
        txn.open_table(FAILURES)?.remove(id.0)?;
        txn.commit()?;
        Ok(())
    }

    /// Retrieve the embedding of a form. Malformed entries read as missing.
    pub fn load(&self, id: FormId) -> Result<Option<StoredEmbedding>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(EMBEDDINGS)?;

        let Some(guard) = table.get(id.0)? else {
            return Ok(None);
        };
        Ok(decode(guard.value()))
    }

    /// Only the text hash of a stored embedding.
    pub fn text_hash(&self, id: FormId) -> Result<Option<u64>> {
        Ok(self.load(id)?.map(|e| e.text_hash))
    }

    /// Load many embeddings in a single transaction, preserving input
    /// order. Missing entries come back as `None`.
    pub fn batch_load(
        &self,
        ids: &[FormId],
    ) -> Result<Vec<(FormId, Option<StoredEmbedding>)>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let txn = self.db.begin_read()?;
        let table = txn.open_table(EMBEDDINGS)?;

        let mut results = Vec::with_capacity(ids.len());
        for &id in ids {
            let embedding = match table.get(id.0)? {
                Some(guard) => decode(guard.value()),
                None => None,
            };
            results.push((id, embedding));
        }
        Ok(results)
    }

    pub fn remove(&self, id: FormId) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(EMBEDDINGS)?;
            table.remove(id.0)?.is_some()
        };
        txn.open_table(FAILURES)?.remove(id.0)?;
        txn.commit()?;
        Ok(removed)
    }

    /// Count one more failed refresh for `id` and return the new total.
    pub fn record_failure(&self, id: FormId) -> Result<u32> {
        let txn = self.db.begin_write()?;
        let count = {
            let mut table = txn.open_table(FAILURES)?;
            let count =
                table.get(id.0)?.map(|v| v.value()).unwrap_or(0) + 1;
            table.insert(id.0, count)?;
            count
        };
        txn.commit()?;
        Ok(count)
    }

    pub fn failure_count(&self, id: FormId) -> Result<u32> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(FAILURES)?;
        Ok(table.get(id.0)?.map(|v| v.value()).unwrap_or(0))
    }

    /// Number of forms whose last refresh failed.
    pub fn failing(&self) -> Result<u64> {
        let txn = self.db.begin_read()?;
        Ok(txn.open_table(FAILURES)?.len()?)
    }

    /// List all form ids with a stored embedding.
    pub fn list_ids(&self) -> Result<Vec<FormId>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(EMBEDDINGS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, _) = entry?;
            result.push(FormId(k.value()));
        }
        Ok(result)
    }
}

impl std::fmt::Debug for EmbeddingDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingDb").finish_non_exhaustive()
    }
}

fn decode(bytes: &[u8]) -> Option<StoredEmbedding> {
    if bytes.len() < HEADER_SIZE {
        return None;
    }
    let dimension = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
    let text_hash = u64::from_le_bytes(bytes[4..12].try_into().ok()?);
    if bytes.len() != HEADER_SIZE + (dimension as usize) * 4 {
        return None;
    }
    // redb values carry no alignment guarantee
    let vector = bytes[HEADER_SIZE..]
        .chunks_exact(4)
        .map(bytemuck::pod_read_unaligned::<f32>)
        .collect();
    Some(StoredEmbedding { text_hash, vector })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, EmbeddingDb) {
        let tmp = tempfile::tempdir().unwrap();
        let db =
            EmbeddingDb::open(&tmp.path().join("embeddings.redb")).unwrap();
        (tmp, db)
    }

    #[test]
    fn store_and_load() {
        let (_tmp, db) = test_db();

        let vector: Vec<f32> = (0..8).map(|i| i as f32 * 0.1).collect();
        db.store(FormId(42), 7, &vector).unwrap();

        let stored = db.load(FormId(42)).unwrap().unwrap();
        assert_eq!(stored.text_hash, 7);
        assert_eq!(stored.vector, vector);
        assert_eq!(db.text_hash(FormId(42)).unwrap(), Some(7));
    }

    #[test]
    fn load_missing_returns_none() {
        let (_tmp, db) = test_db();
        assert!(db.load(FormId(999)).unwrap().is_none());
    }

    #[test]
    fn overwrite_entry() {
        let (_tmp, db) = test_db();

        db.store(FormId(1), 1, &[1.0, 2.0]).unwrap();
        db.store(FormId(1), 2, &[3.0, 4.0, 5.0]).unwrap();

        let stored = db.load(FormId(1)).unwrap().unwrap();
        assert_eq!(stored.text_hash, 2);
        assert_eq!(stored.vector, vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn batch_load_preserves_order() {
        let (_tmp, db) = test_db();

        db.store(FormId(10), 0, &[1.0, 2.0]).unwrap();
        db.store(FormId(30), 0, &[5.0, 6.0]).unwrap();

        let results = db
            .batch_load(&[FormId(30), FormId(99), FormId(10)])
            .unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].1.as_ref().unwrap().vector, vec![5.0, 6.0]);
        assert!(results[1].1.is_none());
        assert_eq!(results[2].0, FormId(10));
    }

    #[test]
    fn failures_are_counted_and_cleared_by_store() {
        let (_tmp, db) = test_db();

        assert_eq!(db.record_failure(FormId(5)).unwrap(), 1);
        assert_eq!(db.record_failure(FormId(5)).unwrap(), 2);
        assert_eq!(db.failing().unwrap(), 1);

        db.store(FormId(5), 3, &[1.0]).unwrap();
        assert_eq!(db.failure_count(FormId(5)).unwrap(), 0);
        assert_eq!(db.failing().unwrap(), 0);
    }

    #[test]
    fn remove_and_list() {
        let (_tmp, db) = test_db();

        db.store(FormId(20), 0, &[1.0]).unwrap();
        db.store(FormId(10), 0, &[1.0]).unwrap();
        assert_eq!(db.list_ids().unwrap(), vec![FormId(10), FormId(20)]);

        assert!(db.remove(FormId(10)).unwrap());
        assert!(!db.remove(FormId(10)).unwrap());
        assert_eq!(db.list_ids().unwrap(), vec![FormId(20)]);
    }

    #[test]
    fn reopen_preserves_data() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("embeddings.redb");

        {
            let db = EmbeddingDb::open(&path).unwrap();
            db.store(FormId(42), 9, &[1.0, 2.0]).unwrap();
        }

        let db = EmbeddingDb::open(&path).unwrap();
        let stored = db.load(FormId(42)).unwrap().unwrap();
        assert_eq!(stored.vector, vec![1.0, 2.0]);
    }
}
