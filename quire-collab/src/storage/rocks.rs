//! RocksDB-backed document persistence.
//!
//! Column families:
//! - `documents`  — UTF-8 content (LZ4 compressed), keyed by document key
//! - `metadata`   — [`DocumentMetadata`] (bincode), keyed by document key
//! - `operations` — journaled [`LoggedOperation`]s (bincode), keyed by
//!   document key + sequence (8 bytes big-endian)
//!
//! A document key is the id's UTF-8 bytes prefixed by their length
//! (4 bytes big-endian), so one id is never a key prefix of another.
//!
//! Saving a snapshot drops the journal entries it covers in the same write
//! batch. Loading folds any journal left behind by a crash into the snapshot
//! first.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::collaborators::DocumentPersistence;
use crate::document::DocumentState;
use crate::oplog::LoggedOperation;
use crate::storage::PersistenceError;
use crate::types::{now_millis, DocumentId, Timestamp};

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";
const CF_OPERATIONS: &str = "operations";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA, CF_OPERATIONS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write batch (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quire_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Bookkeeping stored next to each snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub document: DocumentId,
    /// Content length in chars at the last save
    pub length: u64,
    /// Uncompressed content size in bytes
    pub content_size: u64,
    /// Compressed content size in bytes
    pub compressed_size: u64,
    /// Number of snapshot saves
    pub save_count: u64,
    /// Operations currently in the journal
    pub journaled: u64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl DocumentMetadata {
    fn new(document: DocumentId) -> Self {
        let now = now_millis();
        Self {
            document,
            length: 0,
            content_size: 0,
            compressed_size: 0,
            save_count: 0,
            journaled: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, PersistenceError> {
        encode(self)
    }

    fn decode(bytes: &[u8]) -> Result<Self, PersistenceError> {
        decode(bytes)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, PersistenceError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| PersistenceError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, PersistenceError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
    Ok(value)
}

/// RocksDB document store.
pub struct RocksPersistence {
    /// Single-threaded column family mode; the handle itself is shared
    /// across blocking-pool threads.
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksPersistence {
    /// Open (or create) the store at `config.path`.
    pub fn open(config: StoreConfig) -> Result<Self, PersistenceError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened document store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS => {
                // Content is already LZ4 framed.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_OPERATIONS => {
                // Many small appends, range-scanned per document.
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }

        opts
    }

    // ─── Content ──────────────────────────────────────────────────────

    /// Stored snapshot, without folding the journal.
    pub fn load_content(&self, document: &DocumentId) -> Result<String, PersistenceError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, document_key(document))? {
            Some(compressed) => {
                let bytes = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| PersistenceError::Compression(e.to_string()))?;
                String::from_utf8(bytes).map_err(|e| PersistenceError::Serialization(e.to_string()))
            }
            None => Err(PersistenceError::NotFound(document.clone())),
        }
    }

    /// Write a snapshot and metadata in one batch, dropping the journal
    /// entries with sequence `<= through` that the snapshot already covers.
    pub fn save_content(
        &self,
        document: &DocumentId,
        content: &str,
        through: u64,
    ) -> Result<DocumentMetadata, PersistenceError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let cf_ops = self.cf(CF_OPERATIONS)?;

        let compressed = lz4_flex::compress_prepend_size(content.as_bytes());

        let mut meta = self
            .load_metadata(document)
            .unwrap_or_else(|_| DocumentMetadata::new(document.clone()));
        meta.length = content.chars().count() as u64;
        meta.content_size = content.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        let covered = self.journal_keys(document, through)?;
        meta.save_count += 1;
        meta.journaled = meta.journaled.saturating_sub(covered.len() as u64);
        meta.updated_at = now_millis();

        let key = document_key(document);
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_docs, &key, &compressed);
        batch.put_cf(cf_meta, &key, meta.encode()?);
        for op_key in covered {
            batch.delete_cf(cf_ops, op_key);
        }
        self.write(batch)?;

        Ok(meta)
    }

    pub fn document_exists(&self, document: &DocumentId) -> Result<bool, PersistenceError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(cf, document_key(document))?.is_some())
    }

    // ─── Operation journal ────────────────────────────────────────────

    /// Append one applied operation to the journal.
    pub fn append_operation(
        &self,
        document: &DocumentId,
        entry: &LoggedOperation,
    ) -> Result<(), PersistenceError> {
        let cf_ops = self.cf(CF_OPERATIONS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut meta = self
            .load_metadata(document)
            .unwrap_or_else(|_| DocumentMetadata::new(document.clone()));
        meta.journaled += 1;
        meta.updated_at = now_millis();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_ops, operation_key(document, entry.id().0), encode(entry)?);
        batch.put_cf(cf_meta, document_key(document), meta.encode()?);
        self.write(batch)
    }

    /// Journaled operations with sequence `>= since`, in sequence order.
    pub fn load_operations(
        &self,
        document: &DocumentId,
        since: u64,
    ) -> Result<Vec<LoggedOperation>, PersistenceError> {
        let cf = self.cf(CF_OPERATIONS)?;
        let prefix = document_key(document);
        let start = operation_key(document, since);

        let mut entries = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(&prefix) || key.len() != prefix.len() + 8 {
                break;
            }
            entries.push(decode(&value)?);
        }
        Ok(entries)
    }

    /// Drop journal entries with sequence `<= up_to`. Returns how many went.
    pub fn compact_operations(
        &self,
        document: &DocumentId,
        up_to: u64,
    ) -> Result<u64, PersistenceError> {
        let cf = self.cf(CF_OPERATIONS)?;
        let keys = self.journal_keys(document, up_to)?;
        let count = keys.len() as u64;
        if count > 0 {
            let mut batch = WriteBatch::default();
            for key in keys {
                batch.delete_cf(cf, key);
            }
            self.write(batch)?;
        }
        Ok(count)
    }

    fn journal_keys(&self, document: &DocumentId, up_to: u64) -> Result<Vec<Vec<u8>>, PersistenceError> {
        let cf = self.cf(CF_OPERATIONS)?;
        let prefix = document_key(document);
        let start = operation_key(document, 0);
        let end = operation_key(document, up_to);

        let mut keys = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward))
        {
            let (key, _) = item?;
            if !key.starts_with(&prefix) || key.len() != prefix.len() + 8 {
                break;
            }
            if key.as_ref() > end.as_slice() {
                break;
            }
            keys.push(key.to_vec());
        }
        Ok(keys)
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_metadata(&self, document: &DocumentId) -> Result<DocumentMetadata, PersistenceError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, document_key(document))? {
            Some(bytes) => DocumentMetadata::decode(&bytes),
            None => Err(PersistenceError::NotFound(document.clone())),
        }
    }

    /// Every document with metadata, in key order.
    pub fn list_documents(&self) -> Result<Vec<DocumentId>, PersistenceError> {
        let cf = self.cf(CF_METADATA)?;
        let mut documents = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            documents.push(DocumentMetadata::decode(&value)?.document);
        }
        Ok(documents)
    }

    /// Remove content, metadata and journal of `document`.
    pub fn delete_document(&self, document: &DocumentId) -> Result<(), PersistenceError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let cf_ops = self.cf(CF_OPERATIONS)?;

        let key = document_key(document);
        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_docs, &key);
        batch.delete_cf(cf_meta, &key);
        for op_key in self.journal_keys(document, u64::MAX)? {
            batch.delete_cf(cf_ops, op_key);
        }
        self.write(batch)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), PersistenceError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, PersistenceError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PersistenceError::Database(format!("Column family '{name}' not found")))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), PersistenceError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }
}

impl DocumentPersistence for RocksPersistence {
    fn load(&self, document: &DocumentId) -> Result<String, PersistenceError> {
        let snapshot = match self.load_content(document) {
            Ok(content) => content,
            Err(PersistenceError::NotFound(_)) => String::new(),
            Err(e) => return Err(e),
        };

        let journal = self.load_operations(document, 0)?;
        if journal.is_empty() {
            return Ok(snapshot);
        }

        // Left behind by a session that never saved; fold it in so the new
        // session's sequence numbers start from a clean journal.
        let mut state = DocumentState::new(snapshot);
        for entry in &journal {
            state.apply(&entry.transformed);
        }
        log::warn!(
            "Recovered {} journaled operation(s) for document {document}",
            journal.len()
        );
        self.save_content(document, state.content(), u64::MAX)?;
        Ok(state.content().to_string())
    }

    fn save(
        &self,
        document: &DocumentId,
        content: &str,
        through: u64,
    ) -> Result<(), PersistenceError> {
        let meta = self.save_content(document, content, through)?;
        log::debug!(
            "Saved document {document}: {} bytes ({} compressed)",
            meta.content_size,
            meta.compressed_size
        );
        Ok(())
    }

    fn record_operation(
        &self,
        document: &DocumentId,
        entry: &LoggedOperation,
    ) -> Result<(), PersistenceError> {
        self.append_operation(document, entry)
    }
}

/// Length-prefixed document key.
fn document_key(document: &DocumentId) -> Vec<u8> {
    let id = document.as_bytes();
    let mut key = Vec::with_capacity(4 + id.len());
    key.extend_from_slice(&(id.len() as u32).to_be_bytes());
    key.extend_from_slice(id);
    key
}

/// Document key + sequence (8 bytes big-endian).
fn operation_key(document: &DocumentId, sequence: u64) -> Vec<u8> {
    let mut key = document_key(document);
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{OpKind, Operation};
    use crate::types::{OperationId, ParticipantId};
    use tempfile::TempDir;

    fn open_store() -> (TempDir, RocksPersistence) {
        let dir = TempDir::new().unwrap();
        let store = RocksPersistence::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    fn logged(seq: u64, kind: OpKind) -> LoggedOperation {
        LoggedOperation {
            operation: Operation {
                id: OperationId(seq),
                participant: ParticipantId::from("p"),
                document: DocumentId::from("doc"),
                kind: kind.clone(),
                timestamp: seq,
            },
            transformed: kind,
            applied: true,
            clamped: false,
        }
    }

    #[test]
    fn test_store_open() {
        let (dir, store) = open_store();
        assert_eq!(store.path(), dir.path());
    }

    #[test]
    fn test_content_save_load() {
        let (_dir, store) = open_store();
        let doc = DocumentId::from("notes");
        let text = "Hello, wörld! ".repeat(50);

        let meta = store.save_content(&doc, &text, 0).unwrap();
        assert_eq!(meta.length, text.chars().count() as u64);
        assert_eq!(meta.content_size, text.len() as u64);
        assert!(meta.compressed_size < meta.content_size);
        assert_eq!(meta.save_count, 1);

        assert_eq!(store.load_content(&doc).unwrap(), text);
        assert_eq!(store.load(&doc).unwrap(), text);
    }

    #[test]
    fn test_missing_document() {
        let (_dir, store) = open_store();
        let doc = DocumentId::from("ghost");
        assert!(matches!(store.load_content(&doc), Err(PersistenceError::NotFound(_))));
        assert_eq!(store.load(&doc).unwrap(), "");
        assert!(!store.document_exists(&doc).unwrap());
    }

    #[test]
    fn test_journal_is_cleared_by_save() {
        let (_dir, store) = open_store();
        let doc = DocumentId::from("doc");
        store.save_content(&doc, "hello", 0).unwrap();
        store.append_operation(&doc, &logged(1, OpKind::insert(5, "!"))).unwrap();
        store.append_operation(&doc, &logged(2, OpKind::insert(0, ">"))).unwrap();
        assert_eq!(store.load_operations(&doc, 0).unwrap().len(), 2);
        assert_eq!(store.load_operations(&doc, 2).unwrap().len(), 1);
        assert_eq!(store.load_metadata(&doc).unwrap().journaled, 2);

        store.save_content(&doc, ">hello!", 2).unwrap();
        assert!(store.load_operations(&doc, 0).unwrap().is_empty());
        assert_eq!(store.load_metadata(&doc).unwrap().journaled, 0);
    }

    #[test]
    fn test_save_keeps_uncovered_journal_tail() {
        let (_dir, store) = open_store();
        let doc = DocumentId::from("doc");
        store.save_content(&doc, "hello", 0).unwrap();
        store.append_operation(&doc, &logged(1, OpKind::insert(5, "!"))).unwrap();
        store.append_operation(&doc, &logged(2, OpKind::insert(0, ">"))).unwrap();

        // Snapshot taken after op 1 only.
        store.save_content(&doc, "hello!", 1).unwrap();
        let rest = store.load_operations(&doc, 0).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id(), OperationId(2));
        assert_eq!(store.load_metadata(&doc).unwrap().journaled, 1);
        assert_eq!(store.load(&doc).unwrap(), ">hello!");
    }

    #[test]
    fn test_load_recovers_journal() {
        let (_dir, store) = open_store();
        let doc = DocumentId::from("doc");
        store.save_content(&doc, "hello", 0).unwrap();
        store.append_operation(&doc, &logged(1, OpKind::insert(5, " world"))).unwrap();
        store.append_operation(&doc, &logged(2, OpKind::delete(0, 1))).unwrap();

        assert_eq!(store.load(&doc).unwrap(), "ello world");
        // Folded into the snapshot, journal gone.
        assert_eq!(store.load_content(&doc).unwrap(), "ello world");
        assert!(store.load_operations(&doc, 0).unwrap().is_empty());
    }

    #[test]
    fn test_compact_operations() {
        let (_dir, store) = open_store();
        let doc = DocumentId::from("doc");
        for seq in 1..=6 {
            store.append_operation(&doc, &logged(seq, OpKind::insert(0, "x"))).unwrap();
        }
        assert_eq!(store.compact_operations(&doc, 4).unwrap(), 4);
        let rest = store.load_operations(&doc, 0).unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].id(), OperationId(5));
    }

    #[test]
    fn test_prefix_ids_do_not_collide() {
        let (_dir, store) = open_store();
        let short = DocumentId::from("doc");
        let long = DocumentId::from("doc2");
        store.append_operation(&short, &logged(1, OpKind::insert(0, "a"))).unwrap();
        store.append_operation(&long, &logged(1, OpKind::insert(0, "b"))).unwrap();
        assert_eq!(store.load_operations(&short, 0).unwrap().len(), 1);
        assert_eq!(store.load_operations(&long, 0).unwrap().len(), 1);
    }

    #[test]
    fn test_list_and_delete() {
        let (_dir, store) = open_store();
        for name in ["a", "b", "c"] {
            store.save_content(&DocumentId::from(name), "text", 0).unwrap();
        }
        let listed = store.list_documents().unwrap();
        assert_eq!(listed.len(), 3);
        assert!(listed.contains(&DocumentId::from("b")));

        store.delete_document(&DocumentId::from("b")).unwrap();
        assert!(!store.document_exists(&DocumentId::from("b")).unwrap());
        assert_eq!(store.list_documents().unwrap().len(), 2);
    }
}
