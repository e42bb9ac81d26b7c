//! RocksDB-backed persistent document storage.
//!
//! Column families:
//! - `documents`: document field maps as LZ4-compressed JSON, keyed by the
//!   full document path (`rooms/{id}`, `rooms/{id}/messages/{id}`, ...)
//!
//! Paths sort so that the direct children of a collection are contiguous
//! under the `{collection}/` prefix; a collection scan is a single forward
//! iteration that skips nested sub-collection keys.

use super::backend::StorageBackend;
use super::{CollectionPath, DocPath, Fields, StoreError, StoredDoc};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteOptions,
};
use std::path::{Path, PathBuf};

const CF_DOCUMENTS: &str = "documents";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS];

/// RocksDB configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("hearth_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
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

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Persistent [`StorageBackend`].
pub struct RocksBackend {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksBackend {
    /// Open the database, creating it and its column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened document database at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 framed
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(CF_DOCUMENTS)
            .ok_or_else(|| StoreError::Database(format!("Column family '{CF_DOCUMENTS}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }
}

fn encode(fields: &Fields) -> Result<Vec<u8>, StoreError> {
    let json = serde_json::to_vec(fields)?;
    Ok(lz4_flex::compress_prepend_size(&json))
}

fn decode(bytes: &[u8]) -> Result<Fields, StoreError> {
    let json = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    Ok(serde_json::from_slice(&json)?)
}

impl StorageBackend for RocksBackend {
    fn load(&self, path: &DocPath) -> Result<Option<Fields>, StoreError> {
        let cf = self.cf()?;
        match self.db.get_cf(cf, path.as_str().as_bytes())? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn save(&self, path: &DocPath, fields: &Fields) -> Result<(), StoreError> {
        let cf = self.cf()?;
        let value = encode(fields)?;
        self.db
            .put_cf_opt(cf, path.as_str().as_bytes(), value, &self.write_opts())?;
        Ok(())
    }

    fn remove(&self, path: &DocPath) -> Result<(), StoreError> {
        let cf = self.cf()?;
        self.db
            .delete_cf_opt(cf, path.as_str().as_bytes(), &self.write_opts())?;
        Ok(())
    }

    fn scan(&self, collection: &CollectionPath) -> Result<Vec<StoredDoc>, StoreError> {
        let cf = self.cf()?;
        let prefix = format!("{}/", collection.as_str());

        let mut docs = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix.as_bytes(), Direction::Forward));

        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let key = std::str::from_utf8(&key)
                .map_err(|e| StoreError::Database(format!("Invalid key: {e}")))?;
            if !collection.contains(key) {
                continue;
            }
            docs.push(StoredDoc::new(&key[prefix.len()..], decode(&value)?));
        }

        Ok(docs)
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::path;
    use serde_json::json;

    fn fields(v: serde_json::Value) -> Fields {
        v.as_object().cloned().unwrap()
    }

    fn open(dir: &tempfile::TempDir) -> RocksBackend {
        RocksBackend::open(StoreConfig::for_testing(dir.path())).unwrap()
    }

    #[test]
    fn test_open_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open(&dir);
        assert!(backend.path().exists());
    }

    #[test]
    fn test_save_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open(&dir);
        let p = path::room("r1");

        assert_eq!(backend.load(&p).unwrap(), None);
        let room = fields(json!({ "name": "Dune", "members": ["a"] }));
        backend.save(&p, &room).unwrap();
        assert_eq!(backend.load(&p).unwrap(), Some(room));

        backend.remove(&p).unwrap();
        assert_eq!(backend.load(&p).unwrap(), None);
    }

    #[test]
    fn test_scan_skips_nested_and_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open(&dir);
        let empty = Fields::new();

        backend.save(&path::room("r2"), &empty).unwrap();
        backend.save(&path::room("r1"), &empty).unwrap();
        backend
            .save(&path::room("r1").collection("annotations").doc("a1"), &empty)
            .unwrap();
        backend.save(&DocPath::new("roomsX/z"), &empty).unwrap();

        let ids: Vec<String> = backend
            .scan(&path::rooms())
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec!["r1", "r2"]);
    }

    #[test]
    fn test_reopen_keeps_documents() {
        let dir = tempfile::tempdir().unwrap();
        {
            let backend = open(&dir);
            backend
                .save(&path::user("u1"), &fields(json!({ "name": "Ada" })))
                .unwrap();
            backend.sync().unwrap();
        }
        let backend = open(&dir);
        let user = backend.load(&path::user("u1")).unwrap().unwrap();
        assert_eq!(user["name"], json!("Ada"));
    }

    #[test]
    fn test_values_are_lz4_framed() {
        let big = fields(json!({ "text": "lorem ipsum ".repeat(500) }));
        let encoded = encode(&big).unwrap();
        let raw = serde_json::to_vec(&big).unwrap();
        assert!(encoded.len() < raw.len() / 2);
        assert_eq!(decode(&encoded).unwrap(), big);
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!config.sync_writes);
        assert_eq!(config.path, PathBuf::from("hearth_data"));
    }
}
