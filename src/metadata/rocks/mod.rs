use std::path::{Path, PathBuf};
use std::sync::Arc;

use rocksdb::{
    BlockBasedOptions, Cache, DBIteratorWithThreadMode, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch, WriteOptions,
};

use crate::common::{Error, Result};

pub type Db = DBWithThreadMode<MultiThreaded>;

pub const LRU_CACHE_SIZE: usize = 256 * 1024 * 1024;
pub const WRITE_BUFFER_SIZE: usize = 128 * 1024 * 1024;

/// Durable ordered key/value store underneath the metadata state machine.
pub struct RocksDbStore {
    db: Arc<Db>,
    dir: PathBuf,
}

impl RocksDbStore {
    /// Open or create the RocksDB instance located at `path`.
    pub fn open<P: AsRef<Path>>(
        path: P,
        lru_cache_size: usize,
        write_buffer_size: usize,
    ) -> Result<Self> {
        let dir = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::StoreIo(format!("create {}: {}", dir.display(), e)))?;

        let cache = Cache::new_lru_cache(lru_cache_size);
        let mut table_opts = BlockBasedOptions::default();
        table_opts.set_block_cache(&cache);

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_write_buffer_size(write_buffer_size);
        opts.set_block_based_table_factory(&table_opts);

        let db = Db::open(&opts, &dir)
            .map_err(|e| Error::StoreIo(format!("open {}: {}", dir.display(), e)))?;
        tracing::info!("opened metadata store at {}", dir.display());
        Ok(Self {
            db: Arc::new(db),
            dir,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?)
    }

    /// All records whose key starts with `prefix`, in key order.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix, Direction::Forward));
        for kv in iter {
            let (raw_key, raw_val) = kv?;
            if !raw_key.starts_with(prefix) {
                break;
            }
            out.push((raw_key.to_vec(), raw_val.to_vec()));
        }
        Ok(out)
    }

    /// Point-in-time ordered iteration over every record.
    pub fn iter(&self) -> DBIteratorWithThreadMode<'_, Db> {
        self.db.iterator(IteratorMode::Start)
    }

    /// Atomically apply `batch`, synced to disk.
    pub fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut wo = WriteOptions::default();
        wo.set_sync(true);
        self.db.write_opt(batch, &wo)?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        Ok(self.db.flush()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_batch_and_prefix_scan() {
        let dir = tempdir().unwrap();
        let store = RocksDbStore::open(dir.path(), 8 << 20, 4 << 20).unwrap();

        let mut wb = WriteBatch::default();
        wb.put(b"#user#bob", b"b");
        wb.put(b"#user#alice", b"a");
        wb.put(b"#node#x", b"n");
        store.write(wb).unwrap();

        let users = store.scan_prefix(b"#user#").unwrap();
        assert_eq!(
            users,
            vec![
                (b"#user#alice".to_vec(), b"a".to_vec()),
                (b"#user#bob".to_vec(), b"b".to_vec()),
            ]
        );
        assert_eq!(store.get(b"#node#x").unwrap(), Some(b"n".to_vec()));
        assert_eq!(store.get(b"#node#y").unwrap(), None);
        assert_eq!(store.iter().count(), 3);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempdir().unwrap();
        {
            let store = RocksDbStore::open(dir.path(), 8 << 20, 4 << 20).unwrap();
            let mut wb = WriteBatch::default();
            wb.put(b"k", b"v");
            store.write(wb).unwrap();
        }
        let store = RocksDbStore::open(dir.path(), 8 << 20, 4 << 20).unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
    }
}
