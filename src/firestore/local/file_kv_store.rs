use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::firestore::error::{data_loss, unavailable, FirestoreResult};
use crate::firestore::local::kv_store::{
    apply_batch, lock_unpoisoned, KvStore, MemoryKvStore, ScanRange, Table, WriteBatch,
};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    tables: BTreeMap<Table, Vec<(String, String)>>,
}

/// Durable store: every commit rewrites a JSON snapshot through a temp file and
/// an atomic rename. Reads are served from memory.
pub struct FileKvStore {
    path: PathBuf,
    memory: MemoryKvStore,
    write_lock: Mutex<()>,
}

impl FileKvStore {
    pub fn open(path: impl AsRef<Path>) -> FirestoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let tables = if path.exists() {
            load_snapshot(&path)?
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(|err| {
                    unavailable(format!("Failed to create {}: {err}", parent.display()))
                })?;
            }
            BTreeMap::new()
        };
        log::debug!("opened file store at {}", path.display());
        Ok(Self {
            path,
            memory: MemoryKvStore::from_tables(tables),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, tables: &BTreeMap<Table, BTreeMap<Vec<u8>, Vec<u8>>>) -> FirestoreResult<()> {
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            tables: tables
                .iter()
                .map(|(table, rows)| {
                    let rows = rows
                        .iter()
                        .map(|(k, v)| (BASE64_STANDARD.encode(k), BASE64_STANDARD.encode(v)))
                        .collect();
                    (*table, rows)
                })
                .collect(),
        };
        let encoded = serde_json::to_vec(&snapshot)
            .map_err(|err| unavailable(format!("Failed to encode store snapshot: {err}")))?;

        let temp_path = self.path.with_extension("tmp");
        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
            fs::rename(&temp_path, &self.path)
        };
        write().map_err(|err| unavailable(format!("Failed to write {}: {err}", self.path.display())))
    }
}

fn load_snapshot(path: &Path) -> FirestoreResult<BTreeMap<Table, BTreeMap<Vec<u8>, Vec<u8>>>> {
    let raw = fs::read(path)
        .map_err(|err| unavailable(format!("Failed to read {}: {err}", path.display())))?;
    let snapshot: Snapshot = serde_json::from_slice(&raw)
        .map_err(|err| data_loss(format!("Corrupt store file {}: {err}", path.display())))?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(data_loss(format!(
            "Unsupported store version {}",
            snapshot.version
        )));
    }
    let mut tables = BTreeMap::new();
    for (table, rows) in snapshot.tables {
        let mut decoded = BTreeMap::new();
        for (key, value) in rows {
            let key = BASE64_STANDARD
                .decode(key)
                .map_err(|err| data_loss(format!("Corrupt key in {table:?}: {err}")))?;
            let value = BASE64_STANDARD
                .decode(value)
                .map_err(|err| data_loss(format!("Corrupt value in {table:?}: {err}")))?;
            decoded.insert(key, value);
        }
        tables.insert(table, decoded);
    }
    Ok(tables)
}

impl KvStore for FileKvStore {
    fn get(&self, table: Table, key: &[u8]) -> FirestoreResult<Option<Vec<u8>>> {
        self.memory.get(table, key)
    }

    fn scan(&self, table: Table, range: &ScanRange) -> FirestoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.memory.scan(table, range)
    }

    fn commit(&self, batch: WriteBatch) -> FirestoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let _guard = lock_unpoisoned(&self.write_lock);
        let mut next = self.memory.snapshot_tables();
        apply_batch(&mut next, batch.clone());
        self.persist(&next)?;
        self.memory.commit(batch)
    }

    fn transaction_lock(&self) -> MutexGuard<'_, ()> {
        self.memory.transaction_lock()
    }
}
