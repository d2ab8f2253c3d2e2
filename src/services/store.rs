use crate::error::{AppError, AppResult};
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

struct Row {
    version: u64,
    value: Value,
}

/// Committed rows. `generation` advances on every commit and doubles as the
/// version stamped on the rows that commit wrote; absent keys read as 0.
struct Table {
    rows: BTreeMap<String, Row>,
    generation: u64,
}

impl Table {
    fn version_of(&self, key: &str) -> u64 {
        self.rows.get(key).map_or(0, |row| row.version)
    }

    fn snapshot(&self) -> AppResult<Vec<u8>> {
        let values: BTreeMap<&str, &Value> = self
            .rows
            .iter()
            .map(|(key, row)| (key.as_str(), &row.value))
            .collect();
        Ok(serde_json::to_vec_pretty(&values)?)
    }
}

#[derive(Debug)]
struct Persisted {
    generation: u64,
    error: Option<String>,
}

struct SnapshotWriter {
    wake: Arc<Notify>,
    persisted: watch::Receiver<Persisted>,
}

/// Ordered JSON key-value store backing thresholds, aliases and tags.
///
/// Writes go through [`KvStore::transact`], which runs optimistically: the
/// closure sees committed rows without holding any lock, and the commit only
/// succeeds if none of the keys it read changed in the meantime, otherwise
/// the closure runs again. Writers on different keys never wait for each
/// other beyond the in-memory commit itself.
///
/// A store opened from a path hands snapshots to a background writer task,
/// so commits never touch the disk. [`KvStore::flush`] waits for the latest
/// commit to reach the file.
pub struct KvStore {
    table: Arc<RwLock<Table>>,
    writer: Option<SnapshotWriter>,
}

impl KvStore {
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            table: Arc::new(RwLock::new(Table {
                rows: BTreeMap::new(),
                generation: 0,
            })),
            writer: None,
        }
    }

    /// Loads the snapshot at `path` (missing or empty means an empty store)
    /// and starts its writer task. Must be called inside a Tokio runtime.
    pub async fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        let values: BTreeMap<String, Value> = match tokio::fs::read_to_string(&path).await {
            Ok(content) if !content.trim().is_empty() => serde_json::from_str(&content)?,
            Ok(_) => BTreeMap::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        info!("Local store opened at {:?} ({} keys)", path, values.len());

        let generation = 1;
        let rows = values
            .into_iter()
            .map(|(key, value)| (key, Row { version: generation, value }))
            .collect();
        let table = Arc::new(RwLock::new(Table { rows, generation }));

        let wake = Arc::new(Notify::new());
        let (persisted_tx, persisted) = watch::channel(Persisted {
            generation,
            error: None,
        });
        tokio::spawn(write_snapshots(
            Arc::downgrade(&table),
            path,
            Arc::clone(&wake),
            persisted_tx,
        ));

        Ok(Self {
            table,
            writer: Some(SnapshotWriter { wake, persisted }),
        })
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> AppResult<Option<T>> {
        let table = self.table.read();
        match table.rows.get(key) {
            Some(row) => Ok(Some(serde_json::from_value(row.value.clone())?)),
            None => Ok(None),
        }
    }

    /// Returns whether the key existed.
    pub fn delete(&self, key: &str) -> AppResult<bool> {
        self.transact(|txn| Ok(txn.delete(key)))
    }

    /// All records under `prefix`, in key order. Records that no longer
    /// decode as `T` are skipped.
    pub fn scan_prefix<T: DeserializeOwned>(&self, prefix: &str) -> Vec<(String, T)> {
        let table = self.table.read();
        table
            .rows
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter_map(|(key, row)| match serde_json::from_value(row.value.clone()) {
                Ok(record) => Some((key.clone(), record)),
                Err(e) => {
                    warn!("Skipping undecodable record {}: {}", key, e);
                    None
                }
            })
            .collect()
    }

    /// Runs `f` against a staged view of the store. Staged writes are applied
    /// atomically if `f` succeeds and discarded if it fails. `f` is re-run when
    /// a key it read was committed by someone else before this commit.
    ///
    /// A committed result is returned as is; snapshot failures are reported by
    /// the writer task and by [`KvStore::flush`].
    pub fn transact<R>(&self, f: impl Fn(&mut Txn<'_>) -> AppResult<R>) -> AppResult<R> {
        loop {
            let mut txn = Txn {
                table: self.table.as_ref(),
                reads: HashMap::new(),
                staged: BTreeMap::new(),
            };
            let result = f(&mut txn)?;
            let Txn { reads, staged, .. } = txn;
            if staged.is_empty() {
                return Ok(result);
            }

            let mut table = self.table.write();
            if let Some((key, _)) = reads.iter().find(|(key, version)| table.version_of(key) != **version) {
                debug!("Key {} changed during transaction, retrying", key);
                continue;
            }

            table.generation += 1;
            let version = table.generation;
            for (key, value) in staged {
                match value {
                    Some(value) => {
                        table.rows.insert(key, Row { version, value });
                    }
                    None => {
                        table.rows.remove(&key);
                    }
                }
            }
            drop(table);

            if let Some(writer) = &self.writer {
                writer.wake.notify_one();
            }
            return Ok(result);
        }
    }

    /// Waits until every commit made so far has been written to the snapshot
    /// file. In-memory stores return immediately.
    pub async fn flush(&self) -> AppResult<()> {
        let Some(writer) = &self.writer else {
            return Ok(());
        };

        let target = self.table.read().generation;
        writer.wake.notify_one();

        let mut persisted = writer.persisted.clone();
        let error = persisted
            .wait_for(|state| state.generation >= target)
            .await
            .map_err(|_| AppError::Storage("snapshot writer stopped".to_string()))?
            .error
            .clone();

        match error {
            Some(e) => Err(AppError::Storage(e)),
            None => Ok(()),
        }
    }
}

impl Drop for KvStore {
    fn drop(&mut self) {
        // lets the writer task observe the drop and exit
        if let Some(writer) = &self.writer {
            writer.wake.notify_one();
        }
    }
}

/// Writes one snapshot per wake-up; commits that land while a write is in
/// flight coalesce into the next one. Stops once the store is dropped.
async fn write_snapshots(
    table: Weak<RwLock<Table>>,
    path: PathBuf,
    wake: Arc<Notify>,
    persisted: watch::Sender<Persisted>,
) {
    loop {
        wake.notified().await;
        let Some(table) = table.upgrade() else {
            break;
        };
        let (generation, snapshot) = {
            let table = table.read();
            (table.generation, table.snapshot())
        };
        drop(table);

        let error = match snapshot {
            Ok(data) => save_snapshot(&path, data).await.err(),
            Err(e) => Some(e),
        };
        if let Some(e) = &error {
            warn!("Failed to write store snapshot {:?}: {}", path, e);
        }
        persisted.send_replace(Persisted {
            generation,
            error: error.map(|e| e.to_string()),
        });
    }
}

async fn save_snapshot(path: &Path, data: Vec<u8>) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    // Atomic write: write to temp file then rename
    let temp_file = path.with_extension("json.tmp");
    tokio::fs::write(&temp_file, data).await?;
    tokio::fs::rename(&temp_file, path).await?;
    Ok(())
}

/// Staged view handed to [`KvStore::transact`] closures. Records the version
/// of every committed key it reads so the commit can detect interference.
pub struct Txn<'a> {
    table: &'a RwLock<Table>,
    reads: HashMap<String, u64>,
    staged: BTreeMap<String, Option<Value>>,
}

impl Txn<'_> {
    fn current(&mut self, key: &str) -> Option<Value> {
        if let Some(staged) = self.staged.get(key) {
            return staged.clone();
        }
        let table = self.table.read();
        let row = table.rows.get(key);
        self.reads
            .entry(key.to_string())
            .or_insert_with(|| row.map_or(0, |row| row.version));
        row.map(|row| row.value.clone())
    }

    pub fn get<T: DeserializeOwned>(&mut self, key: &str) -> AppResult<Option<T>> {
        match self.current(key) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub fn exists(&mut self, key: &str) -> bool {
        self.current(key).is_some()
    }

    pub fn put<T: Serialize>(&mut self, key: &str, value: &T) -> AppResult<()> {
        let value = serde_json::to_value(value)?;
        self.staged.insert(key.to_string(), Some(value));
        Ok(())
    }

    pub fn delete(&mut self, key: &str) -> bool {
        let existed = self.exists(key);
        self.staged.insert(key.to_string(), None);
        existed
    }
}
