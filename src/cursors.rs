//! Persisted per-service consumer positions.
//!
//! Each durable registration is keyed by `(service, pattern)` and owns a
//! cursor into the shared event log. Cursors are stored one file per service
//! under the log directory, so independent services sharing a namespace never
//! touch each other's positions.

use crate::error::Result;
use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Stores and advances `(service, pattern)` cursors.
pub struct CursorStore {
    dir: PathBuf,

    /// Sidecar file carrying the advisory lock; in-process callers are
    /// additionally serialized by the mutex.
    lock_file: File,
    mutex: Mutex<()>,
}

impl CursorStore {
    /// Open or create the cursor store inside `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().join("cursors");
        fs::create_dir_all(&dir)?;

        let lock_file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(dir.join("cursors.lock"))?;

        Ok(Self {
            dir,
            lock_file,
            mutex: Mutex::new(()),
        })
    }

    /// Last persisted position for `(service, pattern)`.
    ///
    /// `None` means the pair has never been seen: a first-time durable
    /// subscriber starts from the oldest retained event, not from "now".
    pub fn get(&self, service: &str, pattern: &str) -> Result<Option<u64>> {
        let _guard = self.mutex.lock();
        self.lock_file.lock_shared()?;
        let result = self.load(service).map(|map| map.get(pattern).copied());
        let _ = fs2::FileExt::unlock(&self.lock_file);
        result
    }

    /// Persist an advanced position for `(service, pattern)`.
    ///
    /// Positions are monotonically non-decreasing; an attempt to move a
    /// cursor backwards is ignored.
    pub fn advance(&self, service: &str, pattern: &str, position: u64) -> Result<()> {
        let _guard = self.mutex.lock();
        self.lock_file.lock_exclusive()?;

        let result = (|| {
            let mut map = self.load(service)?;
            match map.get(pattern) {
                Some(&current) if current >= position => {
                    tracing::trace!(
                        service,
                        pattern,
                        current,
                        position,
                        "ignoring non-advancing cursor update"
                    );
                    return Ok(());
                }
                _ => {}
            }
            map.insert(pattern.to_string(), position);
            self.persist(service, &map)
        })();

        let _ = fs2::FileExt::unlock(&self.lock_file);
        result
    }

    /// Rewrite every persisted cursor through `map_offset`.
    ///
    /// Used after log compaction to translate old byte offsets into the
    /// rewritten log.
    pub fn remap(&self, map_offset: impl Fn(u64) -> u64) -> Result<()> {
        let _guard = self.mutex.lock();
        self.lock_file.lock_exclusive()?;

        let result = (|| {
            for entry in fs::read_dir(&self.dir)? {
                let path = entry?.path();
                let service = match path.file_stem().and_then(|s| s.to_str()) {
                    Some(service) if path.extension().is_some_and(|e| e == "json") => {
                        service.to_string()
                    }
                    _ => continue,
                };
                let mut map = self.load(&service)?;
                for position in map.values_mut() {
                    *position = map_offset(*position);
                }
                self.persist(&service, &map)?;
            }
            Ok(())
        })();

        let _ = fs2::FileExt::unlock(&self.lock_file);
        result
    }

    fn service_path(&self, service: &str) -> PathBuf {
        self.dir.join(format!("{service}.json"))
    }

    fn load(&self, service: &str) -> Result<HashMap<String, u64>> {
        let path = self.service_path(service);
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let bytes = fs::read(&path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Write-then-rename so a crash mid-write never loses the previous state.
    fn persist(&self, service: &str, map: &HashMap<String, u64>) -> Result<()> {
        let path = self.service_path(service);
        let tmp_path = path.with_extension("json.tmp");

        let bytes = serde_json::to_vec(map)?;
        {
            let mut tmp = File::create(&tmp_path)?;
            use std::io::Write;
            tmp.write_all(&bytes)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}
