//! Checkpointing and recovery.
//!
//! Two checkpoint modes. A **fold-over** raises the read-only boundary to
//! the tail and flushes, so the main log device itself holds the
//! checkpointed state. A **snapshot** copies the in-memory region to a
//! side file while the live log keeps mutating. Either way a metadata
//! record (uuid token, addresses, version, session cursors, file
//! references) is written with a write-then-rename so a crash can never
//! leave a half-readable current checkpoint.
//!
//! Recovery picks the newest readable token, restores the log thresholds,
//! loads the index snapshot if one exists, and otherwise rebuilds the
//! index by scanning the log; pages are parsed in parallel and applied in
//! address order. A corrupt metadata file is skipped with a warning and
//! its files are left on disk for inspection.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::Address;
use crate::common::{Result, SpinelError};
use crate::device::{read_blocking, write_blocking};
use crate::epoch::EpochManager;
use crate::hlog::HybridLog;
use crate::index::{KeyHash, MemIndex};
use crate::record::RecordView;

const METADATA_FORMAT_VERSION: u32 = 1;

/// Which checkpoint protocol produced a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointKind {
    FoldOver,
    Snapshot,
}

/// Continuation cursor for one client session, letting a resumed session
/// learn the last operation the checkpoint covers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCursor {
    pub session_id: String,
    pub serial: u64,
}

/// Everything needed to restore a store from a token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub token: Uuid,
    pub kind: CheckpointKind,
    pub version: u64,
    pub begin_address: u64,
    pub head_address: u64,
    pub read_only_address: u64,
    pub tail_address: u64,
    pub aof_tail: u64,
    pub sessions: Vec<SessionCursor>,
    pub index_file: Option<String>,
    pub snapshot_file: Option<String>,
    pub timestamp_ms: u64,
    pub format_version: u32,
}

/// Summary of on-disk checkpoint state.
#[derive(Debug, Clone)]
pub struct CheckpointStats {
    pub total_checkpoints: usize,
    pub total_size_bytes: u64,
    pub latest_token: Option<Uuid>,
    pub in_progress: bool,
}

/// Orchestrates checkpoints and recovery for one store.
pub struct CheckpointManager {
    dir: PathBuf,
    hlog: Arc<HybridLog>,
    index: Arc<MemIndex>,
    epoch: Arc<EpochManager>,
    in_progress: AtomicBool,
}

impl CheckpointManager {
    pub fn new(
        dir: PathBuf,
        hlog: Arc<HybridLog>,
        index: Arc<MemIndex>,
        epoch: Arc<EpochManager>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            hlog,
            index,
            epoch,
            in_progress: AtomicBool::new(false),
        })
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    fn meta_path(&self, token: Uuid) -> PathBuf {
        self.dir.join(format!("{}.meta", token))
    }

    /// Takes a checkpoint. `version` is the store version captured at the
    /// bump; operations that completed before it are guaranteed in.
    pub fn checkpoint(
        &self,
        kind: CheckpointKind,
        version: u64,
        aof_tail: u64,
        sessions: Vec<SessionCursor>,
    ) -> Result<CheckpointMetadata> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SpinelError::CheckpointFailed {
                message: "checkpoint already in progress".to_string(),
            });
        }
        let result = self.checkpoint_inner(kind, version, aof_tail, sessions);
        self.in_progress.store(false, Ordering::Release);
        result
    }

    fn checkpoint_inner(
        &self,
        kind: CheckpointKind,
        version: u64,
        aof_tail: u64,
        sessions: Vec<SessionCursor>,
    ) -> Result<CheckpointMetadata> {
        let token = Uuid::new_v4();
        let tail = self.hlog.tail_address();
        log::info!("starting {:?} checkpoint {} at tail {}", kind, token, tail);

        let snapshot_file = match kind {
            CheckpointKind::FoldOver => {
                // Freeze and flush the whole log suffix into the main
                // device; the log itself is the checkpoint payload.
                self.hlog.shift_read_only(tail);
                self.epoch.drain_blocking();
                self.hlog.flush_until(tail)?;
                None
            }
            CheckpointKind::Snapshot => {
                // Copy resident memory to a side file; the live log keeps
                // accepting updates.
                let name = format!("{}.snap", token);
                let from = self.hlog.head_address().max(self.hlog.begin_address());
                let bytes = self.copy_resident_region(from, tail)?;
                std::fs::write(self.dir.join(&name), bytes)?;
                Some(name)
            }
        };

        let index_file = format!("{}.index", token);
        let index_snapshot = self.index.snapshot();
        std::fs::write(
            self.dir.join(&index_file),
            bincode::serialize(&index_snapshot)?,
        )?;

        let metadata = CheckpointMetadata {
            token,
            kind,
            version,
            begin_address: self.hlog.begin_address().control(),
            head_address: self.hlog.head_address().control(),
            read_only_address: self.hlog.read_only_address().control(),
            tail_address: tail.control(),
            aof_tail,
            sessions,
            index_file: Some(index_file),
            snapshot_file,
            timestamp_ms: now_ms(),
            format_version: METADATA_FORMAT_VERSION,
        };
        self.write_metadata(&metadata)?;
        log::info!("checkpoint {} complete ({} index entries)", token, index_snapshot.len());
        Ok(metadata)
    }

    fn copy_resident_region(&self, from: Address, to: Address) -> Result<Vec<u8>> {
        let guard = self.epoch.enter();
        let geometry = *self.hlog.geometry();
        let mut out = Vec::with_capacity((to - from) as usize);
        let mut cursor = from;
        while cursor < to {
            let page_end = geometry.page_start(geometry.page(cursor) + 1);
            let chunk_end = to.min(page_end);
            let len = (chunk_end - cursor) as usize;
            let slice = self
                .hlog
                .get_slice(cursor, len, &guard)
                .ok_or_else(|| SpinelError::CheckpointFailed {
                    message: format!("page at {} not resident during snapshot", cursor),
                })?;
            out.extend_from_slice(slice);
            cursor = chunk_end;
        }
        Ok(out)
    }

    /// Single-writer metadata publish: temp file then atomic rename.
    fn write_metadata(&self, metadata: &CheckpointMetadata) -> Result<()> {
        let bytes = bincode::serialize(metadata)?;
        let tmp = self.dir.join(format!("{}.meta.tmp", metadata.token));
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, self.meta_path(metadata.token))?;
        Ok(())
    }

    fn load_metadata(&self, path: &PathBuf) -> Result<CheckpointMetadata> {
        let bytes = std::fs::read(path)?;
        let metadata: CheckpointMetadata = bincode::deserialize(&bytes)?;
        if metadata.format_version != METADATA_FORMAT_VERSION {
            return Err(SpinelError::RecoveryFailed {
                message: format!(
                    "unsupported checkpoint format {}",
                    metadata.format_version
                ),
            });
        }
        Ok(metadata)
    }

    /// All readable tokens, newest first.
    pub fn list(&self) -> Result<Vec<CheckpointMetadata>> {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map_or(true, |e| e != "meta") {
                continue;
            }
            match self.load_metadata(&path) {
                Ok(metadata) => found.push(metadata),
                Err(e) => {
                    log::warn!(
                        "skipping unreadable checkpoint metadata {}: {} (files left for inspection)",
                        path.display(),
                        e
                    );
                }
            }
        }
        found.sort_by(|a, b| {
            (b.timestamp_ms, b.tail_address).cmp(&(a.timestamp_ms, a.tail_address))
        });
        Ok(found)
    }

    /// Deletes a token's files.
    pub fn purge(&self, token: Uuid) -> Result<()> {
        for name in [
            format!("{}.meta", token),
            format!("{}.index", token),
            format!("{}.snap", token),
        ] {
            let path = self.dir.join(name);
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        log::debug!("purged checkpoint {}", token);
        Ok(())
    }

    /// Keeps the `keep_count` newest tokens and purges the rest.
    pub fn cleanup(&self, keep_count: usize) -> Result<()> {
        let tokens = self.list()?;
        for metadata in tokens.iter().skip(keep_count) {
            self.purge(metadata.token)?;
        }
        Ok(())
    }

    pub fn stats(&self) -> Result<CheckpointStats> {
        let tokens = self.list()?;
        let mut total_size = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            total_size += entry?.metadata()?.len();
        }
        Ok(CheckpointStats {
            total_checkpoints: tokens.len(),
            total_size_bytes: total_size,
            latest_token: tokens.first().map(|m| m.token),
            in_progress: self.is_in_progress(),
        })
    }

    /// Restores log and index from the newest readable token. Returns the
    /// metadata used, or `None` when no checkpoint exists.
    pub fn recover_latest(&self) -> Result<Option<CheckpointMetadata>> {
        let candidates = self.list()?;
        for metadata in candidates {
            match self.recover_from(&metadata) {
                Ok(()) => {
                    log::info!(
                        "recovered from checkpoint {} (version {})",
                        metadata.token,
                        metadata.version
                    );
                    return Ok(Some(metadata));
                }
                Err(e) => {
                    log::warn!(
                        "recovery from checkpoint {} failed, trying older token: {}",
                        metadata.token,
                        e
                    );
                }
            }
        }
        Ok(None)
    }

    fn recover_from(&self, metadata: &CheckpointMetadata) -> Result<()> {
        let begin = Address::from_control(metadata.begin_address);
        let tail = Address::from_control(metadata.tail_address);

        if let Some(snapshot_file) = &metadata.snapshot_file {
            // Re-seed the main device from the snapshot copy so reads of
            // the recovered suffix resolve.
            let bytes = std::fs::read(self.dir.join(snapshot_file))?;
            let from = metadata
                .head_address
                .max(metadata.begin_address);
            write_blocking(self.hlog.device().as_ref(), from, &bytes)?;
            self.hlog.device().flush()?;
        }

        self.hlog.restore(begin, tail)?;

        let loaded = match &metadata.index_file {
            Some(index_file) => match self.try_load_index(index_file) {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("index snapshot unusable, rebuilding from log: {}", e);
                    false
                }
            },
            None => false,
        };
        if !loaded {
            self.rebuild_index(begin, tail)?;
        }
        Ok(())
    }

    fn try_load_index(&self, index_file: &str) -> Result<()> {
        let bytes = std::fs::read(self.dir.join(index_file))?;
        let entries: Vec<(u64, u64)> = bincode::deserialize(&bytes)?;
        self.index.restore(&entries)?;
        Ok(())
    }

    /// Rebuilds the hash index by scanning the on-device log `[begin,
    /// tail)`. Pages parse in parallel; entries apply in address order so
    /// the newest version of each key wins.
    fn rebuild_index(&self, begin: Address, tail: Address) -> Result<()> {
        if tail <= begin {
            return Ok(());
        }
        let geometry = *self.hlog.geometry();
        let device = self.hlog.device().clone();
        let first_page = geometry.page(begin);
        let last_page = geometry.page(Address::from_control(tail.control() - 1));

        let pages: Vec<u64> = (first_page..=last_page).collect();
        let parsed: Vec<Vec<(Address, KeyHash)>> = pages
            .par_iter()
            .map(|&page| {
                let page_start = geometry.page_start(page);
                let bytes =
                    read_blocking(device.as_ref(), page_start.control(), geometry.page_size())?;
                let mut entries = Vec::new();
                let mut offset = if page == geometry.page(begin) {
                    geometry.offset(begin) as usize
                } else {
                    0
                };
                while (offset as u64) < geometry.page_size() as u64 {
                    let address = page_start + offset as u64;
                    if address >= tail {
                        break;
                    }
                    match RecordView::parse(&bytes[offset..])? {
                        None => break,
                        Some(view) => {
                            if view.info.filler() {
                                break;
                            }
                            if !view.info.sealed() {
                                entries.push((address, KeyHash::of(view.key)));
                            }
                            offset += view.len as usize;
                        }
                    }
                }
                Ok(entries)
            })
            .collect::<Result<_>>()?;

        let mut count = 0u64;
        for page_entries in parsed {
            for (address, hash) in page_entries {
                let context = self.index.find_or_create_entry(hash)?;
                if !self.index.try_update_entry(&context, address) {
                    return Err(SpinelError::RecoveryFailed {
                        message: "index rebuild raced with a writer".to_string(),
                    });
                }
                count += 1;
            }
        }
        log::info!("rebuilt index from log: {} records applied", count);
        Ok(())
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
