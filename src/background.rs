//! Background task management.
//!
//! Interval-driven maintenance on top of a running store: shifting the
//! log thresholds when regions outgrow their budgets, periodic fold-over
//! checkpoints, AOF group commit, and replica streaming. Tasks check a
//! shared running flag every tick and are aborted on stop, so shutdown
//! never waits out an interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::common::{Config, Result, SpinelError};

/// The store surface the background tasks drive. Implemented by
/// `SpinelStore` for any `StoreFunctions`, keeping this module free of
/// the store's type parameter.
pub trait EngineHandle: Send + Sync + 'static {
    /// Takes a fold-over checkpoint.
    fn run_checkpoint(&self) -> Result<()>;

    /// Shifts log thresholds according to the configured region budgets.
    fn maintain_log(&self);

    /// Commits the AOF group.
    fn commit_aof(&self) -> Result<()>;

    /// Pushes committed AOF bytes to replicas; returns bytes streamed.
    fn stream_replicas(&self) -> usize;
}

/// Background task manager for automatic maintenance operations.
pub struct BackgroundTaskManager {
    running: Arc<AtomicBool>,
    config: Config,
    engine: Arc<dyn EngineHandle>,
    task_handles: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl BackgroundTaskManager {
    pub fn new(config: Config, engine: Arc<dyn EngineHandle>) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            config,
            engine,
            task_handles: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Starts all enabled tasks. Must be called from within a tokio
    /// runtime.
    pub fn start(&self) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SpinelError::Internal {
                message: "background tasks are already running".to_string(),
            });
        }
        let mut handles = self.task_handles.lock();

        if self.config.enable_maintenance {
            handles.push(self.spawn_maintenance_task());
        }
        if self.config.enable_checkpointing {
            handles.push(self.spawn_checkpoint_task());
        }
        if self.config.aof.enabled {
            handles.push(self.spawn_aof_task());
        }

        log::info!("started {} background tasks", handles.len());
        Ok(())
    }

    /// Stops all tasks, aborting any mid-sleep.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let handles = {
            let mut handles = self.task_handles.lock();
            std::mem::take(&mut *handles)
        };
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
        log::info!("all background tasks stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn spawn_maintenance_task(&self) -> tokio::task::JoinHandle<()> {
        let running = self.running.clone();
        let engine = self.engine.clone();
        let interval_ms = self.config.maintenance_interval_ms;

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            log::info!("log maintenance task started ({}ms)", interval_ms);

            while running.load(Ordering::Acquire) {
                ticker.tick().await;
                if !running.load(Ordering::Acquire) {
                    break;
                }
                engine.maintain_log();
            }
            log::info!("log maintenance task stopped");
        })
    }

    fn spawn_checkpoint_task(&self) -> tokio::task::JoinHandle<()> {
        let running = self.running.clone();
        let engine = self.engine.clone();
        let interval_ms = self.config.checkpoint_interval_ms;

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            log::info!("checkpoint task started ({}ms)", interval_ms);

            while running.load(Ordering::Acquire) {
                ticker.tick().await;
                if !running.load(Ordering::Acquire) {
                    break;
                }
                match engine.run_checkpoint() {
                    Ok(()) => log::debug!("background checkpoint completed"),
                    Err(e) if e.is_recoverable() => {
                        log::warn!("background checkpoint failed, will retry: {}", e)
                    }
                    Err(e) => {
                        log::error!("background checkpoint failed fatally: {}", e);
                        break;
                    }
                }
            }
            log::info!("checkpoint task stopped");
        })
    }

    fn spawn_aof_task(&self) -> tokio::task::JoinHandle<()> {
        let running = self.running.clone();
        let engine = self.engine.clone();
        let interval_ms = self.config.aof.commit_interval_ms;

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            log::info!("aof commit task started ({}ms)", interval_ms);

            while running.load(Ordering::Acquire) {
                ticker.tick().await;
                if !running.load(Ordering::Acquire) {
                    break;
                }
                if let Err(e) = engine.commit_aof() {
                    log::warn!("aof group commit failed: {}", e);
                    continue;
                }
                let streamed = engine.stream_replicas();
                if streamed > 0 {
                    log::trace!("streamed {} AOF bytes to replicas", streamed);
                }
            }
            log::info!("aof commit task stopped");
        })
    }

    pub fn get_stats(&self) -> BackgroundTaskStats {
        BackgroundTaskStats {
            is_running: self.is_running(),
            maintenance_enabled: self.config.enable_maintenance,
            checkpoint_enabled: self.config.enable_checkpointing,
            aof_enabled: self.config.aof.enabled,
            maintenance_interval_ms: self.config.maintenance_interval_ms,
            checkpoint_interval_ms: self.config.checkpoint_interval_ms,
            active_task_count: self.task_handles.lock().len(),
        }
    }
}

impl Drop for BackgroundTaskManager {
    fn drop(&mut self) {
        if self.running.swap(false, Ordering::AcqRel) {
            for handle in self.task_handles.lock().drain(..) {
                handle.abort();
            }
        }
    }
}

/// Statistics about background task state.
#[derive(Debug, Clone)]
pub struct BackgroundTaskStats {
    pub is_running: bool,
    pub maintenance_enabled: bool,
    pub checkpoint_enabled: bool,
    pub aof_enabled: bool,
    pub maintenance_interval_ms: u64,
    pub checkpoint_interval_ms: u64,
    pub active_task_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{RawStoreFunctions, SpinelStore};
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            storage_dir: dir.to_string_lossy().to_string(),
            memory_size: 16 * 1024,
            page_size: 1024,
            index_buckets: 64,
            segment_size: 4096,
            max_key_size: 64,
            max_value_size: 512,
            enable_maintenance: true,
            maintenance_interval_ms: 20,
            enable_checkpointing: true,
            checkpoint_interval_ms: 100,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_start_stop() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let store = SpinelStore::open(config.clone(), RawStoreFunctions).unwrap();
        let manager = BackgroundTaskManager::new(config, store);

        assert!(!manager.is_running());
        manager.start().unwrap();
        assert!(manager.is_running());
        assert!(manager.start().is_err());

        manager.stop().await.unwrap();
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_background_checkpoint_runs() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let store = SpinelStore::open(config.clone(), RawStoreFunctions).unwrap();
        store.upsert(b"k", b"v").unwrap();

        let manager = BackgroundTaskManager::new(config, store.clone());
        manager.start().unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        manager.stop().await.unwrap();

        assert!(!store.checkpoints().list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_maintenance_bounds_mutable_region() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.mutable_fraction = 0.25;
        config.enable_checkpointing = false;
        let store = SpinelStore::open(config.clone(), RawStoreFunctions).unwrap();

        let manager = BackgroundTaskManager::new(config.clone(), store.clone());
        manager.start().unwrap();

        for i in 0..120u32 {
            store
                .upsert(format!("key{}", i).as_bytes(), &[0u8; 64])
                .unwrap();
            if i % 20 == 0 {
                tokio::time::sleep(Duration::from_millis(30)).await;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.stop().await.unwrap();

        let stats = store.stats();
        let budget = (config.memory_size as f64 * config.mutable_fraction) as u64;
        assert!(
            stats.mutable_bytes <= budget + config.page_size as u64,
            "mutable region {} exceeds budget {}",
            stats.mutable_bytes,
            budget
        );
    }

    #[tokio::test]
    async fn test_stats() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let store = SpinelStore::open(config.clone(), RawStoreFunctions).unwrap();
        let manager = BackgroundTaskManager::new(config, store);

        let before = manager.get_stats();
        assert!(!before.is_running);
        assert_eq!(before.active_task_count, 0);

        manager.start().unwrap();
        let after = manager.get_stats();
        assert!(after.is_running);
        assert!(after.checkpoint_enabled);
        assert_eq!(after.active_task_count, 2);
        manager.stop().await.unwrap();
    }
}
