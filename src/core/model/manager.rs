use super::{HandleId, LoadConfig, ModelState};
use crate::core::events::{Event, EventBus};
use crate::core::runtime::{LoaderRegistry, Runtime};
use crate::error::{CoreError, Result};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Runtime context shared between a handle and the worker currently decoding
/// on it. The mutex is fair, so queued workers are served in arrival order.
pub type SharedRuntime = Arc<tokio::sync::Mutex<Box<dyn Runtime>>>;

const HEADER_LEN: usize = 8;

struct ModelSlot {
    id: HandleId,
    path: PathBuf,
    config: LoadConfig,
    inner: Mutex<SlotInner>,
}

struct SlotInner {
    state: ModelState,
    active: usize,
    runtime: Option<SharedRuntime>,
    fault: Option<String>,
    /// Bytes charged against the memory budget while this slot holds a model.
    reserved: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandleInfo {
    pub handle_id: HandleId,
    pub path: PathBuf,
    pub state: ModelState,
    pub active_sessions: usize,
    pub fault: Option<String>,
}

/// Owns every loaded model and serializes load, unload and generation
/// against each other.
pub struct ModelManager {
    loaders: Arc<LoaderRegistry>,
    models_dir: PathBuf,
    memory_budget: Option<u64>,
    reserved: Mutex<u64>,
    events: Arc<EventBus>,
    handles: RwLock<HashMap<HandleId, Arc<ModelSlot>>>,
    next_id: AtomicU64,
}

impl ModelManager {
    pub fn new(loaders: Arc<LoaderRegistry>, models_dir: impl Into<PathBuf>) -> Self {
        Self {
            loaders,
            models_dir: models_dir.into(),
            memory_budget: None,
            reserved: Mutex::new(0),
            events: Arc::new(EventBus::new()),
            handles: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn memory_budget(mut self, bytes: Option<u64>) -> Self {
        self.memory_budget = bytes;
        self
    }

    pub fn events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn resolve_path(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.models_dir.join(path)
        }
    }

    /// Loads a model, blocking on disk I/O.
    ///
    /// Each (path, config) pair owns at most one handle. A `Ready` handle is
    /// returned as is; an unloaded or faulted one is loaded again under its
    /// existing id. A pair that is still loading answers `Busy`.
    pub fn load(&self, path: impl AsRef<Path>, config: LoadConfig) -> Result<HandleId> {
        config.validate()?;
        let path = self.resolve_path(path);

        let (slot, previous) = {
            let mut handles = self.handles.write();
            let existing = handles.values().find(|s| s.path == path && s.config == config).cloned();
            match existing {
                Some(slot) => {
                    let previous = {
                        let mut inner = slot.inner.lock();
                        match inner.state {
                            ModelState::Ready => None,
                            ModelState::Loading | ModelState::Unloading => {
                                return Err(CoreError::Busy { handle: slot.id, active: inner.active });
                            }
                            state => {
                                inner.state = ModelState::Loading;
                                Some(state)
                            }
                        }
                    };
                    let Some(previous) = previous else {
                        tracing::debug!("Reusing handle {} for {}", slot.id, path.display());
                        return Ok(slot.id);
                    };
                    tracing::debug!("Loading {} again under handle {}", path.display(), slot.id);
                    (slot, Some(previous))
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                    let slot = Arc::new(ModelSlot {
                        id,
                        path: path.clone(),
                        config,
                        inner: Mutex::new(SlotInner {
                            state: ModelState::Loading,
                            active: 0,
                            runtime: None,
                            fault: None,
                            reserved: 0,
                        }),
                    });
                    handles.insert(id, Arc::clone(&slot));
                    (slot, None)
                }
            }
        };

        match self.instantiate(&slot) {
            Ok(()) => Ok(slot.id),
            Err(e) => {
                match previous {
                    Some(state) => slot.inner.lock().state = state,
                    None => {
                        self.handles.write().remove(&slot.id);
                    }
                }
                Err(e)
            }
        }
    }

    /// Re-creates the runtime of a faulted or unloaded handle under the same id.
    pub fn reload(&self, handle: HandleId) -> Result<()> {
        let slot = self.slot(handle)?;
        let previous = {
            let mut inner = slot.inner.lock();
            match inner.state {
                ModelState::Ready => return Ok(()),
                ModelState::Loading | ModelState::Unloading => {
                    return Err(CoreError::Busy { handle, active: inner.active });
                }
                state => {
                    inner.state = ModelState::Loading;
                    state
                }
            }
        };

        self.instantiate(&slot).inspect_err(|_| {
            slot.inner.lock().state = previous;
        })
    }

    fn instantiate(&self, slot: &ModelSlot) -> Result<()> {
        let path = &slot.path;
        let started = Instant::now();
        self.events.publish(Event::ModelLoading { handle: slot.id, path: path.clone() });

        let mut header = [0u8; HEADER_LEN];
        let mut file = std::fs::File::open(path).map_err(|e| CoreError::model_load(path, e))?;
        file.read_exact(&mut header)
            .map_err(|_| CoreError::model_load(path, "file too short to be a model"))?;
        drop(file);

        let loader = self
            .loaders
            .find(&header)
            .ok_or_else(|| CoreError::model_load(path, "unrecognized model format"))?;

        // A reloaded slot gives back what its previous runtime was charged.
        self.release(slot);
        if let Some(budget) = self.memory_budget {
            let needed = loader.estimate_memory(path, &slot.config)?;
            self.reserve(budget, needed)?;
            slot.inner.lock().reserved = needed;
        }

        let runtime = loader.load(path, &slot.config).inspect_err(|_| self.release(slot))?;

        {
            let mut inner = slot.inner.lock();
            inner.runtime = Some(Arc::new(tokio::sync::Mutex::new(runtime)));
            inner.state = ModelState::Ready;
            inner.fault = None;
        }

        tracing::info!(
            "Model handle {} ready ({} loader, {:.2?})",
            slot.id,
            loader.name(),
            started.elapsed()
        );
        self.events.publish(Event::ModelLoaded { handle: slot.id, path: path.clone() });
        Ok(())
    }

    fn reserve(&self, budget: u64, needed: u64) -> Result<()> {
        let mut used = self.reserved.lock();
        if used.saturating_add(needed) > budget {
            return Err(CoreError::ResourceExhausted(format!(
                "model needs about {} MiB, {} MiB of the {} MiB budget is in use",
                needed >> 20,
                *used >> 20,
                budget >> 20
            )));
        }
        *used += needed;
        Ok(())
    }

    fn release(&self, slot: &ModelSlot) {
        let freed = std::mem::take(&mut slot.inner.lock().reserved);
        if freed > 0 {
            let mut used = self.reserved.lock();
            *used = used.saturating_sub(freed);
        }
    }

    /// Bytes currently charged against the memory budget.
    pub fn reserved_memory(&self) -> u64 {
        *self.reserved.lock()
    }

    pub fn ensure_ready(&self, handle: HandleId) -> Result<()> {
        let slot = self.slot(handle)?;
        let inner = slot.inner.lock();
        check_ready(handle, inner.state)
    }

    pub fn is_ready(&self, handle: HandleId) -> bool {
        self.ensure_ready(handle).is_ok()
    }

    pub fn state(&self, handle: HandleId) -> Option<ModelState> {
        self.handles.read().get(&handle).map(|s| s.inner.lock().state)
    }

    /// Takes a reference on a Ready handle for the duration of one generation.
    pub fn lease(&self, handle: HandleId) -> Result<ModelLease> {
        let slot = self.slot(handle)?;
        let runtime = {
            let mut inner = slot.inner.lock();
            check_ready(handle, inner.state)?;
            let runtime = inner
                .runtime
                .clone()
                .ok_or(CoreError::InvalidHandle { handle, reason: "runtime missing" })?;
            inner.active += 1;
            runtime
        };

        Ok(ModelLease {
            slot,
            runtime,
            events: Arc::clone(&self.events),
        })
    }

    pub fn unload(&self, handle: HandleId) -> Result<()> {
        let slot = self.slot(handle)?;
        let runtime = {
            let mut inner = slot.inner.lock();
            match inner.state {
                ModelState::Ready | ModelState::Error => {}
                ModelState::Unloaded | ModelState::Unloading => {
                    return Err(CoreError::InvalidHandle { handle, reason: "already unloaded" });
                }
                ModelState::Loading => {
                    return Err(CoreError::Busy { handle, active: inner.active });
                }
            }
            if inner.active > 0 {
                return Err(CoreError::Busy { handle, active: inner.active });
            }
            inner.state = ModelState::Unloading;
            inner.runtime.take()
        };

        drop(runtime);
        self.release(&slot);
        slot.inner.lock().state = ModelState::Unloaded;

        tracing::info!("Model handle {} unloaded", handle);
        self.events.publish(Event::ModelUnloaded { handle });
        Ok(())
    }

    /// Unloads every idle handle. Handles with active sessions are left alone
    /// and counted in the returned tuple as `(unloaded, busy)`.
    pub fn shutdown(&self) -> (usize, usize) {
        let ids: Vec<HandleId> = self.handles.read().keys().copied().collect();
        let mut unloaded = 0;
        let mut busy = 0;
        for id in ids {
            match self.unload(id) {
                Ok(()) => unloaded += 1,
                Err(CoreError::Busy { .. }) => {
                    tracing::warn!("Handle {} still generating, skipped during shutdown", id);
                    busy += 1;
                }
                Err(_) => {}
            }
        }
        (unloaded, busy)
    }

    pub fn handles(&self) -> Vec<HandleInfo> {
        let mut infos: Vec<HandleInfo> = self
            .handles
            .read()
            .values()
            .map(|s| {
                let inner = s.inner.lock();
                HandleInfo {
                    handle_id: s.id,
                    path: s.path.clone(),
                    state: inner.state,
                    active_sessions: inner.active,
                    fault: inner.fault.clone(),
                }
            })
            .collect();
        infos.sort_by_key(|i| i.handle_id);
        infos
    }

    fn slot(&self, handle: HandleId) -> Result<Arc<ModelSlot>> {
        self.handles
            .read()
            .get(&handle)
            .cloned()
            .ok_or(CoreError::InvalidHandle { handle, reason: "unknown handle" })
    }
}

fn check_ready(handle: HandleId, state: ModelState) -> Result<()> {
    let reason = match state {
        ModelState::Ready => return Ok(()),
        ModelState::Loading => "still loading",
        ModelState::Unloading | ModelState::Unloaded => "model was unloaded",
        ModelState::Error => "model faulted, reload required",
    };
    Err(CoreError::InvalidHandle { handle, reason })
}

/// A generation's reference on a model handle. While any lease is alive the
/// handle cannot be unloaded.
pub struct ModelLease {
    slot: Arc<ModelSlot>,
    runtime: SharedRuntime,
    events: Arc<EventBus>,
}

impl ModelLease {
    pub fn handle(&self) -> HandleId {
        self.slot.id
    }

    pub fn config(&self) -> &LoadConfig {
        &self.slot.config
    }

    pub fn runtime(&self) -> &SharedRuntime {
        &self.runtime
    }

    /// Fails when the handle left `Ready` or was reloaded after this lease
    /// was taken. Workers check it once they own the runtime.
    pub fn ensure_ready(&self) -> Result<()> {
        let inner = self.slot.inner.lock();
        check_ready(self.slot.id, inner.state)?;
        match &inner.runtime {
            Some(current) if Arc::ptr_eq(current, &self.runtime) => Ok(()),
            _ => Err(CoreError::InvalidHandle { handle: self.slot.id, reason: "model was reloaded" }),
        }
    }

    /// Moves the handle to `Error`; it stays unusable until reloaded.
    pub fn mark_faulted(&self, reason: &str) {
        {
            let mut inner = self.slot.inner.lock();
            inner.state = ModelState::Error;
            inner.fault = Some(reason.to_string());
        }
        tracing::warn!("Model handle {} faulted: {}", self.slot.id, reason);
        self.events.publish(Event::ModelFaulted {
            handle: self.slot.id,
            reason: reason.to_string(),
        });
    }
}

impl Drop for ModelLease {
    fn drop(&mut self) {
        let mut inner = self.slot.inner.lock();
        inner.active = inner.active.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::runtime::fake::{model_file, ScriptedLoader};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn manager() -> (ModelManager, Arc<std::sync::atomic::AtomicUsize>) {
        let registry = LoaderRegistry::new();
        let loader = ScriptedLoader::new(&["a", "b"]);
        let loads = Arc::clone(&loader.loads);
        registry.register(loader);
        (ModelManager::new(Arc::new(registry), std::env::temp_dir()), loads)
    }

    #[test]
    fn test_load_then_unload_round_trip() {
        let (manager, _) = manager();
        let path = model_file("model.bin");

        let handle = manager.load(&path, LoadConfig::default().context_length(2048)).unwrap();
        assert_eq!(manager.state(handle), Some(ModelState::Ready));
        manager.ensure_ready(handle).unwrap();

        manager.unload(handle).unwrap();
        assert_eq!(manager.state(handle), Some(ModelState::Unloaded));
        assert!(matches!(manager.ensure_ready(handle), Err(CoreError::InvalidHandle { .. })));
        assert!(matches!(manager.unload(handle), Err(CoreError::InvalidHandle { .. })));
    }

    #[test]
    fn test_missing_file_is_model_load_error() {
        let (manager, _) = manager();
        let err = manager.load("/nonexistent/model.bin", LoadConfig::default()).unwrap_err();
        assert_eq!(err.code(), "MODEL_LOAD_ERROR");
        assert!(manager.handles().is_empty());
    }

    #[test]
    fn test_unknown_format_is_model_load_error() {
        let (manager, _) = manager();
        let path = model_file("weights.bin");
        std::fs::write(&path, b"NOTAMODEL-AT-ALL").unwrap();
        let err = manager.load(&path, LoadConfig::default()).unwrap_err();
        assert!(err.to_string().contains("unrecognized model format"));
    }

    #[test]
    fn test_memory_budget_exceeded() {
        let (manager, _) = manager();
        let manager = manager.memory_budget(Some(4));
        let path = model_file("model.bin");
        let err = manager.load(&path, LoadConfig::default()).unwrap_err();
        assert_eq!(err.code(), "RESOURCE_EXHAUSTED");
    }

    #[test]
    fn test_invalid_config_rejected_before_io() {
        let (manager, loads) = manager();
        let err = manager
            .load("/nonexistent/model.bin", LoadConfig::default().context_length(0))
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!(loads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_same_path_reuses_live_handle() {
        let (manager, loads) = manager();
        let path = model_file("model.bin");
        let a = manager.load(&path, LoadConfig::default()).unwrap();
        let b = manager.load(&path, LoadConfig::default()).unwrap();
        assert_eq!(a, b);
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unload_while_leased_is_busy() {
        let (manager, _) = manager();
        let handle = manager.load(model_file("model.bin"), LoadConfig::default()).unwrap();

        let lease = manager.lease(handle).unwrap();
        assert!(matches!(manager.unload(handle), Err(CoreError::Busy { active: 1, .. })));

        drop(lease);
        manager.unload(handle).unwrap();
    }

    #[test]
    fn test_faulted_handle_requires_reload() {
        let (manager, loads) = manager();
        let handle = manager.load(model_file("model.bin"), LoadConfig::default()).unwrap();

        let lease = manager.lease(handle).unwrap();
        lease.mark_faulted("device lost");
        drop(lease);

        assert_eq!(manager.state(handle), Some(ModelState::Error));
        assert!(manager.lease(handle).is_err());

        manager.reload(handle).unwrap();
        assert_eq!(manager.state(handle), Some(ModelState::Ready));
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_lease_sees_fault_raised_by_another_lease() {
        let (manager, _) = manager();
        let handle = manager.load(model_file("model.bin"), LoadConfig::default()).unwrap();

        let first = manager.lease(handle).unwrap();
        let second = manager.lease(handle).unwrap();
        second.ensure_ready().unwrap();

        first.mark_faulted("device lost");
        assert!(matches!(second.ensure_ready(), Err(CoreError::InvalidHandle { .. })));

        drop(first);
        drop(second);
        let stale = manager.lease(handle);
        assert!(stale.is_err());
    }

    #[test]
    fn test_lease_taken_before_reload_is_stale() {
        let (manager, _) = manager();
        let handle = manager.load(model_file("model.bin"), LoadConfig::default()).unwrap();

        let old = manager.lease(handle).unwrap();
        let other = manager.lease(handle).unwrap();
        other.mark_faulted("device lost");
        drop(other);
        manager.reload(handle).unwrap();

        let err = old.ensure_ready().unwrap_err();
        assert!(err.to_string().contains("reloaded"));
        manager.lease(handle).unwrap().ensure_ready().unwrap();
    }

    #[test]
    fn test_load_racing_a_failing_load_gets_no_handle() {
        let registry = LoaderRegistry::new();
        registry.register(ScriptedLoader::new(&["a"]).failing_load(Duration::from_millis(200)));
        let manager = Arc::new(ModelManager::new(Arc::new(registry), std::env::temp_dir()));
        let path = model_file("model.bin");

        let first = {
            let manager = Arc::clone(&manager);
            let path = path.clone();
            std::thread::spawn(move || manager.load(&path, LoadConfig::default()))
        };
        while manager.handles().is_empty() {
            std::thread::sleep(Duration::from_millis(1));
        }

        let second = manager.load(&path, LoadConfig::default());
        assert!(matches!(second, Err(CoreError::Busy { .. })));

        let first = first.join().unwrap();
        assert_eq!(first.unwrap_err().code(), "MODEL_LOAD_ERROR");
        assert!(manager.handles().is_empty());
    }

    #[test]
    fn test_memory_budget_counts_resident_models() {
        let (manager, _) = manager();
        let a = model_file("a.bin");
        let size = std::fs::metadata(&a).unwrap().len();
        let manager = manager.memory_budget(Some(size * 2 - 1));

        let first = manager.load(&a, LoadConfig::default()).unwrap();
        assert_eq!(manager.reserved_memory(), size);

        let err = manager.load(model_file("b.bin"), LoadConfig::default()).unwrap_err();
        assert_eq!(err.code(), "RESOURCE_EXHAUSTED");
        assert_eq!(manager.reserved_memory(), size);

        manager.unload(first).unwrap();
        assert_eq!(manager.reserved_memory(), 0);
        manager.load(model_file("b.bin"), LoadConfig::default()).unwrap();
    }

    #[test]
    fn test_reload_does_not_double_charge_budget() {
        let (manager, _) = manager();
        let path = model_file("model.bin");
        let size = std::fs::metadata(&path).unwrap().len();
        let manager = manager.memory_budget(Some(size));

        let handle = manager.load(&path, LoadConfig::default()).unwrap();
        let lease = manager.lease(handle).unwrap();
        lease.mark_faulted("device lost");
        drop(lease);

        manager.reload(handle).unwrap();
        assert_eq!(manager.reserved_memory(), size);
    }

    #[test]
    fn test_load_unload_cycles_reuse_one_handle() {
        let (manager, loads) = manager();
        let path = model_file("model.bin");

        let first = manager.load(&path, LoadConfig::default()).unwrap();
        manager.unload(first).unwrap();
        for _ in 0..100 {
            let handle = manager.load(&path, LoadConfig::default()).unwrap();
            assert_eq!(handle, first);
            assert_eq!(manager.state(handle), Some(ModelState::Ready));
            manager.unload(handle).unwrap();
        }

        assert_eq!(manager.handles().len(), 1);
        assert_eq!(loads.load(Ordering::SeqCst), 101);
    }

    #[test]
    fn test_failed_reload_of_unloaded_handle_keeps_it_unloaded() {
        let (manager, _) = manager();
        let path = model_file("model.bin");
        let handle = manager.load(&path, LoadConfig::default()).unwrap();
        manager.unload(handle).unwrap();

        std::fs::write(&path, b"NOTAMODEL-AT-ALL").unwrap();
        assert!(manager.load(&path, LoadConfig::default()).is_err());
        assert_eq!(manager.state(handle), Some(ModelState::Unloaded));
        assert_eq!(manager.handles().len(), 1);
    }

    #[test]
    fn test_relative_paths_resolve_against_models_dir() {
        let (manager, _) = manager();
        assert_eq!(manager.resolve_path("model.bin"), std::env::temp_dir().join("model.bin"));
        assert_eq!(manager.resolve_path("/abs/model.bin"), PathBuf::from("/abs/model.bin"));
    }

    #[test]
    fn test_shutdown_skips_busy_handles() {
        let (manager, _) = manager();
        let idle = manager.load(model_file("a.bin"), LoadConfig::default()).unwrap();
        let busy = manager.load(model_file("b.bin"), LoadConfig::default()).unwrap();
        let _lease = manager.lease(busy).unwrap();

        assert_eq!(manager.shutdown(), (1, 1));
        assert_eq!(manager.state(idle), Some(ModelState::Unloaded));
        assert_eq!(manager.state(busy), Some(ModelState::Ready));
    }
}
