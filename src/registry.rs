mod worker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::backend::{EngineFactory, EngineOptions};
use crate::correlator::{PendingResponse, RequestCorrelator};
use crate::errors::{BridgeError, CreationReason, Result};
use crate::{Handle, RequestId};

use self::worker::{spawn_worker, GenerationJob};

/// One live model: its construction parameters and the queue feeding the
/// worker that owns the engine.
pub struct ModelInstance {
    handle: Handle,
    options: EngineOptions,
    jobs: Mutex<Option<Sender<GenerationJob>>>,
    cancel: Arc<AtomicBool>,
    created_at: Instant,
}

impl ModelInstance {
    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_released(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn submit(&self, job: GenerationJob) -> bool {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        match jobs.as_ref() {
            Some(tx) => tx.send(job).is_ok(),
            None => false,
        }
    }

    fn shutdown(&self) {
        let sender = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.cancel.store(true, Ordering::SeqCst);
        drop(sender);
    }
}

struct RegistryState {
    next_handle: u64,
    models: HashMap<Handle, Arc<ModelInstance>>,
}

/// Owner of every live handle. The counter only advances when an engine
/// was actually constructed, and handles are never reused.
pub struct HandleRegistry {
    factory: Arc<dyn EngineFactory>,
    correlator: Arc<RequestCorrelator>,
    state: Mutex<RegistryState>,
}

impl HandleRegistry {
    pub fn new(factory: Arc<dyn EngineFactory>, correlator: Arc<RequestCorrelator>) -> Self {
        Self {
            factory,
            correlator,
            state: Mutex::new(RegistryState {
                next_handle: 1,
                models: HashMap::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Builds an engine and registers it. Blocks for as long as the engine
    /// takes to load.
    pub fn create(&self, options: EngineOptions) -> Result<Handle> {
        options.validate()?;

        let started = Instant::now();
        let engine = self.factory.create(&options).map_err(|err| {
            tracing::warn!(
                model = %options.model_path,
                reason = %err.reason,
                error = %err.message,
                "engine construction failed"
            );
            BridgeError::from(err)
        })?;

        let mut state = self.state();
        let handle = Handle(state.next_handle);
        let cancel = Arc::new(AtomicBool::new(false));
        let tx = spawn_worker(handle, engine, self.correlator.clone(), cancel.clone()).map_err(
            |e| {
                BridgeError::creation(
                    CreationReason::Unknown,
                    format!("Failed to spawn worker for handle {}: {}", handle, e),
                )
            },
        )?;

        state.next_handle += 1;
        state.models.insert(
            handle,
            Arc::new(ModelInstance {
                handle,
                options,
                jobs: Mutex::new(Some(tx)),
                cancel,
                created_at: Instant::now(),
            }),
        );
        tracing::info!(
            handle = %handle,
            live = state.models.len(),
            load_ms = started.elapsed().as_millis() as u64,
            "model registered"
        );
        Ok(handle)
    }

    pub fn get(&self, handle: Handle) -> Result<Arc<ModelInstance>> {
        self.state()
            .models
            .get(&handle)
            .cloned()
            .ok_or(BridgeError::InvalidHandle(handle))
    }

    /// Drops the mapping, stops the worker once its current call unwinds and
    /// fails everything still pending on the handle.
    pub fn release(&self, handle: Handle) -> Result<()> {
        let instance = self
            .state()
            .models
            .remove(&handle)
            .ok_or(BridgeError::InvalidHandle(handle))?;

        instance.shutdown();
        let failed = self.correlator.release_handle(handle);
        tracing::info!(handle = %handle, failed_requests = failed, "model released");
        Ok(())
    }

    /// Queues a generation on the handle's worker.
    pub fn generate(
        &self,
        handle: Handle,
        request_id: Option<RequestId>,
        prompt: String,
    ) -> Result<PendingResponse> {
        let instance = self.get(handle)?;
        let pending = self.correlator.begin(handle, request_id)?;

        let queued = instance.submit(GenerationJob {
            request_id: pending.request_id().clone(),
            prompt,
        });
        if !queued {
            // Released between lookup and submit.
            self.correlator.fail(
                handle,
                pending.request_id(),
                BridgeError::HandleReleased(handle),
            );
        }
        Ok(pending)
    }

    pub fn live_handles(&self) -> Vec<Handle> {
        let mut out = self.state().models.keys().copied().collect::<Vec<_>>();
        out.sort_unstable();
        out
    }

    pub fn len(&self) -> usize {
        self.state().models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn correlator(&self) -> &Arc<RequestCorrelator> {
        &self.correlator
    }
}

impl Drop for HandleRegistry {
    fn drop(&mut self) {
        let drained: Vec<Arc<ModelInstance>> = self.state().models.drain().map(|(_, m)| m).collect();
        for instance in drained {
            instance.shutdown();
            self.correlator.release_handle(instance.handle);
        }
    }
}
