use std::fs;
use std::path::Path;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;

use serde::{Deserialize, Serialize};

use crate::backend::{EngineFactory, EngineOptions, ProcessEngineFactory};
use crate::config::BridgeConfig;
use crate::correlator::{PendingResponse, RequestCorrelator};
use crate::errors::{BridgeError, CreationReason, Result};
use crate::events::EventEmitter;
use crate::memory::{
    MemoryAdvisor, MemoryConfiguration, ModelCapability, NoopAllocatorHint, SystemMemoryProbe,
};
use crate::model_files::ModelStorage;
use crate::registry::HandleRegistry;
use crate::{Handle, RequestId};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Sampling parameters passed through to the engine at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingSettings {
    pub max_tokens: u32,
    pub top_k: u32,
    pub temperature: f32,
    pub random_seed: i32,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            top_k: 40,
            temperature: 0.8,
            random_seed: 0,
        }
    }
}

impl SamplingSettings {
    pub fn options_for(&self, model_path: &Path) -> EngineOptions {
        EngineOptions {
            model_path: model_path.to_string_lossy().into_owned(),
            max_tokens: self.max_tokens,
            top_k: self.top_k,
            temperature: self.temperature,
            random_seed: self.random_seed,
        }
    }
}

/// Where a model comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// Absolute/relative path or `file://` reference.
    Reference(String),
    /// Name of a bundled asset, copied to writable storage first.
    Asset(String),
}

impl ModelSource {
    pub fn describe(&self) -> &str {
        match self {
            ModelSource::Reference(r) => r,
            ModelSource::Asset(a) => a,
        }
    }
}

/// The surface exposed to the host application.
pub struct LlmBridge {
    registry: HandleRegistry,
    storage: ModelStorage,
    advisor: MemoryAdvisor,
}

impl LlmBridge {
    pub fn new(
        factory: Arc<dyn EngineFactory>,
        emitter: Arc<dyn EventEmitter>,
        storage: ModelStorage,
        advisor: MemoryAdvisor,
    ) -> Self {
        let correlator = Arc::new(RequestCorrelator::new(emitter));
        Self {
            registry: HandleRegistry::new(factory, correlator),
            storage,
            advisor,
        }
    }

    /// Wires the process engine, the system memory probe and the configured
    /// storage directories.
    pub fn from_config(config: &BridgeConfig, emitter: Arc<dyn EventEmitter>) -> Self {
        let factory = ProcessEngineFactory::new(config.engine.program.clone(), config.engine.args.clone());
        let probe = SystemMemoryProbe::new(config.memory.heap_limit_mb, config.memory.large_heap);
        Self::new(
            Arc::new(factory),
            emitter,
            ModelStorage::new(&config.storage.assets_dir, &config.storage.files_dir),
            MemoryAdvisor::new(Box::new(probe), Box::new(NoopAllocatorHint)),
        )
    }

    pub fn is_available(&self) -> bool {
        true
    }

    pub fn create_model(&self, reference: &str, settings: SamplingSettings) -> Result<Handle> {
        self.create(&ModelSource::Reference(reference.to_string()), settings)
    }

    pub fn create_model_from_asset(&self, asset_name: &str, settings: SamplingSettings) -> Result<Handle> {
        self.create(&ModelSource::Asset(asset_name.to_string()), settings)
    }

    /// Resolves the source, reports the memory advisory, then builds the
    /// engine. Blocks while the model loads.
    pub fn create(&self, source: &ModelSource, settings: SamplingSettings) -> Result<Handle> {
        let path = match source {
            ModelSource::Reference(reference) => self.storage.resolve_reference(reference)?,
            ModelSource::Asset(name) => self.storage.copy_asset(name)?,
        };

        if let Ok(meta) = fs::metadata(&path) {
            let size_mb = meta.len() / BYTES_PER_MB;
            match self.advisor.advise_load(size_mb) {
                Ok(Some(warning)) => tracing::warn!(
                    model = %path.display(),
                    size_mb,
                    verdict = ?warning.verdict,
                    "{}",
                    warning.message
                ),
                Ok(None) => {}
                Err(err) => tracing::debug!(error = %err, "memory advisory unavailable"),
            }
        }

        self.registry.create(settings.options_for(&path))
    }

    /// Runs [`create`](Self::create) on a background thread. The receiver
    /// yields exactly one result.
    pub fn spawn_create(
        self: &Arc<Self>,
        source: ModelSource,
        settings: SamplingSettings,
    ) -> Receiver<(ModelSource, Result<Handle>)> {
        let (tx, rx) = mpsc::channel();
        let bridge = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("llm_model_loader".to_string())
            .spawn({
                let tx = tx.clone();
                let source = source.clone();
                move || {
                    let result = bridge.create(&source, settings);
                    let _ = tx.send((source, result));
                }
            });

        if let Err(e) = spawned {
            let err = BridgeError::creation(
                CreationReason::Unknown,
                format!("Failed to spawn model loader: {}", e),
            );
            let _ = tx.send((source, Err(err)));
        }
        rx
    }

    pub fn generate_response(
        &self,
        handle: Handle,
        request_id: Option<RequestId>,
        prompt: &str,
    ) -> Result<PendingResponse> {
        self.registry.generate(handle, request_id, prompt.to_string())
    }

    pub fn release_model(&self, handle: Handle) -> Result<()> {
        self.registry.release(handle)
    }

    pub fn get_memory_configuration(&self) -> Result<MemoryConfiguration> {
        self.advisor.configuration()
    }

    pub fn check_model_capability(&self, model_size_mb: u64) -> Result<ModelCapability> {
        self.advisor.check_model_capability(model_size_mb)
    }

    pub fn live_handles(&self) -> Vec<Handle> {
        self.registry.live_handles()
    }

    pub fn outstanding_requests(&self) -> usize {
        self.registry.correlator().total_outstanding()
    }

    pub fn registry(&self) -> &HandleRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_match_bridge_defaults() {
        let s = SamplingSettings::default();
        assert_eq!((s.max_tokens, s.top_k, s.random_seed), (512, 40, 0));
        assert!((s.temperature - 0.8).abs() < f32::EPSILON);
    }

    #[test]
    fn options_carry_every_setting() {
        let settings = SamplingSettings {
            max_tokens: 64,
            top_k: 8,
            temperature: 0.1,
            random_seed: 99,
        };
        let opts = settings.options_for(Path::new("/m/model.task"));
        assert_eq!(opts.model_path, "/m/model.task");
        assert_eq!(opts.max_tokens, 64);
        assert_eq!(opts.top_k, 8);
        assert_eq!(opts.random_seed, 99);
    }
}
