//! Device memory admission heuristic.
//!
//! Everything here is advisory: a "too large" verdict is reported to the
//! caller, it never blocks a load. Profiles are sampled fresh on every
//! query since memory pressure changes continuously.

mod probe;

use serde::{Deserialize, Serialize};

use crate::errors::Result;

pub use self::probe::{
    parse_meminfo, AllocatorHint, FixedMemoryProbe, MemoryProbe, NoopAllocatorHint,
    SystemMemoryProbe,
};

const HIGH_MEMORY_HEAP_MB: u64 = 1000;
const HIGH_MEMORY_TOTAL_MB: u64 = 6000;
const LARGE_HEAP_HINT_TOTAL_MB: u64 = 4000;
const HEAP_CEILING_HINT_MB: u64 = 2000;
const LOW_AVAILABLE_MB: u64 = 1000;
const LOW_AVAILABLE_RATIO: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryProfile {
    #[serde(rename = "totalDeviceMemoryMB")]
    pub total_device_memory_mb: u64,
    #[serde(rename = "availableMemoryMB")]
    pub available_memory_mb: u64,
    #[serde(rename = "heapLimitMB")]
    pub heap_limit_mb: u64,
    #[serde(rename = "isLargeHeapEnabled")]
    pub is_large_heap_enabled: bool,
}

impl MemoryProfile {
    /// High-memory when either the heap ceiling or the physical RAM alone
    /// crosses its threshold.
    pub fn device_category(&self) -> DeviceCategory {
        if self.heap_limit_mb > HIGH_MEMORY_HEAP_MB
            || self.total_device_memory_mb > HIGH_MEMORY_TOTAL_MB
        {
            DeviceCategory::HighMemory
        } else {
            DeviceCategory::StandardMemory
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCategory {
    HighMemory,
    StandardMemory,
}

impl DeviceCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceCategory::HighMemory => "high_memory",
            DeviceCategory::StandardMemory => "standard_memory",
        }
    }

    fn label(self) -> &'static str {
        match self {
            DeviceCategory::HighMemory => "High-memory",
            DeviceCategory::StandardMemory => "Standard",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelLimits {
    #[serde(rename = "maxModelSizeMB")]
    pub max_model_size_mb: u64,
    #[serde(rename = "warningThresholdMB")]
    pub warning_threshold_mb: u64,
    #[serde(rename = "deviceCategory")]
    pub device_category: DeviceCategory,
    pub recommendation: String,
}

impl ModelLimits {
    pub fn from_profile(profile: &MemoryProfile) -> Self {
        let heap = profile.heap_limit_mb;
        let category = profile.device_category();
        // Integer tenths keep the floor exact.
        let (max_tenths, warn_tenths) = match category {
            DeviceCategory::HighMemory => (8, 6),
            DeviceCategory::StandardMemory => (6, 3),
        };
        let max_model_size_mb = heap.saturating_mul(max_tenths) / 10;
        let warning_threshold_mb = heap.saturating_mul(warn_tenths) / 10;

        let recommendation = match category {
            DeviceCategory::HighMemory => format!(
                "Device can handle large models up to {}MB",
                max_model_size_mb
            ),
            DeviceCategory::StandardMemory => format!(
                "Use models under {}MB for optimal performance",
                max_model_size_mb
            ),
        };

        Self {
            max_model_size_mb,
            warning_threshold_mb,
            device_category: category,
            recommendation,
        }
    }

    pub fn verdict(&self, model_size_mb: u64) -> CapabilityVerdict {
        if model_size_mb <= self.warning_threshold_mb {
            CapabilityVerdict::Safe
        } else if model_size_mb <= self.max_model_size_mb {
            CapabilityVerdict::Monitor
        } else {
            CapabilityVerdict::TooLarge
        }
    }
}

/// Ordered from least to most restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityVerdict {
    Safe,
    Monitor,
    TooLarge,
}

impl CapabilityVerdict {
    pub fn can_load(self) -> bool {
        !matches!(self, CapabilityVerdict::TooLarge)
    }

    pub fn recommended_action(self) -> &'static str {
        match self {
            CapabilityVerdict::Safe => "Model can be loaded safely",
            CapabilityVerdict::Monitor => "Model can be loaded but monitor memory usage",
            CapabilityVerdict::TooLarge => {
                "Model too large for device. Use smaller model or enable large heap."
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCapability {
    pub can_load_model: bool,
    pub verdict: CapabilityVerdict,
    pub recommended_action: String,
    #[serde(rename = "memoryRequiredMB")]
    pub memory_required_mb: u64,
    #[serde(rename = "memoryAvailableMB")]
    pub memory_available_mb: u64,
}

impl ModelCapability {
    pub fn evaluate(profile: &MemoryProfile, limits: &ModelLimits, model_size_mb: u64) -> Self {
        let verdict = limits.verdict(model_size_mb);
        Self {
            can_load_model: verdict.can_load(),
            verdict,
            recommended_action: verdict.recommended_action().to_string(),
            memory_required_mb: model_size_mb,
            memory_available_mb: profile.heap_limit_mb,
        }
    }
}

/// Non-fatal advisory attached to a model load above the safe threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryWarning {
    pub model_size_mb: u64,
    pub verdict: CapabilityVerdict,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfiguration {
    #[serde(flatten)]
    pub profile: MemoryProfile,
    #[serde(flatten)]
    pub limits: ModelLimits,
    pub recommendations: Vec<String>,
    pub warnings: Vec<String>,
    pub info: Vec<String>,
}

impl MemoryConfiguration {
    pub fn from_profile(profile: MemoryProfile) -> Self {
        let limits = ModelLimits::from_profile(&profile);
        let category = limits.device_category;

        let mut recommendations = Vec::new();
        if !profile.is_large_heap_enabled
            && profile.total_device_memory_mb > LARGE_HEAP_HINT_TOTAL_MB
        {
            recommendations.push(
                "Enable the large heap setting ([memory] large_heap = true) for better performance"
                    .to_string(),
            );
        }
        if category == DeviceCategory::HighMemory && profile.heap_limit_mb < HEAP_CEILING_HINT_MB {
            recommendations
                .push("Consider raising the heap ceiling ([memory] heap_limit_mb)".to_string());
        }
        if profile.available_memory_mb < LOW_AVAILABLE_MB {
            recommendations.push("Close other apps before loading large models".to_string());
        }

        let mut warnings = Vec::new();
        if profile.total_device_memory_mb > 0 {
            let ratio =
                profile.available_memory_mb as f64 / profile.total_device_memory_mb as f64;
            if ratio < LOW_AVAILABLE_RATIO {
                warnings.push(format!(
                    "Low available memory ({}MB/{}MB)",
                    profile.available_memory_mb, profile.total_device_memory_mb
                ));
                warnings.push("Close other apps before loading large models".to_string());
            }
        }

        let info = vec![
            format!("Current heap limit: {}MB", profile.heap_limit_mb),
            format!("Recommended max model size: {}MB", limits.max_model_size_mb),
            format!("Device category: {}", category.label()),
        ];

        Self {
            profile,
            limits,
            recommendations,
            warnings,
            info,
        }
    }
}

/// Samples a probe and turns the profile into limits and verdicts.
pub struct MemoryAdvisor {
    probe: Box<dyn MemoryProbe>,
    hint: Box<dyn AllocatorHint>,
}

impl MemoryAdvisor {
    pub fn new(probe: Box<dyn MemoryProbe>, hint: Box<dyn AllocatorHint>) -> Self {
        Self { probe, hint }
    }

    pub fn with_probe(probe: impl MemoryProbe + 'static) -> Self {
        Self::new(Box::new(probe), Box::new(NoopAllocatorHint))
    }

    pub fn sample(&self) -> Result<MemoryProfile> {
        self.hint.release_unused();
        let profile = self.probe.sample()?;
        tracing::debug!(
            total_mb = profile.total_device_memory_mb,
            available_mb = profile.available_memory_mb,
            heap_mb = profile.heap_limit_mb,
            large_heap = profile.is_large_heap_enabled,
            "memory sampled"
        );
        Ok(profile)
    }

    pub fn limits(&self) -> Result<ModelLimits> {
        Ok(ModelLimits::from_profile(&self.sample()?))
    }

    pub fn configuration(&self) -> Result<MemoryConfiguration> {
        let config = MemoryConfiguration::from_profile(self.sample()?);
        for rec in &config.recommendations {
            tracing::info!(recommendation = %rec, "memory configuration");
        }
        for warning in &config.warnings {
            tracing::warn!(warning = %warning, "memory configuration");
        }
        Ok(config)
    }

    pub fn check_model_capability(&self, model_size_mb: u64) -> Result<ModelCapability> {
        let profile = self.sample()?;
        let limits = ModelLimits::from_profile(&profile);
        Ok(ModelCapability::evaluate(&profile, &limits, model_size_mb))
    }

    /// Returns a warning when the model is above the safe threshold.
    pub fn advise_load(&self, model_size_mb: u64) -> Result<Option<MemoryWarning>> {
        let capability = self.check_model_capability(model_size_mb)?;
        if capability.verdict == CapabilityVerdict::Safe {
            return Ok(None);
        }
        Ok(Some(MemoryWarning {
            model_size_mb,
            verdict: capability.verdict,
            message: format!(
                "{} ({}MB model, {}MB heap)",
                capability.recommended_action, model_size_mb, capability.memory_available_mb
            ),
        }))
    }
}
