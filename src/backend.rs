mod process;

use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use crate::errors::{BridgeError, CreationReason};

pub use process::{ProcessEngine, ProcessEngineFactory};

/// Construction parameters handed to the external engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    pub model_path: String,
    pub max_tokens: u32,
    pub top_k: u32,
    pub temperature: f32,
    pub random_seed: i32,
}

impl EngineOptions {
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.model_path.trim().is_empty() {
            return Err(BridgeError::InvalidParams(
                "model path must not be empty".to_string(),
            ));
        }
        if self.max_tokens == 0 {
            return Err(BridgeError::InvalidParams(
                "max_tokens must be > 0".to_string(),
            ));
        }
        if self.top_k == 0 {
            return Err(BridgeError::InvalidParams("top_k must be > 0".to_string()));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(BridgeError::InvalidParams(format!(
                "temperature must be a finite value >= 0 (got {})",
                self.temperature
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct EngineError {
    pub reason: CreationReason,
    pub message: String,
}

impl EngineError {
    pub fn new(reason: CreationReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    /// Wraps a raw engine message, classifying it by content.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            reason: CreationReason::classify(&message),
            message,
        }
    }
}

impl From<EngineError> for BridgeError {
    fn from(err: EngineError) -> Self {
        BridgeError::Creation {
            reason: err.reason,
            message: err.message,
        }
    }
}

/// Per-call view the engine writes its partial output into.
pub struct TokenStream<'a> {
    sink: &'a mut dyn FnMut(&str) -> bool,
    cancelled: &'a AtomicBool,
    chunks: usize,
}

impl<'a> TokenStream<'a> {
    pub fn new(sink: &'a mut dyn FnMut(&str) -> bool, cancelled: &'a AtomicBool) -> Self {
        Self {
            sink,
            cancelled,
            chunks: 0,
        }
    }

    /// Delivers one chunk. Returns `false` once nobody is listening any more,
    /// in which case the engine should stop producing.
    pub fn push(&mut self, chunk: &str) -> bool {
        if self.is_cancelled() {
            return false;
        }
        if chunk.is_empty() {
            return true;
        }
        self.chunks += 1;
        (self.sink)(chunk)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn chunks_delivered(&self) -> usize {
        self.chunks
    }
}

/// A loaded, ready-to-generate model object owned by exactly one handle.
pub trait InferenceEngine: Send {
    /// Runs one generation. Partial chunks go through `stream` in emission
    /// order; returning `Ok(())` is the terminal "done" signal.
    fn generate(&mut self, prompt: &str, stream: &mut TokenStream<'_>) -> Result<(), EngineError>;

    /// Frees native resources. Called once, from the owning worker.
    fn close(&mut self) {}
}

pub trait EngineFactory: Send + Sync {
    fn create(&self, options: &EngineOptions) -> Result<Box<dyn InferenceEngine>, EngineError>;
}

impl<F> EngineFactory for F
where
    F: Fn(&EngineOptions) -> Result<Box<dyn InferenceEngine>, EngineError> + Send + Sync,
{
    fn create(&self, options: &EngineOptions) -> Result<Box<dyn InferenceEngine>, EngineError> {
        self(options)
    }
}
