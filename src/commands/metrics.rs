use std::time::Instant;

use mediapipe_llm_bridge::Handle;

/// Host counters, owned by the host state.
pub struct HostMetrics {
    started: Instant,
    total_commands: u64,
    total_errors: u64,
    creates_started: u64,
    creates_failed: u64,
    generations_started: u64,
    events_routed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub uptime_s: u64,
    pub total_commands: u64,
    pub total_errors: u64,
    pub creates_started: u64,
    pub creates_failed: u64,
    pub generations_started: u64,
    pub events_routed: u64,
}

impl HostMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            total_commands: 0,
            total_errors: 0,
            creates_started: 0,
            creates_failed: 0,
            generations_started: 0,
            events_routed: 0,
        }
    }

    pub fn record_command(&mut self, success: bool) {
        self.total_commands += 1;
        if !success {
            self.total_errors += 1;
        }
    }

    pub fn inc_create_started(&mut self) {
        self.creates_started += 1;
    }

    pub fn inc_create_failed(&mut self) {
        self.creates_failed += 1;
    }

    pub fn inc_generation_started(&mut self) {
        self.generations_started += 1;
    }

    pub fn inc_events(&mut self) {
        self.events_routed += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_s: self.started.elapsed().as_secs(),
            total_commands: self.total_commands,
            total_errors: self.total_errors,
            creates_started: self.creates_started,
            creates_failed: self.creates_failed,
            generations_started: self.generations_started,
            events_routed: self.events_routed,
        }
    }
}

impl Default for HostMetrics {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn log_event(event: &str, client_id: usize, handle: Option<Handle>, detail: &str) {
    match handle {
        Some(handle) => tracing::info!(event, client_id, handle = %handle, detail, "host event"),
        None => tracing::info!(event, client_id, detail, "host event"),
    }
}
