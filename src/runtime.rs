use std::collections::{HashMap, HashSet};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;

use mio::{Poll, Token};

use llm_bridge_protocol::{response_err_code, response_event, response_ok_code};
use mediapipe_llm_bridge::{
    BridgeEvent, FinalResponse, Handle, LlmBridge, ModelSource, PendingResponse,
    SamplingSettings, StreamSignal, FINAL_RESPONSE_EVENT,
};

use crate::commands::metrics::{log_event, HostMetrics};
use crate::transport::{writable_interest, Client};

pub struct PendingCreate {
    pub client_id: usize,
    pub rx: Receiver<(ModelSource, mediapipe_llm_bridge::errors::Result<Handle>)>,
}

pub struct PendingGeneration {
    pub client_id: usize,
    pub pending: PendingResponse,
}

/// Everything the host loop shares between clients.
pub struct HostState {
    pub bridge: Arc<LlmBridge>,
    pub events: Receiver<BridgeEvent>,
    pub owners: HashMap<Handle, usize>,
    pub pending_creates: Vec<PendingCreate>,
    pub pending_generations: Vec<PendingGeneration>,
    pub retired: Vec<Handle>,
    pub defaults: SamplingSettings,
    pub metrics: HostMetrics,
    pub shutdown_requested: bool,
}

impl HostState {
    pub fn new(bridge: Arc<LlmBridge>, events: Receiver<BridgeEvent>, defaults: SamplingSettings) -> Self {
        Self {
            bridge,
            events,
            owners: HashMap::new(),
            pending_creates: Vec::new(),
            pending_generations: Vec::new(),
            retired: Vec::new(),
            defaults,
            metrics: HostMetrics::new(),
            shutdown_requested: false,
        }
    }

    pub fn owns(&self, client_id: usize, handle: Handle) -> bool {
        self.owners.get(&handle) == Some(&client_id)
    }

    /// Releases every handle of a disconnected client.
    pub fn release_client(&mut self, client_id: usize) {
        let owned: Vec<Handle> = self
            .owners
            .iter()
            .filter(|(_, owner)| **owner == client_id)
            .map(|(h, _)| *h)
            .collect();
        for handle in owned {
            self.owners.remove(&handle);
            if let Err(e) = self.bridge.release_model(handle) {
                tracing::warn!(client_id, handle = %handle, error = %e, "release on disconnect failed");
            }
        }
        self.pending_generations.retain(|p| p.client_id != client_id);
        log_event("client_disconnected", client_id, None, "handles released");
    }
}

/// One host tick.
///
/// Terminal signals are collected before the event queue is drained, so every
/// partial event of a finished request is routed before its final frame.
pub fn run_bridge_tick(host: &mut HostState, clients: &mut HashMap<Token, Client>, poll: &Poll) {
    let mut touched: HashSet<usize> = HashSet::new();

    poll_creations(host, clients, &mut touched);

    let mut finals: Vec<(usize, FinalResponse)> = Vec::new();
    host.pending_generations.retain(|p| loop {
        match p.pending.try_poll() {
            None => break true,
            Some(StreamSignal::Partial(_)) => continue,
            Some(StreamSignal::Completed(text)) => {
                finals.push((p.client_id, p.pending.resolve(text)));
                break false;
            }
            // The error event already went through the emitter.
            Some(StreamSignal::Failed(_)) => break false,
        }
    });

    loop {
        match host.events.try_recv() {
            Ok(event) => {
                let Some(owner) = host.owners.get(&event.handle()).copied() else {
                    continue;
                };
                if let Some(client) = clients.get_mut(&Token(owner)) {
                    client.send(response_event(event.name(), event.to_json().as_bytes()));
                    host.metrics.inc_events();
                    touched.insert(owner);
                }
            }
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => break,
        }
    }

    for (client_id, response) in finals {
        if let Some(client) = clients.get_mut(&Token(client_id)) {
            let body = serde_json::to_vec(&response).unwrap_or_default();
            client.send(response_event(FINAL_RESPONSE_EVENT, &body));
            host.metrics.inc_events();
            touched.insert(client_id);
        }
    }

    for handle in host.retired.drain(..) {
        host.owners.remove(&handle);
    }

    for client_id in touched {
        let token = Token(client_id);
        if let Some(client) = clients.get_mut(&token) {
            let _ = poll
                .registry()
                .reregister(&mut client.stream, token, writable_interest());
        }
    }
}

fn poll_creations(host: &mut HostState, clients: &mut HashMap<Token, Client>, touched: &mut HashSet<usize>) {
    let mut finished = Vec::new();
    host.pending_creates.retain(|p| match p.rx.try_recv() {
        Ok((source, result)) => {
            finished.push((p.client_id, source, result));
            false
        }
        Err(TryRecvError::Empty) => true,
        Err(TryRecvError::Disconnected) => false,
    });

    for (client_id, source, result) in finished {
        let Some(client) = clients.get_mut(&Token(client_id)) else {
            // Creator left while the model was loading.
            if let Ok(handle) = result {
                let _ = host.bridge.release_model(handle);
            }
            continue;
        };

        match result {
            Ok(handle) => {
                host.owners.insert(handle, client_id);
                log_event("model_created", client_id, Some(handle), source.describe());
                client.send(response_ok_code("CREATED", &format!("handle={}", handle)));
            }
            Err(e) => {
                host.metrics.inc_create_failed();
                log_event("model_create_failed", client_id, None, &e.to_string());
                client.send(response_err_code(e.code(), &e.to_string()));
            }
        }
        touched.insert(client_id);
    }
}
