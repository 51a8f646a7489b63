//! Binds streaming engine output to the generation call that asked for it.
//!
//! Every outstanding `(handle, request_id)` pair owns a private channel.
//! Partial chunks travel through it in emission order, followed by exactly
//! one terminal signal. Events for the host are emitted while the table is
//! locked, so nothing attributed to a request can follow its terminal signal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::errors::{BridgeError, Result};
use crate::events::EventEmitter;
use crate::{BridgeEvent, FinalResponse, Handle, RequestId};

#[derive(Debug, Clone, PartialEq)]
pub enum StreamSignal {
    Partial(String),
    Completed(String),
    Failed(BridgeError),
}

impl StreamSignal {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamSignal::Partial(_))
    }
}

struct InflightRequest {
    accumulated: String,
    tx: Sender<StreamSignal>,
}

type RequestKey = (Handle, RequestId);

pub struct RequestCorrelator {
    inflight: Mutex<HashMap<RequestKey, InflightRequest>>,
    emitter: Arc<dyn EventEmitter>,
    next_generated_id: AtomicU64,
}

impl RequestCorrelator {
    pub fn new(emitter: Arc<dyn EventEmitter>) -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
            emitter,
            next_generated_id: AtomicU64::new(1),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<RequestKey, InflightRequest>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new outstanding request. Without a caller supplied id one
    /// is generated (`gen-<n>`).
    pub fn begin(&self, handle: Handle, request_id: Option<RequestId>) -> Result<PendingResponse> {
        let mut table = self.table();

        let request_id = match request_id {
            Some(id) => {
                if table.contains_key(&(handle, id.clone())) {
                    return Err(BridgeError::DuplicateRequestId {
                        handle,
                        request_id: id,
                    });
                }
                id
            }
            None => loop {
                let n = self.next_generated_id.fetch_add(1, Ordering::Relaxed);
                let candidate = RequestId::Text(format!("gen-{}", n));
                if !table.contains_key(&(handle, candidate.clone())) {
                    break candidate;
                }
            },
        };

        let (tx, rx) = mpsc::channel();
        table.insert(
            (handle, request_id.clone()),
            InflightRequest {
                accumulated: String::new(),
                tx,
            },
        );
        tracing::debug!(handle = %handle, request_id = %request_id, "request registered");

        Ok(PendingResponse {
            handle,
            request_id,
            rx,
        })
    }

    /// Attributes one chunk to its request. Returns `false` when nobody is
    /// waiting for this request any more.
    pub fn deliver_partial(&self, handle: Handle, request_id: &RequestId, chunk: &str) -> bool {
        let mut table = self.table();
        let key = (handle, request_id.clone());
        let Some(entry) = table.get_mut(&key) else {
            return false;
        };

        if entry.tx.send(StreamSignal::Partial(chunk.to_string())).is_err() {
            table.remove(&key);
            tracing::debug!(handle = %handle, request_id = %request_id, "caller stopped listening");
            return false;
        }
        entry.accumulated.push_str(chunk);
        self.emitter
            .emit(BridgeEvent::partial(handle, request_id.clone(), chunk));
        true
    }

    /// Resolves the request with everything accumulated so far.
    pub fn complete(&self, handle: Handle, request_id: &RequestId) -> bool {
        let mut table = self.table();
        let Some(entry) = table.remove(&(handle, request_id.clone())) else {
            return false;
        };
        tracing::debug!(
            handle = %handle,
            request_id = %request_id,
            chars = entry.accumulated.len(),
            "request completed"
        );
        let _ = entry.tx.send(StreamSignal::Completed(entry.accumulated));
        true
    }

    /// Fails the request, discarding any accumulated text.
    pub fn fail(&self, handle: Handle, request_id: &RequestId, error: BridgeError) -> bool {
        let mut table = self.table();
        let Some(entry) = table.remove(&(handle, request_id.clone())) else {
            return false;
        };
        tracing::warn!(handle = %handle, request_id = %request_id, error = %error, "request failed");
        self.emitter
            .emit(BridgeEvent::error(handle, request_id.clone(), error.to_string()));
        let _ = entry.tx.send(StreamSignal::Failed(error));
        true
    }

    /// Fails every outstanding request of a released handle. Returns how
    /// many were pending.
    pub fn release_handle(&self, handle: Handle) -> usize {
        let mut table = self.table();
        let keys: Vec<RequestKey> = table.keys().filter(|(h, _)| *h == handle).cloned().collect();

        for key in &keys {
            if let Some(entry) = table.remove(key) {
                let error = BridgeError::HandleReleased(handle);
                self.emitter
                    .emit(BridgeEvent::error(handle, key.1.clone(), error.to_string()));
                let _ = entry.tx.send(StreamSignal::Failed(error));
            }
        }
        if !keys.is_empty() {
            tracing::info!(handle = %handle, failed = keys.len(), "pending requests failed by release");
        }
        keys.len()
    }

    pub fn outstanding(&self, handle: Handle) -> usize {
        self.table().keys().filter(|(h, _)| *h == handle).count()
    }

    pub fn total_outstanding(&self) -> usize {
        self.table().len()
    }
}

/// Caller side of one generation call.
pub struct PendingResponse {
    handle: Handle,
    request_id: RequestId,
    rx: Receiver<StreamSignal>,
}

impl PendingResponse {
    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Blocks for the next signal. A vanished producer counts as a release.
    pub fn next_signal(&self) -> StreamSignal {
        self.rx
            .recv()
            .unwrap_or_else(|_| StreamSignal::Failed(BridgeError::HandleReleased(self.handle)))
    }

    /// Non-blocking variant of [`next_signal`](Self::next_signal).
    pub fn try_poll(&self) -> Option<StreamSignal> {
        match self.rx.try_recv() {
            Ok(signal) => Some(signal),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                Some(StreamSignal::Failed(BridgeError::HandleReleased(self.handle)))
            }
        }
    }

    /// Waits for the terminal signal, skipping partial chunks.
    pub fn wait(self) -> Result<FinalResponse> {
        loop {
            match self.next_signal() {
                StreamSignal::Partial(_) => continue,
                StreamSignal::Completed(text) => return Ok(self.resolve(text)),
                StreamSignal::Failed(err) => return Err(err),
            }
        }
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`, returning
    /// `None`. Partial chunks consumed while waiting are gone.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<FinalResponse>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(StreamSignal::Partial(_)) => continue,
                Ok(StreamSignal::Completed(text)) => return Some(Ok(self.resolve(text))),
                Ok(StreamSignal::Failed(err)) => return Some(Err(err)),
                Err(RecvTimeoutError::Timeout) => return None,
                Err(RecvTimeoutError::Disconnected) => {
                    return Some(Err(BridgeError::HandleReleased(self.handle)))
                }
            }
        }
    }

    pub fn resolve(&self, response: String) -> FinalResponse {
        FinalResponse {
            handle: self.handle,
            request_id: self.request_id.clone(),
            response,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelEmitter;
    use crate::EventKind;

    fn correlator() -> (RequestCorrelator, Receiver<BridgeEvent>) {
        let (emitter, rx) = ChannelEmitter::channel();
        (RequestCorrelator::new(Arc::new(emitter)), rx)
    }

    #[test]
    fn chunks_accumulate_in_delivery_order() {
        let (corr, events) = correlator();
        let id = RequestId::Number(1);
        let pending = corr.begin(Handle(1), Some(id.clone())).expect("begin");

        for chunk in ["Hel", "lo, ", "world"] {
            assert!(corr.deliver_partial(Handle(1), &id, chunk));
        }
        assert!(corr.complete(Handle(1), &id));

        let resolved = pending.wait().expect("completed");
        assert_eq!(resolved.response, "Hello, world");
        assert_eq!(resolved.request_id, id);

        let partials: Vec<String> = events.try_iter().map(|e| e.payload.data).collect();
        assert_eq!(partials, vec!["Hel", "lo, ", "world"]);
    }

    #[test]
    fn duplicate_outstanding_id_is_rejected() {
        let (corr, _events) = correlator();
        let _first = corr.begin(Handle(1), Some(RequestId::Number(7))).expect("begin");
        let err = corr
            .begin(Handle(1), Some(RequestId::Number(7)))
            .err()
            .expect("duplicate must fail");
        assert_eq!(err.code(), "DUPLICATE_REQUEST_ID");

        // Same id on another handle is a different request.
        assert!(corr.begin(Handle(2), Some(RequestId::Number(7))).is_ok());
    }

    #[test]
    fn zero_padded_id_is_distinct_from_its_number() {
        let (corr, events) = correlator();
        let seven = RequestId::parse("7").expect("id");
        let padded = RequestId::parse("007").expect("id");
        let _a = corr.begin(Handle(1), Some(seven)).expect("begin 7");
        let b = corr.begin(Handle(1), Some(padded.clone())).expect("007 is another request");

        assert!(corr.deliver_partial(Handle(1), b.request_id(), "x"));
        let event = events.try_recv().expect("partial event");
        assert_eq!(event.payload.request_id, padded);
        assert!(event.to_json().contains("\"requestId\":\"007\""));
    }

    #[test]
    fn id_becomes_reusable_after_terminal_signal() {
        let (corr, _events) = correlator();
        let id = RequestId::from("chat");
        let _pending = corr.begin(Handle(1), Some(id.clone())).expect("begin");
        corr.complete(Handle(1), &id);
        assert!(corr.begin(Handle(1), Some(id)).is_ok());
    }

    #[test]
    fn failure_discards_text_and_stops_partials() {
        let (corr, events) = correlator();
        let id = RequestId::Number(3);
        let pending = corr.begin(Handle(4), Some(id.clone())).expect("begin");

        corr.deliver_partial(Handle(4), &id, "half an ans");
        corr.fail(Handle(4), &id, BridgeError::Generation("kv cache exhausted".into()));
        assert!(!corr.deliver_partial(Handle(4), &id, "wer"));

        assert_eq!(
            pending.wait(),
            Err(BridgeError::Generation("kv cache exhausted".to_string()))
        );

        let kinds: Vec<EventKind> = events.try_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::PartialResponse, EventKind::ErrorResponse]);
    }

    #[test]
    fn release_fails_only_that_handles_requests() {
        let (corr, _events) = correlator();
        let a = corr.begin(Handle(1), Some(RequestId::Number(1))).expect("begin");
        let b = corr.begin(Handle(1), None).expect("begin");
        let other = corr.begin(Handle(2), Some(RequestId::Number(1))).expect("begin");

        assert_eq!(corr.release_handle(Handle(1)), 2);
        assert_eq!(a.wait(), Err(BridgeError::HandleReleased(Handle(1))));
        assert_eq!(b.wait(), Err(BridgeError::HandleReleased(Handle(1))));
        assert_eq!(corr.outstanding(Handle(2)), 1);
        assert!(other.try_poll().is_none());
    }

    #[test]
    fn generated_ids_are_distinct() {
        let (corr, _events) = correlator();
        let a = corr.begin(Handle(1), None).expect("begin");
        let b = corr.begin(Handle(1), None).expect("begin");
        assert_ne!(a.request_id(), b.request_id());
        assert!(a.request_id().to_string().starts_with("gen-"));
    }

    #[test]
    fn dropped_caller_stops_delivery() {
        let (corr, _events) = correlator();
        let id = RequestId::Number(9);
        let pending = corr.begin(Handle(1), Some(id.clone())).expect("begin");
        drop(pending);
        assert!(!corr.deliver_partial(Handle(1), &id, "x"));
        assert_eq!(corr.total_outstanding(), 0);
    }

    #[test]
    fn wait_timeout_returns_none_while_running() {
        let (corr, _events) = correlator();
        let pending = corr.begin(Handle(1), None).expect("begin");
        assert!(pending.wait_timeout(Duration::from_millis(10)).is_none());
        corr.complete(Handle(1), &pending.request_id().clone());
        let resolved = pending
            .wait_timeout(Duration::from_millis(10))
            .expect("terminal")
            .expect("completed");
        assert_eq!(resolved.response, "");
    }
}
