use std::sync::mpsc::{self, Receiver, Sender};

use crate::BridgeEvent;

/// Sink for the out-of-band `onPartialResponse` / `onErrorResponse` events.
///
/// Called from handle workers while the correlator table is locked, so
/// implementations must not call back into the bridge.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: BridgeEvent);
}

impl<F> EventEmitter for F
where
    F: Fn(BridgeEvent) + Send + Sync,
{
    fn emit(&self, event: BridgeEvent) {
        self(event)
    }
}

/// Forwards events into an mpsc queue drained by the host loop.
pub struct ChannelEmitter {
    tx: Sender<BridgeEvent>,
}

impl ChannelEmitter {
    pub fn channel() -> (Self, Receiver<BridgeEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }
}

impl EventEmitter for ChannelEmitter {
    fn emit(&self, event: BridgeEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("event receiver gone, dropping event");
        }
    }
}

/// Discards everything. Useful when only the resolved responses matter.
pub struct NullEmitter;

impl EventEmitter for NullEmitter {
    fn emit(&self, _event: BridgeEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Handle, RequestId};

    #[test]
    fn channel_emitter_preserves_emission_order() {
        let (emitter, rx) = ChannelEmitter::channel();
        emitter.emit(BridgeEvent::partial(Handle(1), RequestId::Number(1), "a"));
        emitter.emit(BridgeEvent::partial(Handle(1), RequestId::Number(1), "b"));

        let data: Vec<String> = rx.try_iter().map(|e| e.payload.data).collect();
        assert_eq!(data, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn channel_emitter_survives_dropped_receiver() {
        let (emitter, rx) = ChannelEmitter::channel();
        drop(rx);
        emitter.emit(BridgeEvent::error(Handle(2), RequestId::Number(5), "late"));
    }
}
