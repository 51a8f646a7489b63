use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crate::backend::{InferenceEngine, TokenStream};
use crate::correlator::RequestCorrelator;
use crate::errors::BridgeError;
use crate::{Handle, RequestId};

pub(crate) struct GenerationJob {
    pub request_id: RequestId,
    pub prompt: String,
}

/// Starts the thread that exclusively owns `engine`. Jobs run one at a time
/// in submission order; the engine is closed once the queue is dropped.
pub(crate) fn spawn_worker(
    handle: Handle,
    mut engine: Box<dyn InferenceEngine>,
    correlator: Arc<RequestCorrelator>,
    cancel: Arc<AtomicBool>,
) -> io::Result<Sender<GenerationJob>> {
    let (tx_job, rx_job) = mpsc::channel::<GenerationJob>();

    thread::Builder::new()
        .name(format!("llm_worker_{}", handle))
        .spawn(move || {
            while let Ok(job) = rx_job.recv() {
                if cancel.load(Ordering::SeqCst) {
                    tracing::debug!(handle = %handle, request_id = %job.request_id, "skipping job of released handle");
                    continue;
                }
                run_job(handle, engine.as_mut(), &correlator, &cancel, job);
            }
            engine.close();
            tracing::debug!(handle = %handle, "worker exited");
        })?;

    Ok(tx_job)
}

fn run_job(
    handle: Handle,
    engine: &mut dyn InferenceEngine,
    correlator: &RequestCorrelator,
    cancel: &AtomicBool,
    job: GenerationJob,
) {
    let started = Instant::now();
    let request_id = job.request_id;
    let mut sink = |chunk: &str| correlator.deliver_partial(handle, &request_id, chunk);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut stream = TokenStream::new(&mut sink, cancel);
        let result = engine.generate(&job.prompt, &mut stream);
        (result, stream.chunks_delivered())
    }));

    match outcome {
        Ok((Ok(()), chunks)) => {
            tracing::info!(
                handle = %handle,
                request_id = %request_id,
                chunks,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "generation finished"
            );
            correlator.complete(handle, &request_id);
        }
        Ok((Err(err), _)) => {
            correlator.fail(handle, &request_id, BridgeError::Generation(err.message));
        }
        Err(_) => {
            tracing::error!(handle = %handle, request_id = %request_id, "engine panicked during generation");
            correlator.fail(
                handle,
                &request_id,
                BridgeError::Generation("engine panicked during generation".to_string()),
            );
        }
    }
}
