pub mod metrics;
mod parsing;

use llm_bridge_protocol::{response_err_code, response_ok_code, CommandHeader, OpCode};
use mediapipe_llm_bridge::{BridgeError, ModelSource};
use serde_json::json;

use crate::runtime::{HostState, PendingCreate, PendingGeneration};
use crate::transport::Client;

use self::metrics::log_event;
use self::parsing::{parse_create_payload, parse_generate_target, parse_handle, parse_size_mb, CreateKind};

pub fn execute_command(
    client: &mut Client,
    header: CommandHeader,
    payload: Vec<u8>,
    host: &mut HostState,
    client_id: usize,
) {
    let text = String::from_utf8_lossy(&payload).to_string();
    tracing::debug!(
        client_id,
        verb = header.opcode.verb(),
        target = %header.target,
        bytes = payload.len(),
        "command received"
    );

    let response = match header.opcode {
        OpCode::Ping => response_ok_code("PING", "PONG"),
        OpCode::Available => {
            response_ok_code("AVAILABLE", &host.bridge.is_available().to_string())
        }
        OpCode::Create | OpCode::CreateAsset => {
            let kind = if header.opcode == OpCode::CreateAsset {
                CreateKind::Asset
            } else {
                CreateKind::Reference
            };
            match parse_create_payload(&text, kind, host.defaults) {
                Ok((location, settings)) => {
                    let source = match kind {
                        CreateKind::Reference => ModelSource::Reference(location),
                        CreateKind::Asset => ModelSource::Asset(location),
                    };
                    let describe = source.describe().to_string();
                    let rx = host.bridge.spawn_create(source, settings);
                    host.pending_creates.push(PendingCreate { client_id, rx });
                    host.metrics.inc_create_started();
                    log_event("create_queued", client_id, None, &describe);
                    response_ok_code("CREATE_QUEUED", &describe)
                }
                Err(e) => response_err_code("INVALID_PARAMS", &e),
            }
        }
        OpCode::Generate => match parse_generate_target(&header.target) {
            Ok((handle, request_id)) => {
                if !host.owns(client_id, handle) {
                    response_err_code(
                        "INVALID_HANDLE",
                        &BridgeError::InvalidHandle(handle).to_string(),
                    )
                } else {
                    match host.bridge.generate_response(handle, request_id, &text) {
                        Ok(pending) => {
                            let msg = format!(
                                "handle={} request_id={}",
                                pending.handle(),
                                pending.request_id()
                            );
                            host.pending_generations
                                .push(PendingGeneration { client_id, pending });
                            host.metrics.inc_generation_started();
                            log_event("generate_started", client_id, Some(handle), &msg);
                            response_ok_code("GENERATE_STARTED", &msg)
                        }
                        Err(e) => response_err_code(e.code(), &e.to_string()),
                    }
                }
            }
            Err(e) => response_err_code("INVALID_TARGET", &e),
        },
        OpCode::Release => match parse_handle(&header.target) {
            Ok(handle) if host.owns(client_id, handle) => match host.bridge.release_model(handle) {
                Ok(()) => {
                    // Owner entry stays until the next tick so pending error
                    // events still reach this client.
                    host.retired.push(handle);
                    log_event("model_released", client_id, Some(handle), "");
                    response_ok_code("RELEASE", &format!("handle={}", handle))
                }
                Err(e) => response_err_code(e.code(), &e.to_string()),
            },
            Ok(handle) => response_err_code(
                "INVALID_HANDLE",
                &BridgeError::InvalidHandle(handle).to_string(),
            ),
            Err(e) => response_err_code("INVALID_TARGET", &e),
        },
        OpCode::MemoryConfig => match host.bridge.get_memory_configuration() {
            Ok(config) => match serde_json::to_string(&config) {
                Ok(body) => response_ok_code("MEMCFG", &body),
                Err(e) => response_err_code("SERIALIZE", &e.to_string()),
            },
            Err(e) => response_err_code(e.code(), &e.to_string()),
        },
        OpCode::Check => {
            let raw = if text.trim().is_empty() {
                header.target.as_str()
            } else {
                text.as_str()
            };
            match parse_size_mb(raw) {
                Ok(size_mb) => match host.bridge.check_model_capability(size_mb) {
                    Ok(capability) => match serde_json::to_string(&capability) {
                        Ok(body) => response_ok_code("CHECK", &body),
                        Err(e) => response_err_code("SERIALIZE", &e.to_string()),
                    },
                    Err(e) => response_err_code(e.code(), &e.to_string()),
                },
                Err(e) => response_err_code("INVALID_PARAMS", &e),
            }
        }
        OpCode::Status => {
            let snap = host.metrics.snapshot();
            let owned: Vec<u64> = {
                let mut handles: Vec<u64> = host
                    .owners
                    .iter()
                    .filter(|(_, owner)| **owner == client_id)
                    .map(|(h, _)| h.value())
                    .collect();
                handles.sort_unstable();
                handles
            };
            let body = json!({
                "uptime_s": snap.uptime_s,
                "total_commands": snap.total_commands,
                "total_errors": snap.total_errors,
                "creates_started": snap.creates_started,
                "creates_failed": snap.creates_failed,
                "generations_started": snap.generations_started,
                "events_routed": snap.events_routed,
                "live_handles": host.bridge.live_handles().len(),
                "owned_handles": owned,
                "outstanding_requests": host.bridge.outstanding_requests(),
                "pending_creates": host.pending_creates.len(),
            });
            response_ok_code("STATUS", &body.to_string())
        }
        OpCode::Shutdown => {
            host.shutdown_requested = true;
            log_event("shutdown_requested", client_id, None, "");
            response_ok_code("SHUTDOWN", "bridge is stopping")
        }
    };

    host.metrics.record_command(response.starts_with(b"+OK"));
    client.send(response);
}
