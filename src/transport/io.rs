use std::io::{self, Read, Write};

use llm_bridge_protocol::response_err_code;

use crate::commands::execute_command;
use crate::runtime::HostState;

use super::{parse_available_commands, Client, ParsedCommand};

/// Reads what is available and executes every complete command. Returns
/// `true` when the connection should be closed.
pub fn handle_read(client: &mut Client, host: &mut HostState, client_id: usize) -> bool {
    let mut chunk = [0; 4096];
    loop {
        match client.stream.read(&mut chunk) {
            Ok(0) => return true,
            Ok(n) => {
                client.buffer.extend_from_slice(&chunk[..n]);
                break;
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return false,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(ref e)
                if e.kind() == io::ErrorKind::ConnectionReset
                    || e.kind() == io::ErrorKind::BrokenPipe =>
            {
                return true;
            }
            Err(e) => {
                tracing::warn!(client_id, error = %e, "read error");
                return true;
            }
        }
    }

    let parsed = parse_available_commands(&mut client.buffer, &mut client.state);
    for command in parsed {
        match command {
            ParsedCommand::Ok { header, payload } => {
                execute_command(client, header, payload, host, client_id)
            }
            ParsedCommand::Err(e) => {
                host.metrics.record_command(false);
                client.send(response_err_code("BAD_HEADER", &e.to_string()));
            }
        }
    }
    false
}

/// Flushes the output buffer. Returns `true` when the peer is gone.
pub fn handle_write(client: &mut Client) -> bool {
    while !client.output_buffer.is_empty() {
        let (head, _) = client.output_buffer.as_slices();
        match client.stream.write(head) {
            Ok(n) => {
                client.output_buffer.drain(..n);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return false,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return true,
        }
    }
    false
}
