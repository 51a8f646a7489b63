use llm_bridge_protocol::CommandHeader;

use super::{ClientState, ParsedCommand};

/// Splits the buffered bytes into complete commands, leaving any trailing
/// partial header or body in place for the next read.
pub fn parse_available_commands(buffer: &mut Vec<u8>, state: &mut ClientState) -> Vec<ParsedCommand> {
    let mut parsed = Vec::new();

    loop {
        match state {
            ClientState::WaitingForHeader => {
                let Some(pos) = buffer.iter().position(|&b| b == b'\n') else {
                    break;
                };
                let header_bytes = buffer.drain(..=pos).collect::<Vec<u8>>();
                let header_str = String::from_utf8_lossy(&header_bytes).trim().to_string();
                if header_str.is_empty() {
                    continue;
                }

                match CommandHeader::parse(&header_str) {
                    Ok(header) if header.content_length == 0 => parsed.push(ParsedCommand::Ok {
                        header,
                        payload: Vec::new(),
                    }),
                    Ok(header) => *state = ClientState::ReadingBody { header },
                    Err(e) => parsed.push(ParsedCommand::Err(e)),
                }
            }
            ClientState::ReadingBody { header } => {
                if buffer.len() < header.content_length {
                    break;
                }
                let payload = buffer.drain(..header.content_length).collect::<Vec<u8>>();
                let header = header.clone();
                parsed.push(ParsedCommand::Ok { header, payload });
                *state = ClientState::WaitingForHeader;
            }
        }
    }

    parsed
}
