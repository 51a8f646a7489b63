use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpCode {
    Ping,         // Ping-Pong
    Available,    // Verifica di disponibilità del bridge
    Create,       // Crea modello da path o URI
    CreateAsset,  // Crea modello da asset incluso
    Generate,     // Avvia generazione in streaming
    Release,      // Libera il modello
    MemoryConfig, // Profilo e limiti di memoria
    Check,        // Verifica se un modello entra in memoria
    Status,       // Contatori e handle del client
    Shutdown,     // Arresta il bridge
}

impl OpCode {
    pub fn verb(self) -> &'static str {
        match self {
            OpCode::Ping => "PING",
            OpCode::Available => "AVAILABLE",
            OpCode::Create => "CREATE",
            OpCode::CreateAsset => "CREATE_ASSET",
            OpCode::Generate => "GENERATE",
            OpCode::Release => "RELEASE",
            OpCode::MemoryConfig => "MEMCFG",
            OpCode::Check => "CHECK",
            OpCode::Status => "STATUS",
            OpCode::Shutdown => "SHUTDOWN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Empty header")]
    EmptyHeader,
    #[error("Unknown opcode: {0}")]
    UnknownOpcode(String),
    #[error("Invalid content length '{0}'")]
    InvalidLength(String),
    #[error("Content length {length} exceeds limit {limit}")]
    PayloadTooLarge { length: usize, limit: usize },
}

/// Upper bound for a single command body (prompts included).
pub const MAX_PAYLOAD_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandHeader {
    pub opcode: OpCode,
    pub target: String,
    pub content_length: usize,
}

impl CommandHeader {
    /// Parses the header line: "VERB Target Length".
    /// Example: "GENERATE 3/17 42"
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let parts: Vec<&str> = line.split_whitespace().collect();

        if parts.is_empty() {
            return Err(ProtocolError::EmptyHeader);
        }

        let opcode = match parts[0].to_uppercase().as_str() {
            "PING" => OpCode::Ping,
            "AVAILABLE" => OpCode::Available,
            "CREATE" => OpCode::Create,
            "CREATE_ASSET" => OpCode::CreateAsset,
            "GENERATE" => OpCode::Generate,
            "RELEASE" => OpCode::Release,
            "MEMCFG" => OpCode::MemoryConfig,
            "CHECK" => OpCode::Check,
            "STATUS" => OpCode::Status,
            "SHUTDOWN" => OpCode::Shutdown,
            _ => return Err(ProtocolError::UnknownOpcode(parts[0].to_string())),
        };

        // Comandi senza argomenti (es. PING)
        let target = if parts.len() > 1 {
            parts[1].to_string()
        } else {
            "-".to_string()
        };

        let content_length = if parts.len() > 2 {
            parts[2]
                .parse::<usize>()
                .map_err(|_| ProtocolError::InvalidLength(parts[2].to_string()))?
        } else {
            0
        };

        if content_length > MAX_PAYLOAD_BYTES {
            return Err(ProtocolError::PayloadTooLarge {
                length: content_length,
                limit: MAX_PAYLOAD_BYTES,
            });
        }

        Ok(CommandHeader {
            opcode,
            target,
            content_length,
        })
    }
}

pub fn response_ok_code(code: &str, msg: &str) -> Vec<u8> {
    format!("+OK {} {}\r\n", code, single_line(msg)).into_bytes()
}

pub fn response_err_code(code: &str, msg: &str) -> Vec<u8> {
    format!("-ERR {} {}\r\n", code, single_line(msg)).into_bytes()
}

/// Out-of-band event frame: header line followed by a JSON body.
pub fn response_event(name: &str, body: &[u8]) -> Vec<u8> {
    let header = format!("EVENT {} {}\r\n", name, body.len());
    let mut vec = header.into_bytes();
    vec.extend_from_slice(body);
    vec
}

fn single_line(msg: &str) -> String {
    msg.replace(['\r', '\n'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_generate_header_with_target() {
        let header = CommandHeader::parse("generate 3/17 42").expect("valid header");
        assert_eq!(header.opcode, OpCode::Generate);
        assert_eq!(header.target, "3/17");
        assert_eq!(header.content_length, 42);
    }

    #[test]
    fn bare_verb_defaults_target_and_length() {
        let header = CommandHeader::parse("PING").expect("valid header");
        assert_eq!(header.opcode, OpCode::Ping);
        assert_eq!(header.target, "-");
        assert_eq!(header.content_length, 0);
    }

    #[test]
    fn rejects_unknown_verbs_and_bad_lengths() {
        assert_eq!(
            CommandHeader::parse("EXEC 1 5"),
            Err(ProtocolError::UnknownOpcode("EXEC".to_string()))
        );
        assert_eq!(
            CommandHeader::parse("CREATE - abc"),
            Err(ProtocolError::InvalidLength("abc".to_string()))
        );
        assert_eq!(CommandHeader::parse("   "), Err(ProtocolError::EmptyHeader));
    }

    #[test]
    fn rejects_oversized_payloads() {
        let line = format!("GENERATE 1 {}", MAX_PAYLOAD_BYTES + 1);
        assert!(matches!(
            CommandHeader::parse(&line),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn event_frame_carries_length_prefix() {
        let frame = response_event("onPartialResponse", b"{\"a\":1}");
        assert_eq!(frame, b"EVENT onPartialResponse 7\r\n{\"a\":1}".to_vec());
    }

    #[test]
    fn control_replies_stay_on_one_line() {
        let frame = response_err_code("GENERATION_FAILED", "line one\nline two");
        assert_eq!(frame, b"-ERR GENERATION_FAILED line one line two\r\n".to_vec());
    }
}
