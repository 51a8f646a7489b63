use std::collections::VecDeque;

use llm_bridge_protocol::{CommandHeader, ProtocolError};

pub enum ClientState {
    WaitingForHeader,
    ReadingBody { header: CommandHeader },
}

pub enum ParsedCommand {
    Ok {
        header: CommandHeader,
        payload: Vec<u8>,
    },
    Err(ProtocolError),
}

pub struct Client {
    pub stream: mio::net::TcpStream,
    pub buffer: Vec<u8>,
    pub output_buffer: VecDeque<u8>,
    pub state: ClientState,
}

impl Client {
    pub fn new(stream: mio::net::TcpStream) -> Self {
        Self {
            stream,
            buffer: Vec::with_capacity(4096),
            output_buffer: VecDeque::new(),
            state: ClientState::WaitingForHeader,
        }
    }

    pub fn send(&mut self, frame: Vec<u8>) {
        self.output_buffer.extend(frame);
    }
}
