mod client;
mod framing;
mod io;

use mio::Interest;

pub use self::client::{Client, ClientState, ParsedCommand};
pub use self::framing::parse_available_commands;
pub use self::io::{handle_read, handle_write};

pub fn needs_writable_interest(client: &Client) -> bool {
    !client.output_buffer.is_empty()
}

pub fn writable_interest() -> Interest {
    Interest::READABLE | Interest::WRITABLE
}
