mod commands;
mod runtime;
mod transport;

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use mediapipe_llm_bridge::config::BridgeConfig;
use mediapipe_llm_bridge::{ChannelEmitter, LlmBridge};

use runtime::{run_bridge_tick, HostState};
use transport::{handle_read, handle_write, needs_writable_interest, Client};

const SERVER: Token = Token(0);

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("mediapipe_llm_bridge=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = BridgeConfig::load_from_env().context("loading bridge configuration")?;
    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen_addr '{}'", config.listen_addr))?;

    let (emitter, events_rx) = ChannelEmitter::channel();
    let bridge = Arc::new(LlmBridge::from_config(&config, Arc::new(emitter)));
    let mut host = HostState::new(bridge, events_rx, config.defaults);

    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(128);

    let mut server = TcpListener::bind(addr).with_context(|| format!("binding {}", addr))?;
    poll.registry()
        .register(&mut server, SERVER, Interest::READABLE)?;

    let mut clients: HashMap<Token, Client> = HashMap::new();
    let mut unique_token = Token(SERVER.0 + 1);

    tracing::info!(%addr, engine = %config.engine.program, "LLM bridge ready");

    loop {
        poll.poll(&mut events, Some(Duration::from_millis(5)))?;

        for event in events.iter() {
            match event.token() {
                SERVER => loop {
                    match server.accept() {
                        Ok((mut stream, peer)) => {
                            let token = unique_token;
                            unique_token.0 += 1;
                            tracing::info!(%peer, client_id = token.0, "new connection");
                            poll.registry()
                                .register(&mut stream, token, Interest::READABLE)?;
                            clients.insert(token, Client::new(stream));
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => tracing::warn!(error = %e, "accept error"),
                    }
                },
                token => {
                    let Some(client) = clients.get_mut(&token) else {
                        continue;
                    };
                    let mut should_close = false;

                    if event.is_readable() && handle_read(client, &mut host, token.0) {
                        should_close = true;
                    }
                    if !should_close && event.is_writable() && handle_write(client) {
                        should_close = true;
                    }

                    if should_close {
                        if let Some(mut client) = clients.remove(&token) {
                            let _ = poll.registry().deregister(&mut client.stream);
                        }
                        host.release_client(token.0);
                        continue;
                    }

                    let interest = if needs_writable_interest(client) {
                        Interest::READABLE | Interest::WRITABLE
                    } else {
                        Interest::READABLE
                    };
                    poll.registry()
                        .reregister(&mut client.stream, token, interest)?;
                }
            }
        }

        run_bridge_tick(&mut host, &mut clients, &poll);

        if host.shutdown_requested {
            let flushed = clients.values_mut().all(|client| {
                handle_write(client);
                client.output_buffer.is_empty()
            });
            if flushed {
                tracing::info!(live = host.bridge.live_handles().len(), "shutting down");
                break;
            }
        }
    }

    for handle in host.bridge.live_handles() {
        if let Err(e) = host.bridge.release_model(handle) {
            tracing::warn!(handle = %handle, error = %e, "release at shutdown failed");
        }
    }
    Ok(())
}
