//! Single-threaded relay runtime.
//!
//! Components, leaves first:
//! - `buffer`: per-client line framing and outbound queues
//! - `token`: client identifiers and poll tokens
//! - `protocol`: the three server-to-client message formats
//! - `connection`: client state and the registry of active clients
//! - `mio_impl`: the readiness-driven event loop tying them together

mod buffer;
mod connection;
mod mio_impl;
mod protocol;
mod token;

pub use mio_impl::EventLoop;

use crate::config::Config;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use tracing::info;

/// Process-fatal runtime errors.
///
/// Faults scoped to one connection never surface here; they only tear
/// down that connection.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("failed to set up listener on {addr}: {source}")]
    Setup {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("readiness wait failed: {0}")]
    Wait(#[source] io::Error),
}

/// Bind the configured address and serve until a fatal error.
pub fn run(config: &Config) -> Result<(), RelayError> {
    let display_addr = format!("{}:{}", config.host, config.port);
    let setup = |source: io::Error| RelayError::Setup {
        addr: display_addr.clone(),
        source,
    };

    let addr = resolve(&config.host, config.port).map_err(setup)?;
    let listener = bind_listener(addr, config.backlog).map_err(setup)?;
    let mut event_loop = EventLoop::new(listener, config).map_err(setup)?;

    info!(
        addr = %addr,
        backlog = config.backlog,
        max_line_len = config.max_line_len,
        "Relay listening"
    );

    event_loop.run().map_err(RelayError::Wait)
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no address found for {host}"),
        )
    })
}

/// Create a non-blocking TCP listener.
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
