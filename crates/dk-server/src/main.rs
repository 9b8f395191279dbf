#![forbid(unsafe_code)]

//! The `driftkv` server binary: wires a store with a lazyfree pool into
//! the event loop and runs it until the process is killed.

use std::net::SocketAddr;
use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dk_eventloop::EventLoop;
use dk_lazyfree::DropPool;
use dk_store::Store;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const DEFAULT_ADDR: &str = "127.0.0.1:8000";
const LAZYFREE_WORKERS: usize = 4;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let addr = match listen_addr() {
        Ok(addr) => addr,
        Err(message) => {
            error!("{message}");
            return ExitCode::FAILURE;
        }
    };

    let store = Store::with_lazyfree(DropPool::new(LAZYFREE_WORKERS));
    let server = match EventLoop::bind(addr, store) {
        Ok(server) => server,
        Err(error) => {
            error!(%addr, %error, "failed to bind");
            return ExitCode::FAILURE;
        }
    };
    info!(%addr, "listening");

    match server.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "event loop failed");
            ExitCode::FAILURE
        }
    }
}

/// First CLI argument, then `DRIFTKV_ADDR`, then the default.
fn listen_addr() -> Result<SocketAddr, String> {
    let raw = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("DRIFTKV_ADDR").ok())
        .unwrap_or_else(|| DEFAULT_ADDR.to_string());
    raw.parse()
        .map_err(|_| format!("invalid listen address '{raw}'"))
}
