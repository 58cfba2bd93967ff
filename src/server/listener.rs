use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::http::connection::{Conn, Wait};
use crate::server::host::Host;
use crate::server::transport::TcpTransport;

const EXPIRY_INTERVAL: Duration = Duration::from_secs(1);

pub async fn run(cfg: &Config) -> anyhow::Result<()> {
    let host = Arc::new(Host::from_config(cfg)?);
    let listener = TcpListener::bind(&cfg.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.server.listen_addr))?;
    info!("Listening on {}", cfg.server.listen_addr);
    serve(listener, host).await
}

/// Accepts connections on `listener` and runs the expiry scan.
pub async fn serve(listener: TcpListener, host: Arc<Host>) -> anyhow::Result<()> {
    let mut expiry = tokio::time::interval(EXPIRY_INTERVAL);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        continue;
                    }
                };
                info!("Accepted connection from {}", peer);

                let host = host.clone();
                tokio::spawn(async move {
                    if let Err(e) = drive(socket, peer, host).await {
                        error!("Connection error from {}: {}", peer, e);
                    }
                });
            }
            _ = expiry.tick() => {
                host.expire_connections();
            }
        }
    }
}

/// Runs one connection to completion, waiting on whatever readiness the
/// state machine asks for or on an expiry wake-up.
pub async fn drive(socket: TcpStream, peer: SocketAddr, host: Arc<Host>) -> anyhow::Result<()> {
    socket.set_nodelay(true)?;
    let stream = Arc::new(socket);
    let mut conn = Conn::new(Box::new(TcpTransport::new(stream.clone())), host, peer);
    let wake = conn.wake_handle();

    let mut wait = Wait::Read;
    loop {
        wait = match wait {
            Wait::Close => break,
            Wait::Read => tokio::select! {
                ready = stream.readable() => {
                    ready?;
                    conn.on_readable()
                }
                _ = wake.notified() => conn.on_expired(),
            },
            Wait::Write => tokio::select! {
                ready = stream.writable() => {
                    ready?;
                    conn.on_writable()
                }
                _ = wake.notified() => conn.on_expired(),
            },
        };
    }
    Ok(())
}
