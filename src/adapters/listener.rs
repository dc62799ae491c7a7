//! Plaintext and TLS listeners feeding the dispatcher.
//!
//! Every accepted connection is served on its own task by hyper's automatic
//! HTTP/1.1 / HTTP/2 connection builder with upgrades enabled, so WebSocket
//! handshakes can take over the socket after the response.

use std::{net::SocketAddr, sync::Arc};

use axum::body::Body as AxumBody;
use eyre::{Context, Result};
use futures_util::StreamExt;
use hyper::{body::Incoming, service::service_fn};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use rustls::ServerConfig;
use tls_listener::TlsListener;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
};
use tokio_rustls::TlsAcceptor;

use crate::{
    core::dispatcher::Dispatcher, metrics::ConnectionGauge, utils::graceful_shutdown::ShutdownToken,
};

pub async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))
}

/// Accept plaintext connections until shutdown.
pub async fn serve_http(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    mut shutdown: ShutdownToken,
) -> Result<()> {
    tracing::info!(addr = ?listener.local_addr().ok(), "HTTP listener started");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote_addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(remote = %remote_addr, "Failed to set TCP_NODELAY: {}", e);
                    }
                    serve_connection(stream, remote_addr, dispatcher.clone(), false);
                }
                Err(e) => tracing::warn!("Failed to accept connection: {}", e),
            },
            _ = shutdown.wait_for_shutdown() => break,
        }
    }

    tracing::info!("HTTP listener stopped");
    Ok(())
}

/// Accept TLS connections until shutdown. Handshakes for which no
/// certificate is found fail and never reach the dispatcher.
pub async fn serve_https(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    tls_config: Arc<ServerConfig>,
    mut shutdown: ShutdownToken,
) -> Result<()> {
    tracing::info!(addr = ?listener.local_addr().ok(), "HTTPS listener started");
    let mut incoming = TlsListener::new(TlsAcceptor::from(tls_config), listener);

    loop {
        tokio::select! {
            accepted = incoming.next() => match accepted {
                Some(Ok((stream, remote_addr))) => {
                    serve_connection(stream, remote_addr, dispatcher.clone(), true);
                }
                Some(Err(e)) => tracing::debug!("TLS accept error: {}", e),
                None => break,
            },
            _ = shutdown.wait_for_shutdown() => break,
        }
    }

    tracing::info!("HTTPS listener stopped");
    Ok(())
}

fn serve_connection<I>(io: I, remote_addr: SocketAddr, dispatcher: Arc<Dispatcher>, is_secure: bool)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let _gauge = ConnectionGauge::open(if is_secure { "https" } else { "http" });

        let service = service_fn(move |req: hyper::Request<Incoming>| {
            let dispatcher = dispatcher.clone();
            async move {
                dispatcher
                    .handle(req.map(AxumBody::new), is_secure, Some(remote_addr))
                    .await
            }
        });

        if let Err(e) = auto::Builder::new(TokioExecutor::new())
            .serve_connection_with_upgrades(TokioIo::new(io), service)
            .await
        {
            tracing::debug!(remote = %remote_addr, "Connection ended: {}", e);
        }
    });
}
