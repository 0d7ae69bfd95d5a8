//! Transport bindings: stdio, SSE, and streamable HTTP. Thin adapters around
//! [`OsServer`]; all of them force-stop running processes and release the
//! output store on the way out.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use rmcp::transport::{stdio, SseServer, sse_server::SseServerConfig};
use rmcp::transport::streamable_http_server::session::local::LocalSessionManager;
use rmcp::transport::streamable_http_server::StreamableHttpService;
use rmcp::ServiceExt;
use tokio_util::sync::CancellationToken;

use crate::server::OsServer;

/// Serve over stdin/stdout until the client disconnects.
pub async fn serve_stdio(server: OsServer) -> Result<()> {
    let service = server
        .clone()
        .serve(stdio())
        .await
        .inspect_err(|e| tracing::error!("serving error: {e:?}"))?;
    service.waiting().await?;
    server.shutdown().await;
    Ok(())
}

/// Serve over SSE (GET stream + POST messages) until ctrl-c.
pub async fn serve_sse(server: OsServer, host: &str, port: u16, prefix: &str) -> Result<()> {
    let bind_addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid bind address {host}:{port}"))?;
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    let local_addr = listener.local_addr()?;

    let shutdown = CancellationToken::new();
    let (sse_server, router) = SseServer::new(SseServerConfig {
        bind: local_addr,
        sse_path: format!("{prefix}/sse"),
        post_path: format!("{prefix}/message"),
        ct: shutdown.clone(),
        sse_keep_alive: None,
    });
    let _ct = sse_server.with_service_directly({
        let server = server.clone();
        move || server.clone()
    });

    tracing::info!("listening on http://{local_addr}{prefix}/sse");
    serve_axum(listener, router, shutdown).await?;
    server.shutdown().await;
    Ok(())
}

/// Serve over streamable HTTP until ctrl-c.
pub async fn serve_http(server: OsServer, host: &str, port: u16, prefix: &str) -> Result<()> {
    let bind_addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid bind address {host}:{port}"))?;
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    let local_addr = listener.local_addr()?;

    let service = StreamableHttpService::new(
        {
            let server = server.clone();
            move || Ok(server.clone())
        },
        LocalSessionManager::default().into(),
        Default::default(),
    );
    let router = axum::Router::new().nest_service(&format!("{prefix}/mcp"), service);

    tracing::info!("listening on http://{local_addr}{prefix}/mcp");
    serve_axum(listener, router, CancellationToken::new()).await?;
    server.shutdown().await;
    Ok(())
}

async fn serve_axum(
    listener: tokio::net::TcpListener,
    router: axum::Router,
    shutdown: CancellationToken,
) -> Result<()> {
    let ctrl_c_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_shutdown.cancel();
        }
    });
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
        })
        .await
        .context("http server stopped with error")
}
