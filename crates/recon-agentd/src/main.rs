mod config;

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use recon_api::{HttpApi, NodeApiAdapter};
use recon_core::{FileCapture, NoUpstream, Node, NodeDeps, UpstreamNotifier};
use recon_observe::logger_init;
use recon_peer::{HttpPeer, HttpUpstream};
use recon_prometheus::PrometheusMetrics;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::config::AgentConfig;

fn main() -> anyhow::Result<()> {
    let cfg = AgentConfig::load().context("loading configuration")?;
    logger_init(&cfg.logger).context("initializing logger")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("recon-agentd")
        .max_blocking_threads(cfg.max_blocking_threads)
        .build()
        .context("building tokio runtime")?;

    runtime.block_on(run(cfg))
}

async fn run(cfg: AgentConfig) -> anyhow::Result<()> {
    let metrics = Arc::new(PrometheusMetrics::new().context("registering metrics")?);
    let peer = HttpPeer::new(&cfg.peer_config()).context("building http client")?;

    let upstream: Arc<dyn UpstreamNotifier> = match &cfg.upstream {
        Some(address) => Arc::new(HttpUpstream::new(peer.clone(), address.clone())),
        None => Arc::new(NoUpstream),
    };
    let peer = Arc::new(peer);
    let deps = NodeDeps::new(
        peer.clone(),
        upstream,
        peer,
        Arc::new(FileCapture::new(cfg.capture_path.clone())),
    )
    .with_metrics(metrics.clone());

    let settings = cfg.node_settings();
    if settings.tier.is_coordinator() && settings.token.is_empty() {
        warn!("no registration token configured, every registration will be rejected");
    }
    let node = Arc::new(Node::open(settings, deps).await);

    let app = HttpApi::new(Arc::new(NodeApiAdapter::new(node.clone())))
        .router()
        .merge(
            Router::new()
                .route("/metrics", get(render_metrics))
                .with_state(metrics),
        );

    let listener = TcpListener::bind(cfg.listen)
        .await
        .with_context(|| format!("binding {}", cfg.listen))?;
    info!(
        listen = %cfg.listen,
        tier = %node.tier(),
        node = %node.node_id(),
        "recon-agentd listening"
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("http server")?;

    node.shutdown().await;
    Ok(())
}

/// GET /metrics
async fn render_metrics(State(metrics): State<Arc<PrometheusMetrics>>) -> impl IntoResponse {
    match metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, metrics.content_type())],
            body,
        ),
        Err(e) => {
            error!(error = %e, "metrics encoding failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                format!("# metrics encoding failed: {e}\n"),
            )
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
