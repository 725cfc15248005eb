//! Node wiring: storage, cluster view, worker graph, gRPC and HTTP servers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tracing::{error, info, warn};

use metricgrid_cluster::{RemoteClientManager, RemoteServer, StaticPeers};
use metricgrid_graph::{AppContext, GraphBuilder, Pipeline, SweepReport};
use metricgrid_metrics::MetricsRegistry;
use metricgrid_storage::{RedbStorage, StorageDao};

use crate::config::NodeConfig;
use crate::http::{HttpState, build_router};

/// How long `stop` waits for a task before aborting it. Peers keep their
/// streams into this node open, so the gRPC server may never drain on its
/// own.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// A running metricgrid node.
pub struct Node {
    pipeline: Arc<Pipeline>,
    remote: Arc<RemoteClientManager>,
    grpc_addr: SocketAddr,
    http_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

fn open_storage(config: &NodeConfig) -> anyhow::Result<Arc<dyn StorageDao>> {
    if config.node.in_memory_storage {
        info!("using in-memory storage");
        return Ok(Arc::new(RedbStorage::open_in_memory()?));
    }
    std::fs::create_dir_all(&config.node.data_dir)
        .with_context(|| format!("create data dir {}", config.node.data_dir.display()))?;
    let path = config.node.data_dir.join("metricgrid.redb");
    let storage = RedbStorage::open(&path)?;
    info!(path = ?path, "storage opened");
    Ok(Arc::new(storage))
}

impl Node {
    /// Bind the configured addresses and start.
    pub async fn start(config: NodeConfig) -> anyhow::Result<Self> {
        let grpc = TcpListener::bind(config.node.grpc_addr)
            .await
            .with_context(|| format!("bind grpc {}", config.node.grpc_addr))?;
        let http = TcpListener::bind(config.node.http_addr)
            .await
            .with_context(|| format!("bind http {}", config.node.http_addr))?;
        Self::start_with(config, grpc, http).await
    }

    /// Start on already bound listeners.
    pub async fn start_with(config: NodeConfig, grpc: TcpListener, http: TcpListener) -> anyhow::Result<Self> {
        config.validate()?;
        let grpc_addr = grpc.local_addr()?;
        let http_addr = http.local_addr()?;
        let advertise = config.advertise_addr();
        info!(%grpc_addr, %http_addr, %advertise, "metricd starting");

        // ── Shared services ────────────────────────────────────────
        let telemetry = Arc::new(MetricsRegistry::new());
        let storage = open_storage(&config)?;
        let remote = Arc::new(RemoteClientManager::new(
            advertise,
            Arc::new(StaticPeers::new(config.cluster.peers.clone())),
            config.remote_config(),
            tokio::runtime::Handle::current(),
            Arc::clone(&telemetry),
        ));
        if let Err(e) = remote.refresh() {
            warn!(error = %e, "initial cluster refresh failed");
        }
        let ctx = AppContext::new(Arc::clone(&remote), storage, telemetry);

        // ── Worker graph ───────────────────────────────────────────
        let mut builder = GraphBuilder::new(ctx)
            .with_defaults(config.stage_options())
            .with_sweep(config.sweep_config());
        for def in config.stream_defs()? {
            let roles = builder.metrics_stream(&def)?;
            info!(stream = %def.name, aggregate = %roles.aggregate, persist = %roles.persist, "metrics stream wired");
        }
        let pipeline = Arc::new(builder.build());

        // ── Background tasks ───────────────────────────────────────
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let refresh = Duration::from_secs(config.cluster.refresh_interval_secs);
        tasks.push(("cluster-refresh", tokio::spawn(Arc::clone(&remote).run(refresh, shutdown_rx.clone()))));
        tasks.push(("persistence-sweep", tokio::spawn(pipeline.sweep().run(shutdown_rx.clone()))));

        // ── gRPC server ────────────────────────────────────────────
        let service = RemoteServer::new(pipeline.registry(), &pipeline.context().telemetry).into_service();
        let mut grpc_shutdown = shutdown_rx.clone();
        tasks.push(("grpc", tokio::spawn(async move {
            info!(%grpc_addr, "gRPC server starting");
            if let Err(e) = tonic::transport::Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(TcpListenerStream::new(grpc), async move {
                    let _ = grpc_shutdown.changed().await;
                })
                .await
            {
                error!(error = %e, "gRPC server error");
            }
        })));

        // ── HTTP server ────────────────────────────────────────────
        let router = build_router(HttpState {
            pipeline: Arc::clone(&pipeline),
        });
        let mut http_shutdown = shutdown_rx;
        tasks.push(("http", tokio::spawn(async move {
            info!(%http_addr, "HTTP server starting");
            if let Err(e) = axum::serve(http, router)
                .with_graceful_shutdown(async move {
                    let _ = http_shutdown.changed().await;
                })
                .await
            {
                error!(error = %e, "HTTP server error");
            }
        })));

        Ok(Self {
            pipeline,
            remote,
            grpc_addr,
            http_addr,
            shutdown,
            tasks,
        })
    }

    pub fn grpc_addr(&self) -> SocketAddr {
        self.grpc_addr
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn remote(&self) -> &Arc<RemoteClientManager> {
        &self.remote
    }

    pub fn storage(&self) -> &Arc<dyn StorageDao> {
        &self.pipeline.context().storage
    }

    /// Stop servers and background loops, drain the worker graph, and run
    /// the final sweep.
    pub async fn stop(self) -> anyhow::Result<SweepReport> {
        info!("shutting down");
        let _ = self.shutdown.send(true);
        for (name, mut task) in self.tasks {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(task = name, error = %e, "background task ended abnormally"),
                Err(_) => {
                    warn!(task = name, "task did not stop in time, aborting");
                    task.abort();
                }
            }
        }

        let pipeline = Arc::clone(&self.pipeline);
        let report = tokio::task::spawn_blocking(move || pipeline.shutdown()).await??;
        self.remote.shutdown();
        info!(written = report.written(), dropped = report.dropped(), "metricd stopped");
        Ok(report)
    }
}
