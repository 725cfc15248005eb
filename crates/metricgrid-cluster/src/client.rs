//! Outbound connection to one peer.
//!
//! Each remote peer gets a bounded channel and one background task that
//! keeps a single `Call` stream open, reconnecting with exponential backoff.
//! `push` never waits: it either queues the message or fails fast, and a
//! message lost with a broken stream is not resent.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info, warn};

use metricgrid_core::{Record, RoleId};
use metricgrid_metrics::{Counter, MetricsRegistry};

use crate::codec;
use crate::error::TransportError;
use crate::peer::Peer;
use crate::proto::RemoteMessage;
use crate::proto::remote_service_client::RemoteServiceClient;

/// Connection tuning shared by every remote client.
#[derive(Debug, Clone)]
pub struct RemoteClientConfig {
    pub channel_capacity: usize,
    pub connect_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for RemoteClientConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            connect_timeout: Duration::from_secs(3),
            backoff_initial: Duration::from_millis(200),
            backoff_max: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(5),
        }
    }
}

/// State of the link to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// First connect in progress; pushes are buffered.
    Connecting,
    Connected,
    /// Last connect or stream failed; pushes fail fast.
    Down,
}

#[derive(Debug)]
struct Link(AtomicU8);

impl Link {
    fn new() -> Self {
        Link(AtomicU8::new(0))
    }

    fn set(&self, state: LinkState) {
        let v = match state {
            LinkState::Connecting => 0,
            LinkState::Connected => 1,
            LinkState::Down => 2,
        };
        self.0.store(v, Ordering::Release);
    }

    fn get(&self) -> LinkState {
        match self.0.load(Ordering::Acquire) {
            0 => LinkState::Connecting,
            1 => LinkState::Connected,
            _ => LinkState::Down,
        }
    }
}

/// Client side of the remote dispatch stream to one peer.
pub struct RemoteClient {
    peer: Peer,
    tx: mpsc::Sender<RemoteMessage>,
    link: Arc<Link>,
    task: JoinHandle<()>,
    out_count: Arc<Counter>,
    out_errors: Arc<Counter>,
}

impl RemoteClient {
    /// Start the background connection task on `runtime`.
    pub fn spawn(
        peer: Peer,
        config: RemoteClientConfig,
        runtime: &Handle,
        telemetry: &MetricsRegistry,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let link = Arc::new(Link::new());
        let labels = [("dest", peer.address.as_str())];
        let out_count = telemetry.counter("remote_out_count", "Records forwarded to peers.", &labels);
        let out_errors = telemetry.counter(
            "remote_out_error_count",
            "Records dropped on the way to peers.",
            &labels,
        );

        let task = runtime.spawn(run_link(
            peer.clone(),
            config,
            rx,
            Arc::clone(&link),
            Arc::clone(&out_errors),
        ));
        debug!(peer = %peer, "remote client started");

        Self {
            peer,
            tx,
            link,
            task,
            out_count,
            out_errors,
        }
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn state(&self) -> LinkState {
        self.link.get()
    }

    /// Queue a record for `role` on the peer. Never blocks.
    pub fn push(&self, role: RoleId, record: &Record) -> Result<(), TransportError> {
        let peer = || self.peer.address.clone();
        if self.link.get() == LinkState::Down {
            self.out_errors.inc();
            return Err(TransportError::Unavailable { peer: peer() });
        }
        match self.tx.try_send(codec::encode(role, record)) {
            Ok(()) => {
                self.out_count.inc();
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.out_errors.inc();
                Err(TransportError::Backpressure { peer: peer() })
            }
            Err(TrySendError::Closed(_)) => {
                self.out_errors.inc();
                Err(TransportError::Closed { peer: peer() })
            }
        }
    }

    /// Stop the connection task. Queued messages are discarded.
    pub fn close(&self) {
        self.task.abort();
    }
}

impl Drop for RemoteClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn connect(peer: &Peer, config: &RemoteClientConfig) -> Result<Channel, String> {
    let endpoint = format!("http://{}", peer.address);
    let ep = Endpoint::from_shared(endpoint.clone())
        .map_err(|e| format!("invalid endpoint {endpoint}: {e}"))?
        .connect_timeout(config.connect_timeout);
    ep.connect()
        .await
        .map_err(|e| format!("connect to {endpoint}: {e}"))
}

enum SessionEnd {
    /// The client handle was dropped.
    Closed,
    Failed(String),
}

/// Reconnect loop. Runs until the sending side is dropped.
async fn run_link(
    peer: Peer,
    config: RemoteClientConfig,
    mut rx: mpsc::Receiver<RemoteMessage>,
    link: Arc<Link>,
    out_errors: Arc<Counter>,
) {
    let mut backoff = config.backoff_initial;
    loop {
        match connect(&peer, &config).await {
            Ok(channel) => {
                backoff = config.backoff_initial;
                link.set(LinkState::Connected);
                info!(peer = %peer, "connected to peer");
                match session(&peer, channel, &config, &mut rx, &out_errors).await {
                    SessionEnd::Closed => return,
                    SessionEnd::Failed(error) => {
                        warn!(peer = %peer, %error, "remote stream failed");
                    }
                }
            }
            Err(error) => {
                warn!(peer = %peer, %error, retry_in = ?backoff, "peer unreachable");
            }
        }
        link.set(LinkState::Down);

        // Messages queued before the link went down are dropped.
        let mut dropped = 0;
        let closed = loop {
            match rx.try_recv() {
                Ok(_) => dropped += 1,
                Err(TryRecvError::Empty) => break false,
                Err(TryRecvError::Disconnected) => break true,
            }
        };
        if dropped > 0 {
            out_errors.add(dropped);
            warn!(peer = %peer, dropped, "dropped queued records for unavailable peer");
        }
        if closed {
            return;
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(config.backoff_max);
    }
}

/// Drive one open `Call` stream until it fails or the client is dropped.
async fn session(
    peer: &Peer,
    channel: Channel,
    config: &RemoteClientConfig,
    rx: &mut mpsc::Receiver<RemoteMessage>,
    out_errors: &Counter,
) -> SessionEnd {
    let (out_tx, out_rx) = mpsc::channel(config.channel_capacity.max(1));
    let mut client = RemoteServiceClient::new(channel);
    let mut acks = match client.forward(ReceiverStream::new(out_rx)).await {
        Ok(response) => response.into_inner(),
        Err(status) => return SessionEnd::Failed(status.to_string()),
    };

    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            message = rx.recv() => {
                let Some(message) = message else {
                    return SessionEnd::Closed;
                };
                if out_tx.send(message).await.is_err() {
                    out_errors.inc();
                    return SessionEnd::Failed("outbound stream closed".to_string());
                }
            }
            _ = heartbeat.tick() => {
                if out_tx.send(RemoteMessage::heartbeat()).await.is_err() {
                    return SessionEnd::Failed("outbound stream closed".to_string());
                }
            }
            ack = acks.message() => match ack {
                Ok(Some(ack)) if !ack.error.is_empty() => {
                    warn!(peer = %peer, role = ack.worker_role_id, error = %ack.error, "peer rejected record");
                }
                Ok(Some(ack)) => {
                    if ack.heartbeat {
                        debug!(peer = %peer, "heartbeat acknowledged");
                    }
                }
                Ok(None) => return SessionEnd::Failed("peer closed stream".to_string()),
                Err(status) => return SessionEnd::Failed(status.to_string()),
            }
        }
    }
}
