//! Remote dispatch gRPC server: receiving side.
//!
//! Implements the `RemoteService` `Call` stream. Each inbound message is
//! decoded against the schema of its target role and handed to the local
//! worker graph. Bad messages are answered with an error `Ack`; the stream
//! stays open.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, warn};

use metricgrid_core::{Record, RoleId, Schema};
use metricgrid_metrics::{Counter, MetricsRegistry};

use crate::codec;
use crate::error::DispatchError;
use crate::proto::remote_service_server::{RemoteService, RemoteServiceServer};
use crate::proto::{Ack, RemoteMessage};

/// Local entry points of the worker graph, looked up by role id.
pub trait LocalDispatch: Send + Sync + 'static {
    fn schema_of(&self, role: RoleId) -> Option<Arc<Schema>>;

    /// Enqueue `record` into the local stage of `role`. Must return within
    /// a bounded time, rejecting the record if the stage stays full.
    fn dispatch_local(&self, role: RoleId, record: Record) -> Result<(), DispatchError>;
}

struct Inbound<D> {
    dispatch: Arc<D>,
    in_count: Arc<Counter>,
    in_errors: Arc<Counter>,
}

impl<D: LocalDispatch> Inbound<D> {
    fn dispatch(&self, message: RemoteMessage) -> Result<(), DispatchError> {
        let role = RoleId(message.worker_role_id);
        let schema = self
            .dispatch
            .schema_of(role)
            .ok_or(DispatchError::UnknownRole(role))?;
        let record = codec::decode(&schema, message)?;
        self.dispatch.dispatch_local(role, record)
    }

    /// Handle one message; returns the `Ack` to send back, if any.
    fn handle(&self, message: RemoteMessage) -> Option<Ack> {
        if message.heartbeat {
            return Some(Ack {
                worker_role_id: 0,
                error: String::new(),
                heartbeat: true,
            });
        }

        let role = message.worker_role_id;
        match self.dispatch(message) {
            Ok(()) => {
                self.in_count.inc();
                None
            }
            Err(e) => {
                self.in_errors.inc();
                warn!(role, error = %e, "rejected remote record");
                Some(Ack {
                    worker_role_id: role,
                    error: e.to_string(),
                    heartbeat: false,
                })
            }
        }
    }
}

/// gRPC implementation of the remote dispatch service.
pub struct RemoteServer<D> {
    inbound: Arc<Inbound<D>>,
}

impl<D: LocalDispatch> RemoteServer<D> {
    pub fn new(dispatch: Arc<D>, telemetry: &MetricsRegistry) -> Self {
        Self {
            inbound: Arc::new(Inbound {
                dispatch,
                in_count: telemetry.counter("remote_in_count", "Records received from peers.", &[]),
                in_errors: telemetry.counter(
                    "remote_in_error_count",
                    "Records from peers that were rejected.",
                    &[],
                ),
            }),
        }
    }

    /// Get the tonic service for mounting on a gRPC server.
    pub fn into_service(self) -> RemoteServiceServer<Self> {
        RemoteServiceServer::new(self)
    }
}

#[tonic::async_trait]
impl<D: LocalDispatch> RemoteService for RemoteServer<D> {
    type CallStream = ReceiverStream<Result<Ack, Status>>;

    async fn forward(
        &self,
        request: Request<Streaming<RemoteMessage>>,
    ) -> Result<Response<Self::CallStream>, Status> {
        let remote = request.remote_addr();
        let mut stream = request.into_inner();
        let (tx, rx) = mpsc::channel(64);
        let inbound = Arc::clone(&self.inbound);
        let runtime = Handle::current();

        debug!(?remote, "remote stream opened");
        // Local dispatch may wait briefly on a full stage queue, so the
        // stream is drained on a blocking thread rather than a runtime worker.
        tokio::task::spawn_blocking(move || {
            loop {
                match runtime.block_on(stream.message()) {
                    Ok(Some(message)) => {
                        if let Some(ack) = inbound.handle(message) {
                            if tx.blocking_send(Ok(ack)).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(status) => {
                        debug!(?remote, error = %status, "remote stream error");
                        break;
                    }
                }
            }
            debug!(?remote, "remote stream closed");
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
