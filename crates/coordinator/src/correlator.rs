//! Request/acknowledgment correlation over a single connection.
//!
//! A request subscribes to the connection's inbound stream, sends its frame,
//! then races the stream against a timer. Whichever side finishes first
//! drops the other, so a finished request never leaves a subscription behind.

use std::path::Path;
use std::time::Duration;

use scan_pool_types::protocol::{ACTION_JOB_STATUS, ACTION_LAST_FOUND};
use scan_pool_types::{ClientBound, ConnectionId, Envelope, Job, JobId};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CoordinatorError, Result};
use crate::registry::Registry;

#[derive(Clone)]
pub struct Correlator {
    registry: Registry,
    timeout: Duration,
}

impl Correlator {
    pub fn new(registry: Registry, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send `message` and resolve with the first inbound frame on the same
    /// connection that satisfies `predicate`.
    pub async fn send_and_await<P>(
        &self,
        connection: ConnectionId,
        message: &ClientBound,
        predicate: P,
        timeout: Duration,
    ) -> Result<Envelope>
    where
        P: Fn(&Envelope) -> bool,
    {
        // subscribe before sending so a fast reply cannot slip past
        let mut inbound = self.registry.subscribe_inbound(connection)?;
        self.registry.send(connection, message)?;

        let reply = async {
            loop {
                match inbound.recv().await {
                    Ok(envelope) if predicate(&envelope) => return Ok(envelope),
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(connection_id = %connection, skipped, "reply wait lagged behind inbound frames");
                    }
                    Err(RecvError::Closed) => {
                        return Err(CoordinatorError::ConnectionClosed(connection))
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, reply).await {
            Ok(result) => result,
            Err(_) => Err(CoordinatorError::Timeout(timeout)),
        }
    }

    /// Send a command carrying `id` and wait for `{action: "akn", id}`.
    pub async fn command(&self, connection: ConnectionId, id: &str, message: &ClientBound) -> Result<()> {
        self.send_and_await(connection, message, |env| env.is_akn_for(id), self.timeout)
            .await
            .map(|_| ())
    }

    /// Validate and send `job_start`. The job id doubles as the command id.
    ///
    /// Invalid cube bounds fail before anything is sent. A missing or late
    /// acknowledgment resolves to `Ok(None)`.
    pub async fn start_job(&self, connection: ConnectionId, job: &Job) -> Result<Option<JobId>> {
        job.job_options.validate()?;
        let message = ClientBound::JobStart {
            id: job.id.clone(),
            data: job.job_options.clone(),
        };
        match self.command(connection, &job.id, &message).await {
            Ok(()) => {
                info!(connection_id = %connection, job_id = %job.id, mode = %job.mode(), "job started");
                Ok(Some(job.id.clone()))
            }
            Err(e @ (CoordinatorError::Timeout(_) | CoordinatorError::ConnectionClosed(_))) => {
                warn!(connection_id = %connection, job_id = %job.id, error = %e, "job_start not acknowledged");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Send `job_stop` with a fresh id. `Ok(false)` when not acknowledged.
    pub async fn stop_job(&self, connection: ConnectionId) -> Result<bool> {
        let id = Uuid::new_v4().to_string();
        let message = ClientBound::JobStop { id: id.clone() };
        match self.command(connection, &id, &message).await {
            Ok(()) => Ok(true),
            Err(e @ (CoordinatorError::Timeout(_) | CoordinatorError::ConnectionClosed(_))) => {
                warn!(connection_id = %connection, error = %e, "job_stop not acknowledged");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Ask a worker for its most recent find.
    pub async fn get_last_found(&self, connection: ConnectionId) -> Result<Value> {
        let reply = self
            .send_and_await(
                connection,
                &ClientBound::GetLastFound,
                |env| env.is_action(ACTION_LAST_FOUND),
                self.timeout,
            )
            .await?;
        Ok(reply.data)
    }

    /// Ask a worker what it is running. `Ok(None)` if it did not answer;
    /// `Some(Value::Null)` means it answered with no job.
    pub async fn get_current_job(&self, connection: ConnectionId) -> Result<Option<Value>> {
        let reply = self
            .send_and_await(
                connection,
                &ClientBound::GetCurrentJob,
                |env| env.is_action(ACTION_JOB_STATUS),
                self.timeout,
            )
            .await;
        match reply {
            Ok(env) => Ok(Some(env.data)),
            Err(e @ (CoordinatorError::Timeout(_) | CoordinatorError::ConnectionClosed(_))) => {
                warn!(connection_id = %connection, error = %e, "no job_status reply");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Push rel file contents to a worker and wait for the acknowledgment.
    pub async fn upload(&self, connection: ConnectionId, contents: String) -> Result<()> {
        let id = Uuid::new_v4().to_string();
        let size = contents.len();
        let message = ClientBound::Upload {
            id: Some(id.clone()),
            data: contents,
        };
        self.command(connection, &id, &message).await?;
        debug!(connection_id = %connection, bytes = size, "upload acknowledged");
        Ok(())
    }

    pub async fn upload_file(&self, connection: ConnectionId, path: &Path) -> Result<()> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| CoordinatorError::io(path, e))?;
        self.upload(connection, contents).await
    }
}
