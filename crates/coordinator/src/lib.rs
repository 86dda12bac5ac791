//! Scan pool coordinator.
//!
//! Accepts worker WebSocket connections, keeps them alive with a heartbeat,
//! and hands out search jobs from a persisted job list.

pub mod config;
pub mod correlator;
pub mod error;
pub mod jobs;
pub mod lock;
pub mod registry;
pub mod ws;

pub use config::CoordinatorConfig;
pub use correlator::Correlator;
pub use error::{CoordinatorError, Result};
pub use jobs::{JobManager, JobStore, WorkerStatus};
pub use registry::{Registry, RegistryEvent};

use std::sync::Arc;

use axum::{routing::get, Router};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// HTTP surface: the worker socket on `/` and a health probe.
pub fn app(registry: Registry) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

/// Wires the registry, correlator and job manager together.
pub struct Coordinator {
    config: CoordinatorConfig,
    registry: Registry,
    jobs: Arc<JobManager>,
    cancel: CancellationToken,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        let registry = Registry::new();
        let correlator = Correlator::new(registry.clone(), config.request_timeout);
        let store = JobStore::new(config.jobs_file.clone());
        let jobs = Arc::new(JobManager::new(correlator, store, config.rel_dir.clone()));
        Self {
            config,
            registry,
            jobs,
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn jobs(&self) -> &Arc<JobManager> {
        &self.jobs
    }

    pub fn router(&self) -> Router {
        app(self.registry.clone())
    }

    /// Start the heartbeat, the job event loop and the assignment loop.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        // subscribe first so no event between here and the spawn is missed
        let events = self.registry.subscribe();
        vec![
            self.registry
                .spawn_heartbeat(self.config.heartbeat_interval, self.cancel.clone()),
            self.jobs.spawn_event_loop(events, self.cancel.clone()),
            self.jobs
                .spawn_assign_loop(self.config.assign_interval, self.cancel.clone()),
        ]
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Arc, Mutex};

    use scan_pool_types::{ConnectionId, Envelope};
    use serde_json::{json, Value};
    use tokio::sync::mpsc::UnboundedReceiver;

    use crate::registry::{Outbound, Registry};

    pub(crate) enum FakeReply {
        Silent,
        Frames(Vec<Value>),
    }

    impl FakeReply {
        /// Acknowledge every command that carries an id.
        pub(crate) fn akn_commands(env: &Envelope) -> FakeReply {
            match (env.action.as_str(), &env.id) {
                ("job_start" | "job_stop" | "upload", Some(id)) => {
                    FakeReply::Frames(vec![json!({"action": "akn", "id": id})])
                }
                _ => FakeReply::Silent,
            }
        }

        /// Acknowledge commands and report no running job.
        pub(crate) fn idle_worker(env: &Envelope) -> FakeReply {
            if env.action == "get_current_job" {
                FakeReply::Frames(vec![json!({"action": "job_status"})])
            } else {
                Self::akn_commands(env)
            }
        }
    }

    /// Stand in for a worker's socket: read what the coordinator queues for
    /// `id`, record it, and feed replies back through the registry.
    pub(crate) fn spawn_fake_worker<F>(
        registry: Registry,
        id: ConnectionId,
        mut rx: UnboundedReceiver<Outbound>,
        reply: F,
    ) -> Arc<Mutex<Vec<Envelope>>>
    where
        F: Fn(&Envelope) -> FakeReply + Send + 'static,
    {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        tokio::spawn(async move {
            while let Some(out) = rx.recv().await {
                match out {
                    Outbound::Text(frame) => {
                        let Ok(envelope) = Envelope::parse(&frame) else {
                            continue;
                        };
                        log.lock().unwrap().push(envelope.clone());
                        if let FakeReply::Frames(frames) = reply(&envelope) {
                            for frame in frames {
                                registry.dispatch_frame(id, &frame.to_string());
                            }
                        }
                    }
                    Outbound::Ping => registry.mark_alive(id),
                    Outbound::Close => break,
                }
            }
        });
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health() {
        let response = app(Registry::new())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_root_requires_upgrade() {
        let response = app(Registry::new())
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn test_shutdown_stops_background_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let config = CoordinatorConfig {
            jobs_file: dir.path().join("jobs.json"),
            rel_dir: dir.path().join("rel"),
            ..CoordinatorConfig::from_lookup(|_| None)
        };
        let coordinator = Coordinator::new(config);
        let tasks = coordinator.spawn_background();
        coordinator.shutdown();
        for task in tasks {
            task.await.unwrap();
        }
    }
}
