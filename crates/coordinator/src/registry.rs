//! Live worker connections, liveness checks and inbound frame dispatch.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use scan_pool_types::{ClientBound, ConnectionId, Envelope, JobId, ProgressReport, SearchMode};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CoordinatorError, Result};

const EVENT_CAPACITY: usize = 1024;
const INBOUND_CAPACITY: usize = 64;

/// Frame queued for a connection's socket writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Ping,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Socket closed or errored.
    Closed,
    /// No pong since the previous heartbeat tick.
    HeartbeatTimeout,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub connection: ConnectionId,
    pub job_id: JobId,
    pub maps: f64,
    pub distance: Option<f64>,
    pub mode: SearchMode,
}

/// Everything the registry reports to higher layers.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Connected {
        connection: ConnectionId,
    },
    Disconnected {
        connection: ConnectionId,
        reason: DisconnectReason,
    },
    Nick {
        connection: ConnectionId,
        nick: String,
    },
    Progress(ProgressEvent),
    Found {
        connection: ConnectionId,
        job_id: JobId,
        payload: Value,
    },
    JobFinished {
        connection: ConnectionId,
        job_id: JobId,
    },
    /// Every parsed frame, including the ones classified above.
    Message {
        connection: ConnectionId,
        envelope: Envelope,
    },
}

/// A connected worker.
struct ConnectionHandle {
    seq: u64,
    nick: Option<String>,
    alive: AtomicBool,
    peer: String,
    connected_at: Instant,
    tx: mpsc::UnboundedSender<Outbound>,
    inbound: broadcast::Sender<Envelope>,
}

/// Point-in-time view of a connection. `client_num` is the connection's
/// position in connect order and shifts when an earlier worker leaves.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub client_num: usize,
    pub id: ConnectionId,
    pub nick: Option<String>,
    pub is_alive: bool,
    pub peer: String,
    #[serde(skip)]
    pub connected_for: Duration,
}

struct RegistryInner {
    connections: DashMap<ConnectionId, ConnectionHandle>,
    next_seq: AtomicU64,
    events: broadcast::Sender<RegistryEvent>,
}

/// Shared registry of worker connections.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(RegistryInner {
                connections: DashMap::new(),
                next_seq: AtomicU64::new(0),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events.subscribe()
    }

    /// Add a connection. The returned receiver yields the frames to write to
    /// its socket, in order.
    pub fn register(&self, peer: impl Into<String>) -> (ConnectionId, mpsc::UnboundedReceiver<Outbound>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        let peer = peer.into();
        info!(connection_id = %id, peer = %peer, "new socket connection");
        self.inner.connections.insert(
            id,
            ConnectionHandle {
                seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
                nick: None,
                alive: AtomicBool::new(true),
                peer,
                connected_at: Instant::now(),
                tx,
                inbound,
            },
        );
        self.emit(RegistryEvent::Connected { connection: id });
        (id, rx)
    }

    /// Drop a connection. Returns false if it was already gone, in which case
    /// no event is emitted.
    pub fn remove(&self, id: ConnectionId, reason: DisconnectReason) -> bool {
        let Some((_, handle)) = self.inner.connections.remove(&id) else {
            debug!(connection_id = %id, "connection already removed");
            return false;
        };
        let _ = handle.tx.send(Outbound::Close);
        match reason {
            DisconnectReason::Closed => {
                info!(connection_id = %id, nick = ?handle.nick, "connection closed")
            }
            DisconnectReason::HeartbeatTimeout => {
                warn!(connection_id = %id, nick = ?handle.nick, "no pong since last heartbeat, dropping connection")
            }
        }
        self.emit(RegistryEvent::Disconnected {
            connection: id,
            reason,
        });
        true
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.inner.connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.connections.is_empty()
    }

    /// Record a pong.
    pub fn mark_alive(&self, id: ConnectionId) {
        if let Some(handle) = self.inner.connections.get(&id) {
            handle.alive.store(true, Ordering::Relaxed);
        }
    }

    pub fn is_alive(&self, id: ConnectionId) -> Option<bool> {
        self.inner
            .connections
            .get(&id)
            .map(|h| h.alive.load(Ordering::Relaxed))
    }

    pub fn nick(&self, id: ConnectionId) -> Option<String> {
        self.inner.connections.get(&id).and_then(|h| h.nick.clone())
    }

    /// All connections in connect order.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut rows: Vec<(u64, ConnectionInfo)> = self
            .inner
            .connections
            .iter()
            .map(|entry| {
                let h = entry.value();
                (
                    h.seq,
                    ConnectionInfo {
                        client_num: 0,
                        id: *entry.key(),
                        nick: h.nick.clone(),
                        is_alive: h.alive.load(Ordering::Relaxed),
                        peer: h.peer.clone(),
                        connected_for: h.connected_at.elapsed(),
                    },
                )
            })
            .collect();
        rows.sort_by_key(|(seq, _)| *seq);
        rows.into_iter()
            .enumerate()
            .map(|(n, (_, mut info))| {
                info.client_num = n;
                info
            })
            .collect()
    }

    /// Log every connection at info level.
    pub fn list_connections(&self) {
        for c in self.connections() {
            info!(
                client_num = c.client_num,
                nick = ?c.nick,
                alive = c.is_alive,
                connection_id = %c.id,
                "connection"
            );
        }
    }

    /// Map a display client number to the connection currently holding it.
    pub fn resolve_client_num(&self, client_num: usize) -> Option<ConnectionId> {
        self.connections().get(client_num).map(|c| c.id)
    }

    /// Queue a message for a connection. Fire-and-forget.
    pub fn send(&self, id: ConnectionId, message: &ClientBound) -> Result<()> {
        let frame = serde_json::to_string(message).map_err(CoordinatorError::Encode)?;
        let handle = self
            .inner
            .connections
            .get(&id)
            .ok_or(CoordinatorError::ConnectionNotFound(id))?;
        handle
            .tx
            .send(Outbound::Text(frame))
            .map_err(|_| CoordinatorError::ConnectionClosed(id))
    }

    /// Stream of every parsed frame from one connection. The stream ends when
    /// the connection is removed.
    pub fn subscribe_inbound(&self, id: ConnectionId) -> Result<broadcast::Receiver<Envelope>> {
        self.inner
            .connections
            .get(&id)
            .map(|h| h.inbound.subscribe())
            .ok_or(CoordinatorError::ConnectionNotFound(id))
    }

    /// Number of live inbound subscriptions (pending waits) on a connection.
    pub fn listener_count(&self, id: ConnectionId) -> Option<usize> {
        self.inner
            .connections
            .get(&id)
            .map(|h| h.inbound.receiver_count())
    }

    /// Handle one raw text frame from a connection. Malformed frames are
    /// logged and dropped; the connection stays open.
    pub fn dispatch_frame(&self, id: ConnectionId, frame: &str) {
        let envelope = match Envelope::parse(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(connection_id = %id, error = %e, "parsing of message failed");
                return;
            }
        };

        if let Some(handle) = self.inner.connections.get(&id) {
            let _ = handle.inbound.send(envelope.clone());
        }
        self.emit(RegistryEvent::Message {
            connection: id,
            envelope: envelope.clone(),
        });

        match envelope.action.as_str() {
            "set_nick" => self.set_nick(id, &envelope.data),
            "progress" => match serde_json::from_value::<ProgressReport>(envelope.data) {
                Ok(report) => {
                    if report.mode.is_none() {
                        debug!(
                            connection_id = %id,
                            maps = report.progress.maps,
                            "progress without mode, inferring from maps"
                        );
                    }
                    self.emit(RegistryEvent::Progress(ProgressEvent {
                        connection: id,
                        mode: report.resolved_mode(),
                        job_id: report.job_id,
                        maps: report.progress.maps,
                        distance: report.progress.distance,
                    }));
                }
                Err(e) => {
                    warn!(connection_id = %id, error = %e, "processing of progress message failed")
                }
            },
            "found" => match envelope.id {
                Some(job_id) => self.emit(RegistryEvent::Found {
                    connection: id,
                    job_id,
                    payload: envelope.data,
                }),
                None => warn!(connection_id = %id, "found message without job id"),
            },
            "job_finished" => match envelope.id {
                Some(job_id) => self.emit(RegistryEvent::JobFinished {
                    connection: id,
                    job_id,
                }),
                None => warn!(connection_id = %id, "job_finished message without job id"),
            },
            _ => {}
        }
    }

    /// One liveness pass: drop connections that missed the previous ping,
    /// clear the flag on the rest and ping them. Returns the dropped ids.
    pub fn heartbeat_tick(&self) -> Vec<ConnectionId> {
        let mut dead = Vec::new();
        for entry in self.inner.connections.iter() {
            if entry.alive.swap(false, Ordering::Relaxed) {
                let _ = entry.tx.send(Outbound::Ping);
            } else {
                dead.push(*entry.key());
            }
        }
        // removal takes a shard write lock, so it must happen after iteration
        dead.retain(|id| self.remove(*id, DisconnectReason::HeartbeatTimeout));
        dead
    }

    /// Run [`Registry::heartbeat_tick`] every `period`, first tick one
    /// period from now.
    pub fn spawn_heartbeat(&self, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let dropped = registry.heartbeat_tick();
                        if !dropped.is_empty() {
                            debug!(dropped = dropped.len(), "heartbeat removed dead connections");
                        }
                    }
                }
            }
            debug!("heartbeat stopped");
        })
    }

    fn set_nick(&self, id: ConnectionId, data: &Value) {
        let nick = match data {
            Value::String(s) => s.clone(),
            Value::Null => {
                warn!(connection_id = %id, "set_nick without a name");
                return;
            }
            other => other.to_string(),
        };
        match self.inner.connections.get_mut(&id) {
            Some(mut handle) => handle.nick = Some(nick.clone()),
            None => return,
        }
        info!(connection_id = %id, nick = %nick, "set nick for connection");
        self.emit(RegistryEvent::Nick {
            connection: id,
            nick,
        });
    }

    fn emit(&self, event: RegistryEvent) {
        // no subscribers is fine
        let _ = self.inner.events.send(event);
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
