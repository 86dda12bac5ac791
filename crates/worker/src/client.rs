//! Reconnecting WebSocket client used by scan workers.

use std::sync::{Arc, Mutex, PoisonError};

use futures_util::{SinkExt, StreamExt};
use scan_pool_types::{
    ClientBound, FoundInfo, JobId, ProgressCounters, ProgressReport, SearchMode, ServerBound,
};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Open,
    Message(ClientBound),
    Close,
    Error(String),
}

/// Writer half of the current connection, `None` while disconnected.
type SharedWriter = Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>;

pub struct Client {
    writer: SharedWriter,
    events: broadcast::Sender<ClientEvent>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Client {
    /// Start connecting in the background. The returned receiver is
    /// subscribed before the first attempt, so it sees the first `Open`.
    pub fn connect(config: ClientConfig) -> (Self, broadcast::Receiver<ClientEvent>) {
        let (events, rx) = broadcast::channel(EVENT_CAPACITY);
        let writer = SharedWriter::default();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(connection_loop(
            config,
            Arc::clone(&writer),
            events.clone(),
            cancel.clone(),
        ));
        (
            Self {
                writer,
                events,
                cancel,
                task,
            },
            rx,
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Queue a message on the open connection. Without one the message is
    /// dropped with a warning and the call still succeeds.
    pub fn send(&self, message: &ServerBound) -> Result<()> {
        let frame = serde_json::to_string(message)?;
        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let delivered = writer
            .as_ref()
            .is_some_and(|tx| tx.send(Message::Text(frame.into())).is_ok());
        if !delivered {
            warn!(message = ?message, "not connected, message dropped");
        }
        Ok(())
    }

    pub fn send_progress(
        &self,
        job_id: impl Into<JobId>,
        maps: f64,
        distance: Option<f64>,
        mode: Option<SearchMode>,
    ) -> Result<()> {
        self.send(&ServerBound::Progress {
            data: ProgressReport {
                progress: ProgressCounters { maps, distance },
                job_id: job_id.into(),
                mode,
            },
        })
    }

    pub fn send_found(&self, job_id: impl Into<JobId>, found: &FoundInfo) -> Result<()> {
        self.send(&ServerBound::Found {
            id: job_id.into(),
            data: serde_json::to_value(found)?,
        })
    }

    pub fn send_akn(&self, id: impl Into<String>) -> Result<()> {
        self.send(&ServerBound::Akn { id: id.into() })
    }

    pub fn send_nick(&self, nick: impl Into<String>) -> Result<()> {
        self.send(&ServerBound::SetNick { data: nick.into() })
    }

    pub fn send_job_finished(&self, job_id: impl Into<JobId>) -> Result<()> {
        self.send(&ServerBound::JobFinished { id: job_id.into() })
    }

    pub fn send_last_found(&self, found: Value) -> Result<()> {
        self.send(&ServerBound::LastFound { data: found })
    }

    /// Reply to `get_current_job`. `Value::Null` means idle.
    pub fn send_current_job(&self, job: Value) -> Result<()> {
        self.send(&ServerBound::JobStatus { data: job })
    }

    /// Close the connection and stop reconnecting.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

async fn connection_loop(
    config: ClientConfig,
    writer: SharedWriter,
    events: broadcast::Sender<ClientEvent>,
    cancel: CancellationToken,
) {
    let endpoint = config.endpoint();
    info!(%endpoint, "worker client starting");

    loop {
        let attempt = tokio::select! {
            _ = cancel.cancelled() => break,
            attempt = run_connection(&endpoint, &writer, &events, &cancel) => attempt,
        };
        if let Err(e) = attempt {
            warn!(%endpoint, error = %e, "connection failed");
            let _ = events.send(ClientEvent::Error(e.to_string()));
        }
        if cancel.is_cancelled() {
            break;
        }

        debug!(delay_ms = config.reconnect_delay.as_millis() as u64, "reconnecting");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.reconnect_delay) => {}
        }
    }
    debug!("worker client stopped");
}

/// One connection lifetime: open, pump frames both ways until either side
/// closes or the client is shut down.
async fn run_connection(
    endpoint: &str,
    writer: &SharedWriter,
    events: &broadcast::Sender<ClientEvent>,
    cancel: &CancellationToken,
) -> Result<()> {
    let (ws_stream, _) = connect_async(endpoint).await?;
    let (mut sink, mut stream) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel();
    *writer.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
    info!(%endpoint, "connected to coordinator");
    let _ = events.send(ClientEvent::Open);

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break Ok(());
            }
            Some(message) = rx.recv() => {
                if let Err(e) = sink.send(message).await {
                    break Err(ClientError::from(e));
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientBound>(text.as_str()) {
                    Ok(message) => {
                        let _ = events.send(ClientEvent::Message(message));
                    }
                    Err(e) => warn!(error = %e, "ignoring unrecognised message"),
                },
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                // pings are answered by tungstenite
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(ClientError::from(e)),
            }
        }
    };

    *writer.lock().unwrap_or_else(PoisonError::into_inner) = None;
    info!(%endpoint, "connection to coordinator closed");
    let _ = events.send(ClientEvent::Close);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn unreachable_config() -> ClientConfig {
        ClientConfig {
            url: "ws://127.0.0.1".to_string(),
            // reserved port, nothing listens
            port: 1,
            reconnect_delay: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_send_without_connection_is_ok() {
        let (client, mut events) = Client::connect(unreachable_config());
        assert!(!client.is_connected());
        client.send_akn("abc").unwrap();
        client.send_progress("j1", 2.0, None, None).unwrap();

        let first = events.recv().await.unwrap();
        assert!(matches!(first, ClientEvent::Error(_)));
        assert!(!client.is_connected());
        client.shutdown().await;
    }
}
