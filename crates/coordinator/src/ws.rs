use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, warn};

use crate::registry::{DisconnectReason, Outbound, Registry};

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(registry): State<Registry>,
) -> impl IntoResponse {
    let peer = forwarded_for(&headers).unwrap_or_else(|| addr.ip().to_string());
    ws.on_upgrade(move |socket| handle_socket(socket, registry, peer))
}

/// First address in `x-forwarded-for`, when running behind a proxy.
fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")?
        .to_str()
        .ok()?
        .split(',')
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

async fn handle_socket(socket: WebSocket, registry: Registry, peer: String) {
    let (mut sink, mut stream) = socket.split();
    let (id, mut rx) = registry.register(peer);

    // Registry -> socket. Ends after writing a close frame.
    let mut forward_task = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            let (message, last) = match out {
                Outbound::Text(text) => (Message::Text(text.into()), false),
                Outbound::Ping => (Message::Ping(Default::default()), false),
                Outbound::Close => (Message::Close(None), true),
            };
            if sink.send(message).await.is_err() || last {
                break;
            }
        }
    });

    let read = async {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => registry.dispatch_frame(id, text.as_str()),
                Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                    Ok(text) => registry.dispatch_frame(id, text),
                    Err(_) => warn!(connection_id = %id, "dropping non-UTF-8 binary frame"),
                },
                Ok(Message::Pong(_)) => registry.mark_alive(id),
                // axum answers pings itself
                Ok(Message::Ping(_)) => {}
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    debug!(connection_id = %id, error = %e, "socket error");
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = read => {}
        _ = &mut forward_task => {}
    }
    forward_task.abort();
    registry.remove(id, DisconnectReason::Closed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarded_for() {
        let mut headers = HeaderMap::new();
        assert_eq!(forwarded_for(&headers), None);
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        assert_eq!(forwarded_for(&headers).as_deref(), Some("203.0.113.7"));
    }
}
