//! WebSocket transport.
//!
//! One task per socket: the handshake extracts the bearer token, the
//! identity provider resolves it, then a writer task drains the connection's
//! outbound queue while the read loop feeds text frames to the orchestrator.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, StatusCode};
use tokio_tungstenite::tungstenite::Message;

use crate::connection::Outbound;
use crate::dispatcher::Orchestrator;
use crate::error::{DuelError, Result};
use crate::identity::IdentityProvider;
use crate::protocol::{ErrorCode, ServerEvent};

/// WebSocket front end for an [`Orchestrator`].
pub struct Server {
    bind_addr: String,
    idle_timeout: Duration,
    orchestrator: Orchestrator,
    identity: Arc<dyn IdentityProvider>,
}

impl Server {
    pub fn new(orchestrator: Orchestrator, identity: Arc<dyn IdentityProvider>) -> Self {
        let server = &orchestrator.config().server;
        Self {
            bind_addr: server.bind_addr.clone(),
            idle_timeout: Duration::from_secs(server.idle_timeout_secs),
            orchestrator,
            identity,
        }
    }

    /// Bind the configured address and serve forever.
    pub async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        self.run(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn run(self, listener: TcpListener) -> Result<()> {
        tracing::info!(addr = %listener.local_addr()?, "websocket listener ready");
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let orchestrator = self.orchestrator.clone();
            let identity = Arc::clone(&self.identity);
            let idle_timeout = self.idle_timeout;
            tokio::spawn(async move {
                if let Err(e) =
                    serve_socket(stream, peer, orchestrator, identity, idle_timeout).await
                {
                    tracing::debug!(%peer, error = %e, "connection ended with error");
                }
            });
        }
    }
}

/// Token from `?token=` or `Authorization: Bearer`.
fn extract_token(request: &Request) -> Option<String> {
    let from_query = request.uri().query().and_then(|query| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == "token")
            .map(|(_, value)| value.into_owned())
    });
    from_query
        .or_else(|| {
            request
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("Bearer "))
                .map(|token| token.trim().to_string())
        })
        .filter(|token| !token.is_empty())
}

fn unauthorized() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("missing token".to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

async fn serve_socket(
    stream: TcpStream,
    peer: SocketAddr,
    orchestrator: Orchestrator,
    identity: Arc<dyn IdentityProvider>,
    idle_timeout: Duration,
) -> Result<()> {
    let mut token = None;
    let ws = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| {
        match extract_token(request) {
            Some(found) => {
                token = Some(found);
                Ok(response)
            }
            None => Err(unauthorized()),
        }
    })
    .await?;
    let token = token.ok_or_else(|| DuelError::auth_failed("missing token"))?;
    let (mut sink, mut stream) = ws.split();

    let who = match identity.verify(&token).await {
        Ok(who) => who,
        Err(e) => {
            tracing::info!(%peer, error = %e, "handshake rejected");
            let frame = ServerEvent::error(ErrorCode::Unauthorized, e.to_string()).encode()?;
            sink.send(Message::Text(frame.into())).await?;
            sink.close().await?;
            return Err(e);
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let local_tx = tx.clone();
    let connection_id = orchestrator.connect(&who, tx);
    tracing::info!(%peer, user_id = %who.user_id, connection_id, "client connected");

    tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Event(event) => {
                    let text = match event.encode() {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::error!(event = event.name(), error = %e, "encode failed");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.close().await;
                    break;
                }
            }
        }
    });

    loop {
        let frame = match tokio::time::timeout(idle_timeout, stream.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => {
                tracing::debug!(connection_id, error = %e, "read failed");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                tracing::debug!(connection_id, "idle timeout");
                break;
            }
        };
        match frame {
            Message::Text(text) => {
                orchestrator
                    .handle_text(&who.user_id, connection_id, &text)
                    .await
            }
            Message::Binary(_) => {
                let _ = local_tx.send(Outbound::Event(ServerEvent::error(
                    ErrorCode::InvalidPayload,
                    "binary frames are not supported",
                )));
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }

    orchestrator.disconnect(&who.user_id, connection_id);
    let _ = local_tx.send(Outbound::Close);
    tracing::info!(user_id = %who.user_id, connection_id, "client disconnected");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, auth: Option<&str>) -> Request {
        let mut builder = Request::builder().uri(uri);
        if let Some(auth) = auth {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_token_from_query() {
        assert_eq!(
            extract_token(&request("/ws?room=1&token=alice%3AAlice", None)).as_deref(),
            Some("alice:Alice")
        );
    }

    #[test]
    fn test_token_from_bearer_header() {
        assert_eq!(
            extract_token(&request("/ws", Some("Bearer tok-9"))).as_deref(),
            Some("tok-9")
        );
        assert!(extract_token(&request("/ws", Some("Basic abc"))).is_none());
        assert!(extract_token(&request("/ws?token=", None)).is_none());
    }
}
