//! Socket transport seam.
//!
//! [`Connector`] opens a link and waits for the server's `connect` acknowledgment;
//! [`Transport`] moves text frames over the open link. The production pair runs over
//! `tokio-tungstenite`; tests swap in scripted implementations.

use futures::{SinkExt, StreamExt, future::BoxFuture};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        self, Message,
        client::IntoClientRequest,
        http::{HeaderValue, StatusCode, header::AUTHORIZATION},
    },
};
use tracing::debug;

use crate::{dto::events::DuelEvent, error::ConnectionError};

/// Bidirectional text link to the duel server.
pub trait Transport: Send {
    /// Send one text frame.
    fn send(&mut self, text: String) -> BoxFuture<'_, Result<(), ConnectionError>>;
    /// Next text frame, or `None` once the peer closed the link.
    fn recv(&mut self) -> BoxFuture<'_, Option<Result<String, ConnectionError>>>;
    /// Close the link. Errors while closing are ignored.
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// A link whose `connect` acknowledgment has been received.
pub struct Established {
    /// Open link.
    pub transport: Box<dyn Transport>,
    /// Server-assigned socket id.
    pub socket_id: String,
}

impl std::fmt::Debug for Established {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Established")
            .field("socket_id", &self.socket_id)
            .finish_non_exhaustive()
    }
}

/// Opens links. Implementations must resolve only after the acknowledgment.
pub trait Connector: Send + Sync {
    /// Open an authenticated link to `url`.
    fn connect(&self, url: &str, token: &str)
    -> BoxFuture<'static, Result<Established, ConnectionError>>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connector backed by `tokio-tungstenite`. The token travels in the `Authorization`
/// header of the upgrade request.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(
        &self,
        url: &str,
        token: &str,
    ) -> BoxFuture<'static, Result<Established, ConnectionError>> {
        let url = url.to_string();
        let token = token.to_string();
        Box::pin(async move {
            let mut request = url
                .as_str()
                .into_client_request()
                .map_err(|err| ConnectionError::Transport(err.to_string()))?;
            let header = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| ConnectionError::Unauthorized("token is not a valid header".into()))?;
            request.headers_mut().insert(AUTHORIZATION, header);

            let (stream, _) = connect_async(request).await.map_err(map_handshake_error)?;
            let mut transport = WsTransport { stream };
            let socket_id = wait_for_ack(&mut transport).await?;
            debug!(%socket_id, "socket acknowledged");

            Ok(Established {
                transport: Box::new(transport),
                socket_id,
            })
        })
    }
}

fn map_handshake_error(err: tungstenite::Error) -> ConnectionError {
    match err {
        tungstenite::Error::Http(response)
            if matches!(
                response.status(),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
            ) =>
        {
            ConnectionError::Unauthorized(format!("handshake rejected with {}", response.status()))
        }
        other => ConnectionError::Transport(other.to_string()),
    }
}

async fn wait_for_ack(transport: &mut WsTransport) -> Result<String, ConnectionError> {
    loop {
        let Some(frame) = transport.recv().await else {
            return Err(ConnectionError::Transport(
                "link closed before acknowledgment".into(),
            ));
        };
        match DuelEvent::decode(&frame?) {
            Ok(Some(DuelEvent::Connect { socket_id })) => return Ok(socket_id),
            Ok(Some(DuelEvent::ConnectError(err))) => {
                return Err(ConnectionError::Unauthorized(err.message));
            }
            Ok(other) => debug!(event = ?other.map(|e| e.kind()), "frame before acknowledgment"),
            Err(err) => debug!(error = %err, "undecodable frame before acknowledgment"),
        }
    }
}

struct WsTransport {
    stream: WsStream,
}

impl Transport for WsTransport {
    fn send(&mut self, text: String) -> BoxFuture<'_, Result<(), ConnectionError>> {
        Box::pin(async move {
            self.stream
                .send(Message::text(text))
                .await
                .map_err(|err| ConnectionError::Transport(err.to_string()))
        })
    }

    fn recv(&mut self) -> BoxFuture<'_, Option<Result<String, ConnectionError>>> {
        Box::pin(async move {
            loop {
                match self.stream.next().await? {
                    Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                    Ok(Message::Close(_)) => return None,
                    Ok(_) => continue,
                    Err(err) => return Some(Err(ConnectionError::Transport(err.to_string()))),
                }
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Err(err) = self.stream.close(None).await {
                debug!(error = %err, "error while closing socket");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Router,
        extract::ws::{Message as AxumMessage, WebSocketUpgrade},
        http::HeaderMap,
        response::{IntoResponse, Response},
        routing::get,
    };

    async fn socket(headers: HeaderMap, ws: WebSocketUpgrade) -> Response {
        let authorized = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            == Some("Bearer good");
        if !authorized {
            return StatusCode::UNAUTHORIZED.into_response();
        }

        ws.on_upgrade(|mut socket| async move {
            let ack = r#"{"event":"connect","data":{"sid":"sock-1"}}"#;
            if socket.send(AxumMessage::Text(ack.into())).await.is_err() {
                return;
            }
            while let Some(Ok(AxumMessage::Text(text))) = socket.recv().await {
                if socket.send(AxumMessage::Text(text)).await.is_err() {
                    break;
                }
            }
        })
    }

    async fn spawn_server() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/socket", get(socket));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("ws://{addr}/socket")
    }

    #[tokio::test]
    async fn connects_after_ack_and_exchanges_frames() {
        let url = spawn_server().await;
        let mut established = WsConnector.connect(&url, "good").await.unwrap();
        assert_eq!(established.socket_id, "sock-1");

        let frame = r#"{"event":"ready_for_duel","data":{}}"#.to_string();
        established.transport.send(frame.clone()).await.unwrap();
        let echoed = established.transport.recv().await.unwrap().unwrap();
        assert_eq!(echoed, frame);
        established.transport.close().await;
    }

    #[tokio::test]
    async fn rejected_handshake_is_unauthorized() {
        let url = spawn_server().await;
        let err = WsConnector.connect(&url, "bad").await.unwrap_err();
        assert!(matches!(err, ConnectionError::Unauthorized(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn unreachable_server_is_retryable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = WsConnector
            .connect(&format!("ws://{addr}/socket"), "good")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
