use crate::domain_model::Credential;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub(crate) type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug)]
pub(crate) enum WsFrame {
    Text(String),
    Binary(Vec<u8>),
    Ping,
    Pong,
    Close,
}

impl From<Message> for WsFrame {
    fn from(message: Message) -> Self {
        match message {
            Message::Text(text) => WsFrame::Text(text),
            Message::Binary(bytes) => WsFrame::Binary(bytes),
            // tungstenite queues the pong reply itself
            Message::Ping(_) => WsFrame::Ping,
            Message::Pong(_) | Message::Frame(_) => WsFrame::Pong,
            Message::Close(_) => WsFrame::Close,
        }
    }
}

/// Opens `url` with the credential in the `Authorization` header.
pub(crate) async fn open_socket(url: &str, credential: &Credential) -> Result<Socket, String> {
    let mut request = url
        .into_client_request()
        .map_err(|e| format!("invalid url {url}: {e}"))?;
    let bearer = HeaderValue::from_str(&credential.bearer())
        .map_err(|e| format!("credential is not a valid header: {e}"))?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    match tokio_tungstenite::connect_async(request).await {
        Ok((socket, _)) => Ok(socket),
        Err(tungstenite::Error::Http(response)) => {
            Err(format!("handshake rejected: {}", response.status()))
        }
        Err(e) => Err(e.to_string()),
    }
}
