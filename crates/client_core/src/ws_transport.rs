use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::{
    channels::ChannelName,
    protocol::{ClientCommand, Envelope, ServerFrame},
};
use tokio::{
    net::TcpStream,
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{error, warn};
use transport::ChannelTransport;
use url::Url;

const EVENT_CAPACITY: usize = 256;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Debug, Serialize)]
struct ChannelAuthRequest<'a> {
    socket_id: &'a str,
    channel_name: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChannelAuthResponse {
    auth: String,
}

/// WebSocket-backed transport. Subscribing to the presence channel first
/// trades the connection's socket id for a signed grant at the
/// channel-authorization endpoint.
pub struct WsTransport {
    http: Client,
    base_url: String,
    session_token: String,
    socket_id: watch::Receiver<Option<String>>,
    writer: Mutex<WsSink>,
    events: broadcast::Sender<Envelope>,
    reader_task: JoinHandle<()>,
}

impl WsTransport {
    pub async fn connect(base_url: &str, session_token: &str) -> Result<Arc<Self>> {
        let base = Url::parse(base_url).context("invalid server url")?;
        let ws_scheme = match base.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => return Err(anyhow!("unsupported server url scheme: {other}")),
        };
        let base_url = base_url.trim_end_matches('/').to_owned();
        let ws_url = format!(
            "{}/ws?token={session_token}",
            base_url.replacen(base.scheme(), ws_scheme, 1)
        );

        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
        let (writer, mut reader) = ws_stream.split();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (socket_tx, socket_rx) = watch::channel(None);

        let events_for_reader = events.clone();
        let reader_task = tokio::spawn(async move {
            while let Some(message) = reader.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(ServerFrame::Connected { socket_id }) => {
                            let _ = socket_tx.send(Some(socket_id));
                        }
                        Ok(ServerFrame::Event(envelope)) => {
                            let _ = events_for_reader.send(envelope);
                        }
                        Err(err) => warn!(%err, "ignoring malformed server frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        error!(%err, "websocket receive failed");
                        break;
                    }
                }
            }
        });

        Ok(Arc::new(Self {
            http: Client::new(),
            base_url,
            session_token: session_token.to_owned(),
            socket_id: socket_rx,
            writer: Mutex::new(writer),
            events,
            reader_task,
        }))
    }

    /// The server assigns the socket id in its first frame; wait for it.
    async fn socket_id(&self) -> Result<String> {
        let mut rx = self.socket_id.clone();
        loop {
            if let Some(id) = rx.borrow().clone() {
                return Ok(id);
            }
            rx.changed()
                .await
                .map_err(|_| anyhow!("connection closed before socket id assignment"))?;
        }
    }

    async fn presence_grant(&self, channel: &ChannelName) -> Result<String> {
        let socket_id = self.socket_id().await?;
        let response: ChannelAuthResponse = self
            .http
            .post(format!("{}/channels/auth", self.base_url))
            .bearer_auth(&self.session_token)
            .json(&ChannelAuthRequest {
                socket_id: &socket_id,
                channel_name: channel.as_str(),
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.auth)
    }

    async fn send_command(&self, command: &ClientCommand) -> Result<()> {
        let text = serde_json::to_string(command)?;
        self.writer
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .context("websocket send failed")
    }
}

#[async_trait]
impl ChannelTransport for WsTransport {
    async fn subscribe(&self, channel: &ChannelName) -> Result<()> {
        let auth = if channel.is_presence() {
            Some(self.presence_grant(channel).await?)
        } else {
            None
        };
        self.send_command(&ClientCommand::Subscribe {
            channel: channel.clone(),
            auth,
        })
        .await
    }

    async fn unsubscribe(&self, channel: &ChannelName) -> Result<()> {
        self.send_command(&ClientCommand::Unsubscribe {
            channel: channel.clone(),
        })
        .await
    }

    fn incoming(&self) -> broadcast::Receiver<Envelope> {
        self.events.subscribe()
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}
