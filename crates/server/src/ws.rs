use std::{collections::HashMap, sync::Arc};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use server_api::CurrentUser;
use shared::{
    channels::ChannelName,
    protocol::{ChannelEvent, ClientCommand, Envelope, PresenceMember, ServerFrame},
};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{app_state::AppState, auth::verify_channel_grant};

const OUTBOUND_QUEUE: usize = 64;

/// One task per websocket. The connection owns a forwarder task per
/// subscribed channel; unsubscribe (or disconnect) aborts the forwarder,
/// which cancels further delivery to this socket immediately.
pub(crate) async fn ws_connection(state: Arc<AppState>, socket: WebSocket, user: CurrentUser) {
    let socket_id = Uuid::new_v4().to_string();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(OUTBOUND_QUEUE);

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    if out_tx
        .send(ServerFrame::Connected {
            socket_id: socket_id.clone(),
        })
        .await
        .is_err()
    {
        writer.abort();
        return;
    }

    let mut forwarders: HashMap<ChannelName, JoinHandle<()>> = HashMap::new();
    let mut presence_held = false;

    while let Some(Ok(message)) = ws_receiver.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let command = match serde_json::from_str::<ClientCommand>(&text) {
            Ok(command) => command,
            Err(error) => {
                debug!(%error, "ignoring malformed client command");
                continue;
            }
        };
        match command {
            ClientCommand::Subscribe { channel, auth } => {
                // Double-subscribe is a no-op.
                if forwarders.contains_key(&channel) {
                    continue;
                }
                if channel.is_presence() {
                    let grant = auth.as_deref().and_then(|token| {
                        verify_channel_grant(
                            &state.channel_auth_secret,
                            token,
                            &socket_id,
                            channel.as_str(),
                        )
                    });
                    if grant.is_none() {
                        warn!(%channel, user = %user.email, "presence subscribe rejected: missing or invalid grant");
                        continue;
                    }

                    // Attach before announcing so concurrent joins land in
                    // this receiver's buffer instead of being lost; they
                    // drain after the snapshot and merge idempotently.
                    let rx = state.broker.attach(&channel).await;
                    let (snapshot, newly_online) = state.broker.presence_join(&user.email).await;
                    if newly_online {
                        state
                            .broker
                            .announce(
                                &channel,
                                ChannelEvent::MemberAdded(PresenceMember {
                                    id: user.email.clone(),
                                }),
                            )
                            .await;
                    }
                    let succeeded = ServerFrame::Event(Envelope {
                        channel: channel.clone(),
                        event: ChannelEvent::SubscriptionSucceeded(
                            snapshot
                                .into_iter()
                                .map(|id| PresenceMember { id })
                                .collect(),
                        ),
                    });
                    if out_tx.send(succeeded).await.is_err() {
                        break;
                    }
                    forwarders.insert(channel.clone(), spawn_forwarder(rx, out_tx.clone()));
                    presence_held = true;
                } else {
                    let rx = state.broker.attach(&channel).await;
                    forwarders.insert(channel.clone(), spawn_forwarder(rx, out_tx.clone()));
                }
            }
            ClientCommand::Unsubscribe { channel } => {
                // Double-unsubscribe is a no-op.
                let Some(task) = forwarders.remove(&channel) else {
                    continue;
                };
                task.abort();
                state.broker.prune(&channel).await;
                if channel.is_presence() {
                    presence_held = false;
                    release_presence(&state, &user).await;
                }
            }
        }
    }

    for (channel, task) in forwarders.drain() {
        task.abort();
        state.broker.prune(&channel).await;
    }
    if presence_held {
        release_presence(&state, &user).await;
    }
    writer.abort();
}

async fn release_presence(state: &AppState, user: &CurrentUser) {
    if state.broker.presence_leave(&user.email).await {
        state
            .broker
            .announce(
                &ChannelName::presence(),
                ChannelEvent::MemberRemoved(PresenceMember {
                    id: user.email.clone(),
                }),
            )
            .await;
    }
}

fn spawn_forwarder(
    mut rx: broadcast::Receiver<Envelope>,
    out_tx: mpsc::Sender<ServerFrame>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    if out_tx.send(ServerFrame::Event(envelope)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "slow websocket; dropped channel events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
