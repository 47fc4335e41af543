use std::{collections::HashSet, sync::Arc};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use shared::{
    channels::ChannelName,
    domain::{ConversationId, UserId},
    protocol::{ChannelEvent, Conversation, ConversationActivity, Envelope, MessagePayload},
};
use tokio::sync::{broadcast, Mutex};
use tracing::warn;
use transport::ChannelTransport;

pub mod presence;
pub mod reconcile;
pub mod subscriptions;
pub mod ws_transport;

use presence::PresenceTracker;
use reconcile::{ArrivalAction, ConversationList, MessageThread, NewMessageOutcome};
use subscriptions::{channels_for_context, SubscriptionManager};

const CLIENT_EVENT_CAPACITY: usize = 1024;

/// The signed-in user as the client sees it.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub user_id: UserId,
    pub email: String,
}

/// Notifications for the embedding UI. State snapshots are pulled through
/// the accessor methods; these only say that something changed.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConversationsChanged,
    MessagesChanged,
    /// The open conversation was removed remotely; navigate away.
    NavigatedAway { conversation_id: ConversationId },
    /// A message arrived with the viewer near the bottom: follow it.
    AutoScroll,
    /// Unseen badge count changed.
    UnseenBadge { count: u32 },
    PresenceChanged,
    /// `conversation:user` activity; the sidebar does not consume it but
    /// the UI may (unread markers, toasts).
    Activity(ConversationActivity),
    Error(String),
}

/// Collaborator for the client half of the seen-receipt flow. The durable
/// transition lives behind the write path; the client only triggers it.
#[async_trait]
pub trait ConversationApi: Send + Sync {
    async fn mark_seen(&self, conversation_id: &ConversationId) -> Result<()>;
}

pub struct MissingConversationApi;

#[async_trait]
impl ConversationApi for MissingConversationApi {
    async fn mark_seen(&self, conversation_id: &ConversationId) -> Result<()> {
        Err(anyhow!(
            "conversation api unavailable; cannot mark {conversation_id} seen"
        ))
    }
}

/// HTTP implementation against the chat server.
pub struct HttpConversationApi {
    http: Client,
    base_url: String,
    session_token: String,
}

impl HttpConversationApi {
    pub fn new(base_url: impl Into<String>, session_token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            session_token: session_token.into(),
        }
    }
}

#[async_trait]
impl ConversationApi for HttpConversationApi {
    async fn mark_seen(&self, conversation_id: &ConversationId) -> Result<()> {
        self.http
            .post(format!(
                "{}/conversations/{conversation_id}/seen",
                self.base_url.trim_end_matches('/')
            ))
            .bearer_auth(&self.session_token)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

struct ClientState {
    identity: Option<SessionIdentity>,
    subscriptions: SubscriptionManager,
    presence: PresenceTracker,
    conversations: ConversationList,
    thread: Option<MessageThread>,
    loop_started: bool,
}

/// Client-side synchronization core: owns the subscription set, the
/// presence tracker and the reconciled view state, and merges every inbound
/// event on a single event-loop task. Nothing else mutates that state.
pub struct ChatClient {
    transport: Arc<dyn ChannelTransport>,
    api: Arc<dyn ConversationApi>,
    inner: Mutex<ClientState>,
    events: broadcast::Sender<ClientEvent>,
}

impl ChatClient {
    pub fn new(transport: Arc<dyn ChannelTransport>, api: Arc<dyn ConversationApi>) -> Arc<Self> {
        let (events, _) = broadcast::channel(CLIENT_EVENT_CAPACITY);
        Arc::new(Self {
            transport,
            api,
            inner: Mutex::new(ClientState {
                identity: None,
                subscriptions: SubscriptionManager::new(),
                presence: PresenceTracker::new(),
                conversations: ConversationList::default(),
                thread: None,
                loop_started: false,
            }),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Enter the signed-in context: seed the sidebar from a canonical
    /// fetch, hold the personal and presence channels, start the loop.
    pub async fn attach(
        self: &Arc<Self>,
        identity: SessionIdentity,
        initial_conversations: Vec<Conversation>,
    ) -> Result<()> {
        let mut guard = self.inner.lock().await;
        // The receiver must exist before the first subscribe so nothing
        // published during subscription (the presence snapshot) is missed.
        self.ensure_event_loop(&mut guard);
        guard.identity = Some(identity);
        guard.conversations = ConversationList::new(initial_conversations);
        self.sync_subscriptions(&mut guard).await;
        Ok(())
    }

    /// Logout: one unsubscribe per held channel, presence state cleared.
    pub async fn detach(&self) {
        let mut guard = self.inner.lock().await;
        guard.identity = None;
        guard.thread = None;
        guard.subscriptions.teardown(self.transport.as_ref()).await;
        guard.presence.unsubscribed();
        guard.conversations = ConversationList::default();
    }

    /// Open a conversation view seeded with canonically fetched messages,
    /// subscribe its channel, and register the viewer's seen-receipt.
    pub async fn open_conversation(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        initial_messages: Vec<MessagePayload>,
    ) -> Result<()> {
        {
            let mut guard = self.inner.lock().await;
            if guard.identity.is_none() {
                return Err(anyhow!("not attached"));
            }
            self.ensure_event_loop(&mut guard);
            guard.thread = Some(MessageThread::new(conversation_id.clone(), initial_messages));
            self.sync_subscriptions(&mut guard).await;
        }
        self.trigger_mark_seen(conversation_id);
        Ok(())
    }

    /// Leave the open conversation view (navigation, not deletion).
    pub async fn close_conversation(&self) {
        let mut guard = self.inner.lock().await;
        guard.thread = None;
        self.sync_subscriptions(&mut guard).await;
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.inner.lock().await.conversations.items().to_vec()
    }

    pub async fn messages(&self) -> Vec<MessagePayload> {
        self.inner
            .lock()
            .await
            .thread
            .as_ref()
            .map(|thread| thread.messages().to_vec())
            .unwrap_or_default()
    }

    pub async fn open_conversation_id(&self) -> Option<ConversationId> {
        self.inner
            .lock()
            .await
            .thread
            .as_ref()
            .map(|thread| thread.conversation_id().clone())
    }

    /// Set-membership lookup against the presence state.
    pub async fn is_online(&self, handle: &str) -> bool {
        self.inner.lock().await.presence.is_online(handle)
    }

    pub async fn online_members(&self) -> Vec<String> {
        self.inner.lock().await.presence.members()
    }

    pub async fn unseen_count(&self) -> u32 {
        self.inner
            .lock()
            .await
            .thread
            .as_ref()
            .map(|thread| thread.scroll().unseen())
            .unwrap_or(0)
    }

    /// Viewer scroll observation for the badge heuristic.
    pub async fn record_scroll(&self, scroll_height: f64, scroll_top: f64, viewport_height: f64) {
        let changed = {
            let mut guard = self.inner.lock().await;
            let Some(thread) = guard.thread.as_mut() else {
                return;
            };
            let before = thread.scroll().unseen();
            thread
                .scroll_mut()
                .record_scroll(scroll_height, scroll_top, viewport_height);
            let after = thread.scroll().unseen();
            (before != after).then_some(after)
        };
        if let Some(count) = changed {
            let _ = self.events.send(ClientEvent::UnseenBadge { count });
        }
    }

    pub async fn scrolled_to_bottom(&self) {
        let changed = {
            let mut guard = self.inner.lock().await;
            let Some(thread) = guard.thread.as_mut() else {
                return;
            };
            let before = thread.scroll().unseen();
            thread.scroll_mut().scrolled_to_bottom();
            before != 0
        };
        if changed {
            let _ = self.events.send(ClientEvent::UnseenBadge { count: 0 });
        }
    }

    async fn sync_subscriptions(&self, state: &mut ClientState) {
        let desired = match &state.identity {
            Some(identity) => channels_for_context(
                &identity.email,
                state.thread.as_ref().map(|thread| thread.conversation_id()),
            ),
            None => HashSet::new(),
        };
        let was_presence_active = state.subscriptions.is_active(&ChannelName::presence());
        let newly = state
            .subscriptions
            .apply(self.transport.as_ref(), desired)
            .await;
        if newly.iter().any(ChannelName::is_presence) {
            state.presence.subscribe_started();
        } else if was_presence_active && !state.subscriptions.is_active(&ChannelName::presence()) {
            state.presence.unsubscribed();
        }
    }

    fn ensure_event_loop(self: &Arc<Self>, state: &mut ClientState) {
        if state.loop_started {
            return;
        }
        state.loop_started = true;
        let mut incoming = self.transport.incoming();
        let client = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match incoming.recv().await {
                    Ok(envelope) => client.handle_envelope(envelope).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event loop lagged; view may be stale until next fetch");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            client.inner.lock().await.loop_started = false;
        });
    }

    /// Leaf handler on the single event-loop task. Merges are plain state
    /// updates; the only follow-up round trip (mark seen) is spawned and
    /// never blocks delivery of subsequent events.
    async fn handle_envelope(self: &Arc<Self>, envelope: Envelope) {
        let Envelope { channel, event } = envelope;
        match event {
            ChannelEvent::MessageNew(message) => {
                let outcome = {
                    let mut guard = self.inner.lock().await;
                    let Some(thread) = guard.thread.as_mut() else {
                        return;
                    };
                    if ChannelName::conversation(thread.conversation_id()) != channel {
                        return;
                    }
                    let conversation_id = thread.conversation_id().clone();
                    match thread.apply_new(message) {
                        NewMessageOutcome::Duplicate => None,
                        NewMessageOutcome::Appended(action) => Some((conversation_id, action)),
                    }
                };
                if let Some((conversation_id, action)) = outcome {
                    let _ = self.events.send(ClientEvent::MessagesChanged);
                    match action {
                        ArrivalAction::AutoScroll => {
                            let _ = self.events.send(ClientEvent::AutoScroll);
                        }
                        ArrivalAction::Badge { unseen } => {
                            let _ = self.events.send(ClientEvent::UnseenBadge { count: unseen });
                        }
                    }
                    // Reading a live conversation keeps the seen-marker
                    // current without manual action.
                    self.trigger_mark_seen(conversation_id);
                }
            }
            ChannelEvent::MessageUpdate(message) => {
                let applied = {
                    let mut guard = self.inner.lock().await;
                    match guard.thread.as_mut() {
                        Some(thread)
                            if ChannelName::conversation(thread.conversation_id()) == channel =>
                        {
                            thread.apply_update(message)
                        }
                        _ => false,
                    }
                };
                if applied {
                    let _ = self.events.send(ClientEvent::MessagesChanged);
                }
            }
            ChannelEvent::ConversationNew(conversation) => {
                let inserted = self.inner.lock().await.conversations.apply_new(conversation);
                if inserted {
                    let _ = self.events.send(ClientEvent::ConversationsChanged);
                }
            }
            ChannelEvent::ConversationUpdate(delta) => {
                let applied = self.inner.lock().await.conversations.apply_update(delta);
                if applied {
                    let _ = self.events.send(ClientEvent::ConversationsChanged);
                }
            }
            ChannelEvent::ConversationRemove(conversation) => {
                let (removed, closed) = {
                    let mut guard = self.inner.lock().await;
                    let removed = guard.conversations.remove(&conversation.id);
                    let was_open = guard
                        .thread
                        .as_ref()
                        .is_some_and(|thread| thread.conversation_id() == &conversation.id);
                    if was_open {
                        guard.thread = None;
                        self.sync_subscriptions(&mut guard).await;
                    }
                    (removed, was_open)
                };
                if removed {
                    let _ = self.events.send(ClientEvent::ConversationsChanged);
                }
                if closed {
                    let _ = self.events.send(ClientEvent::NavigatedAway {
                        conversation_id: conversation.id,
                    });
                }
            }
            ChannelEvent::ConversationUser(activity) => {
                // The sidebar deliberately ignores these; surface them for
                // whatever the UI wants to do with activity.
                let _ = self.events.send(ClientEvent::Activity(activity));
            }
            ChannelEvent::SubscriptionSucceeded(members) if channel.is_presence() => {
                let mut guard = self.inner.lock().await;
                guard
                    .presence
                    .snapshot(members.into_iter().map(|member| member.id));
                drop(guard);
                let _ = self.events.send(ClientEvent::PresenceChanged);
            }
            ChannelEvent::MemberAdded(member) if channel.is_presence() => {
                self.inner.lock().await.presence.member_added(member.id);
                let _ = self.events.send(ClientEvent::PresenceChanged);
            }
            ChannelEvent::MemberRemoved(member) if channel.is_presence() => {
                self.inner.lock().await.presence.member_removed(&member.id);
                let _ = self.events.send(ClientEvent::PresenceChanged);
            }
            _ => {}
        }
    }

    fn trigger_mark_seen(self: &Arc<Self>, conversation_id: ConversationId) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(error) = client.api.mark_seen(&conversation_id).await {
                let _ = client.events.send(ClientEvent::Error(format!(
                    "failed to mark {conversation_id} seen: {error}"
                )));
            }
        });
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
