use super::*;
use std::time::Duration;

use chrono::Utc;
use server_api::{ApiContext, CurrentUser, NewConversationRequest, SeenOutcome, SendMessageRequest};
use shared::domain::{MessageId, User, UserSummary};
use storage::Storage;
use tokio::time::timeout;
use transport::{EventPublisher, LocalBus, PublishError};

/// Seen-receipt collaborator wired straight to the write path, the way the
/// HTTP implementation is wired to the seen endpoint.
struct DirectSeenApi {
    ctx: ApiContext,
    viewer: CurrentUser,
}

#[async_trait]
impl ConversationApi for DirectSeenApi {
    async fn mark_seen(&self, conversation_id: &ConversationId) -> Result<()> {
        server_api::mark_seen(&self.ctx, &self.viewer, conversation_id)
            .await
            .map_err(|error| anyhow!(error.message))?;
        Ok(())
    }
}

struct NoopApi;

#[async_trait]
impl ConversationApi for NoopApi {
    async fn mark_seen(&self, _conversation_id: &ConversationId) -> Result<()> {
        Ok(())
    }
}

/// Per-connection delivery: one LocalBus per client, one publish per bus.
struct MultiBus(Vec<Arc<LocalBus>>);

#[async_trait]
impl EventPublisher for MultiBus {
    async fn publish(&self, channel: &ChannelName, event: ChannelEvent) -> Result<(), PublishError> {
        for bus in &self.0 {
            bus.publish(channel, event.clone()).await?;
        }
        Ok(())
    }
}

async fn backend() -> (Storage, User, User) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let ada = storage
        .create_user("ada@mail.io", Some("Ada"))
        .await
        .expect("user");
    let grace = storage
        .create_user("grace@mail.io", Some("Grace"))
        .await
        .expect("user");
    (storage, ada, grace)
}

fn identity(user: &User) -> SessionIdentity {
    SessionIdentity {
        user_id: user.id.clone(),
        email: user.email.clone(),
    }
}

fn payload(id: &str, sender: &User) -> MessagePayload {
    MessagePayload {
        id: MessageId::from(id),
        body: Some(id.to_owned()),
        image: None,
        sender: UserSummary::from(sender),
        created_at: Utc::now(),
        seen: vec![UserSummary::from(sender)],
        client_id: None,
    }
}

async fn wait_for<F>(
    rx: &mut broadcast::Receiver<ClientEvent>,
    description: &str,
    mut pred: F,
) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    timeout(Duration::from_secs(2), async {
        loop {
            let event = rx.recv().await.expect("event stream open");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {description}"))
}

async fn assert_quiet<F>(rx: &mut broadcast::Receiver<ClientEvent>, description: &str, mut pred: F)
where
    F: FnMut(&ClientEvent) -> bool,
{
    let observed = timeout(Duration::from_millis(300), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(_) => std::future::pending::<()>().await,
            }
        }
    })
    .await;
    assert!(observed.is_err(), "unexpected {description}: {observed:?}");
}

#[tokio::test]
async fn message_fanout_reaches_thread_and_activity_then_seen_settles() {
    let (storage, ada, grace) = backend().await;
    let bus = Arc::new(LocalBus::new());
    let ctx = ApiContext {
        storage,
        publisher: bus.clone(),
    };
    let ada_current = CurrentUser::from(&ada);
    let grace_current = CurrentUser::from(&grace);

    let conversation = server_api::create_conversation(
        &ctx,
        &ada_current,
        NewConversationRequest {
            user_id: Some(grace.id.clone()),
            ..Default::default()
        },
    )
    .await
    .expect("conversation");

    let client = ChatClient::new(
        bus.clone(),
        Arc::new(DirectSeenApi {
            ctx: ctx.clone(),
            viewer: grace_current.clone(),
        }),
    );
    let sidebar = server_api::list_conversations(&ctx, &grace_current)
        .await
        .expect("sidebar");
    client.attach(identity(&grace), sidebar).await.expect("attach");
    client
        .open_conversation(conversation.id.clone(), Vec::new())
        .await
        .expect("open");

    let mut changes = client.subscribe_events();
    let mut activity = client.subscribe_events();

    let message = server_api::send_message(
        &ctx,
        &ada_current,
        &conversation.id,
        SendMessageRequest {
            body: Some("hi".to_owned()),
            client_id: Some("tmp-1".to_owned()),
            ..Default::default()
        },
    )
    .await
    .expect("send");
    assert_eq!(message.client_id.as_deref(), Some("tmp-1"));

    // Scenario A: the thread receives the message with the sender summary
    // attached.
    wait_for(&mut changes, "message append", |event| {
        matches!(event, ClientEvent::MessagesChanged)
    })
    .await;
    let thread = client.messages().await;
    assert_eq!(thread.len(), 1);
    assert_eq!(thread[0].id, message.id);
    assert_eq!(thread[0].sender.email, ada.email);

    // ...and the personal channel carries the last-message preview.
    let event = wait_for(&mut activity, "conversation activity", |event| {
        matches!(event, ClientEvent::Activity(_))
    })
    .await;
    match event {
        ClientEvent::Activity(activity) => {
            assert_eq!(activity.id, conversation.id);
            assert_eq!(activity.last_message.id, message.id);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // Scenario B: the inbound message triggered the seen-receipt; the
    // resulting message:update lands as the second thread change.
    wait_for(&mut changes, "seen update", |event| {
        matches!(event, ClientEvent::MessagesChanged)
    })
    .await;
    let thread = client.messages().await;
    assert!(thread[0]
        .seen
        .iter()
        .any(|viewer| viewer.email == grace.email));

    // A further explicit call is a no-op and publishes nothing.
    let mut quiet = client.subscribe_events();
    let outcome = server_api::mark_seen(&ctx, &grace_current, &conversation.id)
        .await
        .expect("repeat mark seen");
    assert!(matches!(outcome, SeenOutcome::Unchanged(_)));
    assert_quiet(&mut quiet, "thread change after idempotent re-mark", |event| {
        matches!(event, ClientEvent::MessagesChanged)
    })
    .await;
}

#[tokio::test]
async fn duplicate_message_delivery_is_suppressed() {
    let (_, ada, grace) = backend().await;
    let bus = Arc::new(LocalBus::new());
    let client = ChatClient::new(bus.clone(), Arc::new(NoopApi));
    client.attach(identity(&grace), Vec::new()).await.expect("attach");
    let conversation_id = ConversationId::from("c1");
    client
        .open_conversation(conversation_id.clone(), Vec::new())
        .await
        .expect("open");

    let mut changes = client.subscribe_events();
    let channel = ChannelName::conversation(&conversation_id);
    bus.publish(&channel, ChannelEvent::MessageNew(payload("m1", &ada)))
        .await
        .expect("publish");
    wait_for(&mut changes, "first append", |event| {
        matches!(event, ClientEvent::MessagesChanged)
    })
    .await;

    let mut quiet = client.subscribe_events();
    bus.publish(&channel, ChannelEvent::MessageNew(payload("m1", &ada)))
        .await
        .expect("publish duplicate");
    assert_quiet(&mut quiet, "change from duplicate delivery", |event| {
        matches!(event, ClientEvent::MessagesChanged)
    })
    .await;
    assert_eq!(client.messages().await.len(), 1);
}

#[tokio::test]
async fn update_arriving_before_new_does_not_corrupt_the_thread() {
    let (_, ada, grace) = backend().await;
    let bus = Arc::new(LocalBus::new());
    let client = ChatClient::new(bus.clone(), Arc::new(NoopApi));
    client.attach(identity(&grace), Vec::new()).await.expect("attach");
    let conversation_id = ConversationId::from("c1");
    client
        .open_conversation(conversation_id.clone(), Vec::new())
        .await
        .expect("open");
    let channel = ChannelName::conversation(&conversation_id);

    // Cross-channel ordering can deliver the update first; it must be a
    // silent no-op.
    let mut quiet = client.subscribe_events();
    bus.publish(&channel, ChannelEvent::MessageUpdate(payload("m9", &ada)))
        .await
        .expect("publish early update");
    assert_quiet(&mut quiet, "change from unmatched update", |event| {
        matches!(event, ClientEvent::MessagesChanged)
    })
    .await;
    assert!(client.messages().await.is_empty());

    let mut changes = client.subscribe_events();
    bus.publish(&channel, ChannelEvent::MessageNew(payload("m9", &ada)))
        .await
        .expect("publish");
    wait_for(&mut changes, "late append", |event| {
        matches!(event, ClientEvent::MessagesChanged)
    })
    .await;

    let mut updated = payload("m9", &ada);
    updated.seen.push(UserSummary::from(&grace));
    bus.publish(&channel, ChannelEvent::MessageUpdate(updated))
        .await
        .expect("publish update");
    wait_for(&mut changes, "replace in place", |event| {
        matches!(event, ClientEvent::MessagesChanged)
    })
    .await;

    let thread = client.messages().await;
    assert_eq!(thread.len(), 1);
    assert_eq!(thread[0].seen.len(), 2);
}

#[tokio::test]
async fn remote_removal_navigates_away_exactly_once() {
    let (storage, ada, grace) = backend().await;
    let bus = Arc::new(LocalBus::new());
    let ctx = ApiContext {
        storage,
        publisher: bus.clone(),
    };
    let ada_current = CurrentUser::from(&ada);
    let grace_current = CurrentUser::from(&grace);
    let conversation = server_api::create_conversation(
        &ctx,
        &ada_current,
        NewConversationRequest {
            user_id: Some(grace.id.clone()),
            ..Default::default()
        },
    )
    .await
    .expect("conversation");

    let client = ChatClient::new(bus.clone(), Arc::new(NoopApi));
    let sidebar = server_api::list_conversations(&ctx, &grace_current)
        .await
        .expect("sidebar");
    client.attach(identity(&grace), sidebar).await.expect("attach");
    client
        .open_conversation(conversation.id.clone(), Vec::new())
        .await
        .expect("open");

    let mut events = client.subscribe_events();
    let removed = server_api::delete_conversation(&ctx, &ada_current, &conversation.id)
        .await
        .expect("delete");

    let event = wait_for(&mut events, "navigation away", |event| {
        matches!(event, ClientEvent::NavigatedAway { .. })
    })
    .await;
    match event {
        ClientEvent::NavigatedAway { conversation_id } => {
            assert_eq!(conversation_id, conversation.id)
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(client.conversations().await.is_empty());
    assert!(client.open_conversation_id().await.is_none());

    // Duplicate removal event: silently ignored, no second navigation.
    let mut quiet = client.subscribe_events();
    bus.publish(
        &ChannelName::user(&grace.email),
        ChannelEvent::ConversationRemove(removed),
    )
    .await
    .expect("republish");
    assert_quiet(&mut quiet, "second navigation", |event| {
        matches!(
            event,
            ClientEvent::NavigatedAway { .. } | ClientEvent::ConversationsChanged
        )
    })
    .await;
}

#[tokio::test]
async fn presence_follows_snapshot_and_membership_events() {
    let (_, ada, grace) = backend().await;
    let bus = Arc::new(LocalBus::with_identity(Some(grace.email.clone())));
    bus.set_presence_roster(vec![ada.email.clone()]).await;

    let client = ChatClient::new(bus.clone(), Arc::new(NoopApi));
    let mut events = client.subscribe_events();
    client.attach(identity(&grace), Vec::new()).await.expect("attach");

    wait_for(&mut events, "presence snapshot", |event| {
        matches!(event, ClientEvent::PresenceChanged)
    })
    .await;
    assert!(client.is_online(&ada.email).await);
    assert!(client.is_online(&grace.email).await);

    let presence = ChannelName::presence();
    bus.publish(
        &presence,
        ChannelEvent::MemberRemoved(shared::protocol::PresenceMember {
            id: ada.email.clone(),
        }),
    )
    .await
    .expect("publish");
    wait_for(&mut events, "member removal", |event| {
        matches!(event, ClientEvent::PresenceChanged)
    })
    .await;
    assert!(!client.is_online(&ada.email).await);

    bus.publish(
        &presence,
        ChannelEvent::MemberAdded(shared::protocol::PresenceMember {
            id: "eve@mail.io".to_owned(),
        }),
    )
    .await
    .expect("publish");
    wait_for(&mut events, "member addition", |event| {
        matches!(event, ClientEvent::PresenceChanged)
    })
    .await;
    assert!(client.is_online("eve@mail.io").await);

    client.detach().await;
    assert!(client.online_members().await.is_empty());
}

#[tokio::test]
async fn group_member_removal_refreshes_remaining_and_drops_removed() {
    let (storage, ada, grace) = backend().await;
    let eve = storage
        .create_user("eve@mail.io", Some("Eve"))
        .await
        .expect("user");
    let grace_bus = Arc::new(LocalBus::new());
    let eve_bus = Arc::new(LocalBus::new());
    let ctx = ApiContext {
        storage,
        publisher: Arc::new(MultiBus(vec![grace_bus.clone(), eve_bus.clone()])),
    };
    let ada_current = CurrentUser::from(&ada);
    let grace_current = CurrentUser::from(&grace);
    let eve_current = CurrentUser::from(&eve);

    let group = server_api::create_conversation(
        &ctx,
        &ada_current,
        NewConversationRequest {
            is_group: true,
            members: vec![grace.id.clone(), eve.id.clone()],
            name: Some("trio".to_owned()),
            ..Default::default()
        },
    )
    .await
    .expect("group");

    let grace_client = ChatClient::new(grace_bus.clone(), Arc::new(NoopApi));
    grace_client
        .attach(
            identity(&grace),
            server_api::list_conversations(&ctx, &grace_current)
                .await
                .expect("sidebar"),
        )
        .await
        .expect("attach");

    let eve_client = ChatClient::new(eve_bus.clone(), Arc::new(NoopApi));
    eve_client
        .attach(
            identity(&eve),
            server_api::list_conversations(&ctx, &eve_current)
                .await
                .expect("sidebar"),
        )
        .await
        .expect("attach");
    eve_client
        .open_conversation(group.id.clone(), Vec::new())
        .await
        .expect("open");

    let mut grace_events = grace_client.subscribe_events();
    let mut eve_events = eve_client.subscribe_events();

    server_api::remove_member(&ctx, &ada_current, &group.id, &eve.id)
        .await
        .expect("remove member");

    // Remaining member sees refreshed membership in place.
    wait_for(&mut grace_events, "membership refresh", |event| {
        matches!(event, ClientEvent::ConversationsChanged)
    })
    .await;
    let sidebar = grace_client.conversations().await;
    let entry = sidebar
        .iter()
        .find(|item| item.id == group.id)
        .expect("group still listed");
    assert_eq!(entry.users.len(), 2);
    assert!(entry.users.iter().all(|user| user.id != eve.id));

    // Removed member is navigated out and their sidebar drops the group.
    wait_for(&mut eve_events, "removal navigation", |event| {
        matches!(event, ClientEvent::NavigatedAway { .. })
    })
    .await;
    assert!(eve_client.conversations().await.is_empty());
}

#[tokio::test]
async fn closing_a_conversation_releases_only_its_channel() {
    let (_, _, grace) = backend().await;
    let bus = Arc::new(LocalBus::new());
    let client = ChatClient::new(bus.clone(), Arc::new(NoopApi));
    client.attach(identity(&grace), Vec::new()).await.expect("attach");
    let conversation_id = ConversationId::from("c1");
    client
        .open_conversation(conversation_id.clone(), Vec::new())
        .await
        .expect("open");

    let channel = ChannelName::conversation(&conversation_id);
    assert!(bus.is_subscribed(&channel).await);

    client.close_conversation().await;
    assert!(!bus.is_subscribed(&channel).await);
    assert!(bus.is_subscribed(&ChannelName::user(&grace.email)).await);
    assert!(bus.is_subscribed(&ChannelName::presence()).await);
}
