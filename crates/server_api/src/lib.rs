use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use shared::{
    channels::ChannelName,
    domain::{ConversationId, User, UserId},
    error::{ApiError, ErrorCode},
    protocol::{ChannelEvent, Conversation, ConversationActivity, ConversationDelta, MessagePayload},
};
use storage::{NewMessage, Storage, StoredConversation, StoredMessage};
use tracing::warn;
use transport::EventPublisher;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub publisher: Arc<dyn EventPublisher>,
}

/// Identity handed out by the session collaborator.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub id: UserId,
    pub email: String,
}

impl From<&User> for CurrentUser {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            email: user.email.clone(),
        }
    }
}

/// Session collaborator boundary: resolve a bearer token to a user, if any.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn current_user(&self, token: &str) -> anyhow::Result<Option<CurrentUser>>;
}

#[async_trait]
impl SessionStore for Storage {
    async fn current_user(&self, token: &str) -> anyhow::Result<Option<CurrentUser>> {
        Ok(self
            .user_for_session(token)
            .await?
            .map(|user| CurrentUser::from(&user)))
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewConversationRequest {
    /// Peer for a direct conversation; ignored for groups.
    pub user_id: Option<UserId>,
    pub is_group: bool,
    /// Additional members beyond the creator; groups require at least one.
    pub members: Vec<UserId>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SendMessageRequest {
    pub body: Option<String>,
    pub image: Option<String>,
    /// Correlation id echoed back on `messages:new` for optimistic senders.
    pub client_id: Option<String>,
}

/// Result of the idempotent mark-seen transition.
#[derive(Debug, Clone)]
pub enum SeenOutcome {
    /// Nothing to record: no messages, or the viewer already saw the latest.
    Unchanged(Conversation),
    Updated(MessagePayload),
}

/// Stand-in for the external session-issuance collaborator: upsert the user
/// and hand out a bearer token.
pub async fn open_session(
    ctx: &ApiContext,
    email: &str,
    name: Option<&str>,
) -> Result<(User, String), ApiError> {
    let email = email.trim();
    if email.is_empty() || !email.contains('@') {
        return Err(ApiError::validation("a valid email is required"));
    }
    let user = ctx
        .storage
        .create_user(email, name)
        .await
        .map_err(internal)?;
    let token = ctx.storage.insert_session(&user.id).await.map_err(internal)?;
    Ok((user, token))
}

pub async fn find_users(ctx: &ApiContext, current: &CurrentUser) -> Result<Vec<User>, ApiError> {
    ctx.storage
        .find_users(&current.email)
        .await
        .map_err(internal)
}

pub async fn list_conversations(
    ctx: &ApiContext,
    current: &CurrentUser,
) -> Result<Vec<Conversation>, ApiError> {
    let stored = ctx
        .storage
        .conversations_for_user(&current.id)
        .await
        .map_err(internal)?;
    let mut conversations = Vec::with_capacity(stored.len());
    for conversation in stored {
        let messages = ctx
            .storage
            .messages_for_conversation(&conversation.id)
            .await
            .map_err(internal)?;
        conversations.push(to_conversation(conversation, messages));
    }
    Ok(conversations)
}

pub async fn list_messages(
    ctx: &ApiContext,
    current: &CurrentUser,
    conversation_id: &ConversationId,
) -> Result<Vec<MessagePayload>, ApiError> {
    ensure_membership(ctx, conversation_id, current).await?;
    let messages = ctx
        .storage
        .messages_for_conversation(conversation_id)
        .await
        .map_err(internal)?;
    Ok(messages.into_iter().map(to_message).collect())
}

/// Create a conversation and announce it on every member's personal channel.
/// Direct conversations deduplicate against an existing two-member thread,
/// in which case nothing is published.
pub async fn create_conversation(
    ctx: &ApiContext,
    current: &CurrentUser,
    request: NewConversationRequest,
) -> Result<Conversation, ApiError> {
    if request.is_group {
        if request.members.is_empty() || request.name.is_none() {
            return Err(ApiError::validation("missing required fields"));
        }
        let mut member_ids = request.members;
        member_ids.push(current.id.clone());
        let stored = ctx
            .storage
            .create_conversation(request.name.as_deref(), true, &member_ids)
            .await
            .map_err(internal)?;
        let conversation = to_conversation(stored, Vec::new());
        announce_to_members(ctx, &conversation.users, |_| {
            ChannelEvent::ConversationNew(conversation.clone())
        })
        .await;
        return Ok(conversation);
    }

    let peer_id = request
        .user_id
        .ok_or_else(|| ApiError::validation("user_id is required"))?;
    if let Some(existing) = ctx
        .storage
        .find_one_to_one(&current.id, &peer_id)
        .await
        .map_err(internal)?
    {
        return Ok(to_conversation(existing, Vec::new()));
    }

    let stored = ctx
        .storage
        .create_conversation(None, false, &[current.id.clone(), peer_id])
        .await
        .map_err(internal)?;
    let conversation = to_conversation(stored, Vec::new());
    announce_to_members(ctx, &conversation.users, |_| {
        ChannelEvent::ConversationNew(conversation.clone())
    })
    .await;
    Ok(conversation)
}

/// Append a message, then fan out: `messages:new` on the conversation
/// channel and a `conversation:user` preview on each member's personal
/// channel. Publishes happen after the durable write and cannot fail it.
pub async fn send_message(
    ctx: &ApiContext,
    current: &CurrentUser,
    conversation_id: &ConversationId,
    request: SendMessageRequest,
) -> Result<MessagePayload, ApiError> {
    if request.body.is_none() && request.image.is_none() {
        return Err(ApiError::validation("message needs a body or an image"));
    }
    let conversation = require_conversation(ctx, conversation_id).await?;
    ensure_member(&conversation, current)?;

    let stored = ctx
        .storage
        .append_message(
            conversation_id,
            &current.id,
            NewMessage {
                body: request.body.as_deref(),
                image: request.image.as_deref(),
            },
        )
        .await
        .map_err(internal)?;
    let mut message = to_message(stored);
    message.client_id = request.client_id;

    let mut targets = vec![(
        ChannelName::conversation(conversation_id),
        ChannelEvent::MessageNew(message.clone()),
    )];
    let preview = message.without_client_id();
    for member in &conversation.users {
        targets.push((
            ChannelName::user(&member.email),
            ChannelEvent::ConversationUser(ConversationActivity {
                id: conversation_id.clone(),
                last_message: preview.clone(),
            }),
        ));
    }
    fan_out(ctx, targets).await;

    Ok(message)
}

/// Idempotent seen-receipt transition for the conversation's most recent
/// message. Repeated calls after the first are no-ops and publish nothing.
pub async fn mark_seen(
    ctx: &ApiContext,
    current: &CurrentUser,
    conversation_id: &ConversationId,
) -> Result<SeenOutcome, ApiError> {
    let conversation = require_conversation(ctx, conversation_id).await?;
    ensure_member(&conversation, current)?;

    let Some(last) = ctx
        .storage
        .last_message(conversation_id)
        .await
        .map_err(internal)?
    else {
        return Ok(SeenOutcome::Unchanged(to_conversation(conversation, Vec::new())));
    };

    if last.seen.iter().any(|viewer| viewer.id == current.id) {
        let messages = ctx
            .storage
            .messages_for_conversation(conversation_id)
            .await
            .map_err(internal)?;
        return Ok(SeenOutcome::Unchanged(to_conversation(conversation, messages)));
    }

    let newly_added = ctx
        .storage
        .mark_message_seen(&last.id, &current.id)
        .await
        .map_err(internal)?;
    let updated = ctx
        .storage
        .find_message(&last.id)
        .await
        .map_err(internal)?
        .map(to_message)
        .ok_or_else(|| ApiError::not_found("message disappeared while marking seen"))?;

    // A concurrent call may have won the insert; only the winner publishes.
    if newly_added {
        fan_out(
            ctx,
            vec![
                (
                    ChannelName::user(&current.email),
                    ChannelEvent::ConversationUpdate(ConversationDelta {
                        id: conversation_id.clone(),
                        messages: Some(vec![updated.clone()]),
                        users: None,
                    }),
                ),
                (
                    ChannelName::conversation(conversation_id),
                    ChannelEvent::MessageUpdate(updated.clone()),
                ),
            ],
        )
        .await;
    }

    Ok(SeenOutcome::Updated(updated))
}

/// Delete a conversation and tell every member to drop it.
pub async fn delete_conversation(
    ctx: &ApiContext,
    current: &CurrentUser,
    conversation_id: &ConversationId,
) -> Result<Conversation, ApiError> {
    let conversation = require_conversation(ctx, conversation_id).await?;
    ensure_member(&conversation, current)?;

    ctx.storage
        .delete_conversation(conversation_id)
        .await
        .map_err(internal)?;

    let payload = to_conversation(conversation, Vec::new());
    announce_to_members(ctx, &payload.users, |_| {
        ChannelEvent::ConversationRemove(payload.clone())
    })
    .await;
    Ok(payload)
}

/// Add a user to a group. The new member learns about the conversation via
/// `conversation:new`; everyone else receives refreshed membership.
pub async fn add_member(
    ctx: &ApiContext,
    current: &CurrentUser,
    conversation_id: &ConversationId,
    user_id: &UserId,
) -> Result<Conversation, ApiError> {
    let conversation = require_conversation(ctx, conversation_id).await?;
    ensure_member(&conversation, current)?;
    if !conversation.is_group {
        return Err(ApiError::validation("not a group conversation"));
    }
    if conversation.users.iter().any(|user| &user.id == user_id) {
        return Err(ApiError::validation("user is already a member"));
    }
    if ctx
        .storage
        .user_by_id(user_id)
        .await
        .map_err(internal)?
        .is_none()
    {
        return Err(ApiError::not_found("user not found"));
    }

    ctx.storage
        .add_member(conversation_id, user_id)
        .await
        .map_err(internal)?;
    let refreshed = require_conversation(ctx, conversation_id).await?;
    let payload = to_conversation(refreshed, Vec::new());

    let mut targets = Vec::new();
    for member in &payload.users {
        if &member.id == user_id {
            targets.push((
                ChannelName::user(&member.email),
                ChannelEvent::ConversationNew(payload.clone()),
            ));
        } else {
            targets.push((
                ChannelName::user(&member.email),
                ChannelEvent::ConversationUpdate(ConversationDelta {
                    id: conversation_id.clone(),
                    messages: None,
                    users: Some(payload.users.clone()),
                }),
            ));
        }
    }
    fan_out(ctx, targets).await;
    Ok(payload)
}

/// Remove a user from a group. The removed member's sidebar drops the
/// conversation; remaining members receive refreshed membership.
pub async fn remove_member(
    ctx: &ApiContext,
    current: &CurrentUser,
    conversation_id: &ConversationId,
    user_id: &UserId,
) -> Result<Conversation, ApiError> {
    let conversation = require_conversation(ctx, conversation_id).await?;
    ensure_member(&conversation, current)?;
    if !conversation.is_group {
        return Err(ApiError::validation("not a group conversation"));
    }
    let Some(removed) = conversation
        .users
        .iter()
        .find(|user| &user.id == user_id)
        .cloned()
    else {
        return Err(ApiError::validation("user is not a member"));
    };

    ctx.storage
        .remove_member(conversation_id, user_id)
        .await
        .map_err(internal)?;
    let refreshed = require_conversation(ctx, conversation_id).await?;
    let payload = to_conversation(refreshed, Vec::new());
    let full_before = to_conversation(conversation, Vec::new());

    let mut targets = vec![(
        ChannelName::user(&removed.email),
        ChannelEvent::ConversationRemove(full_before),
    )];
    for member in &payload.users {
        targets.push((
            ChannelName::user(&member.email),
            ChannelEvent::ConversationUpdate(ConversationDelta {
                id: conversation_id.clone(),
                messages: None,
                users: Some(payload.users.clone()),
            }),
        ));
    }
    fan_out(ctx, targets).await;
    Ok(payload)
}

async fn require_conversation(
    ctx: &ApiContext,
    conversation_id: &ConversationId,
) -> Result<StoredConversation, ApiError> {
    ctx.storage
        .find_conversation(conversation_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("conversation not found"))
}

async fn ensure_membership(
    ctx: &ApiContext,
    conversation_id: &ConversationId,
    current: &CurrentUser,
) -> Result<(), ApiError> {
    let is_member = ctx
        .storage
        .is_member(conversation_id, &current.id)
        .await
        .map_err(internal)?;
    if is_member {
        Ok(())
    } else {
        Err(ApiError::new(ErrorCode::Forbidden, "not a member"))
    }
}

fn ensure_member(conversation: &StoredConversation, current: &CurrentUser) -> Result<(), ApiError> {
    if conversation.users.iter().any(|user| user.id == current.id) {
        Ok(())
    } else {
        Err(ApiError::new(ErrorCode::Forbidden, "not a member"))
    }
}

/// One event per member's personal channel.
async fn announce_to_members<F>(ctx: &ApiContext, members: &[User], event_for: F)
where
    F: Fn(&User) -> ChannelEvent,
{
    let targets = members
        .iter()
        .map(|member| (ChannelName::user(&member.email), event_for(member)))
        .collect();
    fan_out(ctx, targets).await;
}

/// Publish each (channel, event) pair independently and concurrently. A
/// failed publish is logged and dropped; the durable write already
/// committed and the remaining recipients still get theirs.
async fn fan_out(ctx: &ApiContext, targets: Vec<(ChannelName, ChannelEvent)>) {
    let publishes = targets.into_iter().map(|(channel, event)| {
        let publisher = Arc::clone(&ctx.publisher);
        async move {
            if let Err(error) = publisher.publish(&channel, event).await {
                warn!(%channel, %error, "event publish failed; recipient will catch up on next fetch");
            }
        }
    });
    join_all(publishes).await;
}

fn to_conversation(stored: StoredConversation, messages: Vec<StoredMessage>) -> Conversation {
    Conversation {
        id: stored.id,
        name: stored.name,
        is_group: stored.is_group,
        last_message_at: stored.last_message_at,
        users: stored.users,
        messages: messages.into_iter().map(to_message).collect(),
    }
}

fn to_message(stored: StoredMessage) -> MessagePayload {
    MessagePayload {
        id: stored.id,
        body: stored.body,
        image: stored.image,
        sender: stored.sender,
        created_at: stored.created_at,
        seen: stored.seen,
        client_id: None,
    }
}

fn internal(error: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, error.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
