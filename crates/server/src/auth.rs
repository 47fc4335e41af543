use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Claims of a channel-authorization grant. The grant is bound to one
/// (socket, channel) pair so it cannot be replayed from another connection.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChannelGrant {
    pub socket_id: String,
    pub channel_name: String,
    /// Presence identity: the authorizing user's email handle.
    pub user_id: String,
    pub exp: i64,
}

pub fn sign_channel_grant(
    secret: &str,
    socket_id: &str,
    channel_name: &str,
    handle: &str,
    ttl_seconds: i64,
) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = ChannelGrant {
        socket_id: socket_id.to_owned(),
        channel_name: channel_name.to_owned(),
        user_id: handle.to_owned(),
        exp: Utc::now().timestamp() + ttl_seconds,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

/// Validate signature and expiry, then pin the grant to the presented
/// socket and channel. Returns the claims on success.
pub fn verify_channel_grant(
    secret: &str,
    token: &str,
    socket_id: &str,
    channel_name: &str,
) -> Option<ChannelGrant> {
    let decoded = decode::<ChannelGrant>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .ok()?;
    let grant = decoded.claims;
    if grant.socket_id != socket_id || grant.channel_name != channel_name {
        debug!(
            socket_id,
            channel_name, "channel grant bound to a different socket or channel"
        );
        return None;
    }
    Some(grant)
}
