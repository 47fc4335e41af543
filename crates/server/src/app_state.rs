use std::sync::Arc;

use server_api::{ApiContext, SessionStore};

use crate::broker::Broker;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) sessions: Arc<dyn SessionStore>,
    pub(crate) broker: Arc<Broker>,
    pub(crate) channel_auth_secret: String,
    pub(crate) channel_auth_ttl_seconds: i64,
}
