use shared::{
    domain::ConversationId,
    protocol::{Conversation, ConversationDelta, MessagePayload},
};

/// Distance from the bottom (same unit as the scroll observations) within
/// which arriving messages auto-scroll instead of raising the badge.
pub const BOTTOM_PROXIMITY_THRESHOLD: f64 = 100.0;

/// What the view should do with a freshly appended message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrivalAction {
    /// Viewer is near the bottom: follow the message, no badge.
    AutoScroll,
    /// Viewer is scrolled up: hold position, bump the unseen badge.
    Badge { unseen: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewMessageOutcome {
    /// Identity key already present; at-least-once delivery suppressed.
    Duplicate,
    Appended(ArrivalAction),
}

/// Bottom-proximity heuristic for the open thread.
#[derive(Debug)]
pub struct ScrollTracker {
    near_bottom: bool,
    unseen: u32,
}

impl ScrollTracker {
    fn new() -> Self {
        Self {
            near_bottom: true,
            unseen: 0,
        }
    }

    /// Record a scroll observation. Re-entering the threshold clears the
    /// badge.
    pub fn record_scroll(&mut self, scroll_height: f64, scroll_top: f64, viewport_height: f64) {
        self.near_bottom = scroll_height - scroll_top <= viewport_height + BOTTOM_PROXIMITY_THRESHOLD;
        if self.near_bottom {
            self.unseen = 0;
        }
    }

    /// Manual jump to the newest message.
    pub fn scrolled_to_bottom(&mut self) {
        self.near_bottom = true;
        self.unseen = 0;
    }

    pub fn is_near_bottom(&self) -> bool {
        self.near_bottom
    }

    pub fn unseen(&self) -> u32 {
        self.unseen
    }

    fn on_new_message(&mut self) -> ArrivalAction {
        if self.near_bottom {
            self.unseen = 0;
            ArrivalAction::AutoScroll
        } else {
            self.unseen += 1;
            ArrivalAction::Badge {
                unseen: self.unseen,
            }
        }
    }
}

/// Ordered message sequence for the conversation currently on screen.
/// Merges are idempotent and tolerate any arrival order.
#[derive(Debug)]
pub struct MessageThread {
    conversation_id: ConversationId,
    messages: Vec<MessagePayload>,
    scroll: ScrollTracker,
}

impl MessageThread {
    /// Seed from a canonical fetch; buffered events are never the source of
    /// initial state.
    pub fn new(conversation_id: ConversationId, initial: Vec<MessagePayload>) -> Self {
        Self {
            conversation_id,
            messages: initial,
            scroll: ScrollTracker::new(),
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn messages(&self) -> &[MessagePayload] {
        &self.messages
    }

    pub fn scroll(&self) -> &ScrollTracker {
        &self.scroll
    }

    pub fn scroll_mut(&mut self) -> &mut ScrollTracker {
        &mut self.scroll
    }

    /// Append unless the identity key is already present.
    pub fn apply_new(&mut self, message: MessagePayload) -> NewMessageOutcome {
        if self.messages.iter().any(|known| known.id == message.id) {
            return NewMessageOutcome::Duplicate;
        }
        self.messages.push(message);
        NewMessageOutcome::Appended(self.scroll.on_new_message())
    }

    /// Replace in place, preserving position. Unknown ids are ignored: the
    /// update belongs to a view that is not materialized here.
    pub fn apply_update(&mut self, message: MessagePayload) -> bool {
        match self
            .messages
            .iter_mut()
            .find(|known| known.id == message.id)
        {
            Some(slot) => {
                *slot = message;
                true
            }
            None => false,
        }
    }
}

/// Sidebar collection, most recent conversation first.
#[derive(Debug, Default)]
pub struct ConversationList {
    items: Vec<Conversation>,
}

impl ConversationList {
    pub fn new(initial: Vec<Conversation>) -> Self {
        Self { items: initial }
    }

    pub fn items(&self) -> &[Conversation] {
        &self.items
    }

    pub fn get(&self, id: &ConversationId) -> Option<&Conversation> {
        self.items.iter().find(|item| &item.id == id)
    }

    /// Prepend unless already present.
    pub fn apply_new(&mut self, conversation: Conversation) -> bool {
        if self.items.iter().any(|item| item.id == conversation.id) {
            return false;
        }
        self.items.insert(0, conversation);
        true
    }

    /// Merge only the delta's present fields into the matching entry. The
    /// entry keeps its sidebar position even though its recency notionally
    /// changed.
    pub fn apply_update(&mut self, delta: ConversationDelta) -> bool {
        let Some(entry) = self.items.iter_mut().find(|item| item.id == delta.id) else {
            return false;
        };
        if let Some(messages) = delta.messages {
            entry.messages = messages;
        }
        if let Some(users) = delta.users {
            entry.users = users;
        }
        true
    }

    pub fn remove(&mut self, id: &ConversationId) -> bool {
        let before = self.items.len();
        self.items.retain(|item| &item.id != id);
        self.items.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shared::domain::{MessageId, UserId, UserSummary};

    fn sender(id: &str) -> UserSummary {
        UserSummary {
            id: UserId::from(id),
            name: None,
            email: format!("{id}@mail.io"),
        }
    }

    fn message(id: &str) -> MessagePayload {
        MessagePayload {
            id: MessageId::from(id),
            body: Some(id.to_owned()),
            image: None,
            sender: sender("u1"),
            created_at: Utc::now(),
            seen: vec![],
            client_id: None,
        }
    }

    fn conversation(id: &str) -> Conversation {
        Conversation {
            id: ConversationId::from(id),
            name: None,
            is_group: false,
            last_message_at: Utc::now(),
            users: vec![],
            messages: vec![],
        }
    }

    fn thread() -> MessageThread {
        MessageThread::new(ConversationId::from("c1"), vec![message("m1")])
    }

    #[test]
    fn duplicate_append_leaves_the_sequence_unchanged() {
        let mut thread = thread();
        assert!(matches!(
            thread.apply_new(message("m2")),
            NewMessageOutcome::Appended(_)
        ));
        let snapshot: Vec<_> = thread.messages().to_vec();

        assert_eq!(thread.apply_new(message("m2")), NewMessageOutcome::Duplicate);
        assert_eq!(thread.messages(), snapshot.as_slice());
    }

    #[test]
    fn update_before_new_is_a_noop_and_new_still_inserts() {
        let mut thread = thread();
        assert!(!thread.apply_update(message("m9")));
        assert_eq!(thread.messages().len(), 1);

        assert!(matches!(
            thread.apply_new(message("m9")),
            NewMessageOutcome::Appended(_)
        ));
        assert_eq!(thread.messages().len(), 2);
        assert_eq!(thread.messages()[1].id, MessageId::from("m9"));
    }

    #[test]
    fn update_replaces_in_place_preserving_position() {
        let mut thread = thread();
        thread.apply_new(message("m2"));
        thread.apply_new(message("m3"));

        let mut updated = message("m2");
        updated.seen = vec![sender("u2")];
        assert!(thread.apply_update(updated));

        assert_eq!(thread.messages()[1].id, MessageId::from("m2"));
        assert_eq!(thread.messages()[1].seen.len(), 1);
        assert_eq!(thread.messages().len(), 3);
    }

    #[test]
    fn arrivals_auto_scroll_near_bottom_and_badge_otherwise() {
        let mut thread = thread();
        assert_eq!(
            thread.apply_new(message("m2")),
            NewMessageOutcome::Appended(ArrivalAction::AutoScroll)
        );

        // Scroll far from the bottom.
        thread.scroll_mut().record_scroll(1000.0, 0.0, 400.0);
        assert_eq!(
            thread.apply_new(message("m3")),
            NewMessageOutcome::Appended(ArrivalAction::Badge { unseen: 1 })
        );
        assert_eq!(
            thread.apply_new(message("m4")),
            NewMessageOutcome::Appended(ArrivalAction::Badge { unseen: 2 })
        );

        // Re-entering the threshold clears the badge.
        thread.scroll_mut().record_scroll(1000.0, 550.0, 400.0);
        assert_eq!(thread.scroll().unseen(), 0);
        assert_eq!(
            thread.apply_new(message("m5")),
            NewMessageOutcome::Appended(ArrivalAction::AutoScroll)
        );
    }

    #[test]
    fn manual_scroll_to_bottom_resets_the_badge() {
        let mut thread = thread();
        thread.scroll_mut().record_scroll(1000.0, 0.0, 400.0);
        thread.apply_new(message("m2"));
        assert_eq!(thread.scroll().unseen(), 1);

        thread.scroll_mut().scrolled_to_bottom();
        assert_eq!(thread.scroll().unseen(), 0);
        assert!(thread.scroll().is_near_bottom());
    }

    #[test]
    fn sidebar_prepends_new_conversations_once() {
        let mut list = ConversationList::new(vec![conversation("c1")]);
        assert!(list.apply_new(conversation("c2")));
        assert!(!list.apply_new(conversation("c2")));
        let ids: Vec<_> = list.items().iter().map(|item| item.id.0.as_str()).collect();
        assert_eq!(ids, vec!["c2", "c1"]);
    }

    #[test]
    fn sidebar_update_merges_fields_without_resorting() {
        let mut list = ConversationList::new(vec![conversation("c1"), conversation("c2")]);
        assert!(list.apply_update(ConversationDelta {
            id: ConversationId::from("c2"),
            messages: Some(vec![message("m1")]),
            users: None,
        }));

        let ids: Vec<_> = list.items().iter().map(|item| item.id.0.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"], "position is preserved on update");
        assert_eq!(list.get(&ConversationId::from("c2")).expect("entry").messages.len(), 1);

        assert!(!list.apply_update(ConversationDelta {
            id: ConversationId::from("c9"),
            messages: None,
            users: None,
        }));
    }

    #[test]
    fn sidebar_remove_is_idempotent() {
        let mut list = ConversationList::new(vec![conversation("c1")]);
        assert!(list.remove(&ConversationId::from("c1")));
        assert!(!list.remove(&ConversationId::from("c1")));
        assert!(list.items().is_empty());
    }
}
