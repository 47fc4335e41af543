use std::collections::HashSet;

#[derive(Debug, Default)]
enum State {
    #[default]
    Unsubscribed,
    /// Subscribe sent; waiting for the membership snapshot. Incremental
    /// events in this window are ignored, the snapshot supersedes them.
    Pending,
    Active(HashSet<String>),
}

/// Who is online, driven by presence-channel membership events. Identity is
/// the user's email handle; a handle stays present while any of the user's
/// sessions is open (the server collapses per-session joins/leaves).
#[derive(Debug, Default)]
pub struct PresenceTracker {
    state: State,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe_started(&mut self) {
        if matches!(self.state, State::Unsubscribed) {
            self.state = State::Pending;
        }
    }

    /// Wholesale replace on `subscription_succeeded`; never a merge.
    pub fn snapshot(&mut self, members: impl IntoIterator<Item = String>) {
        self.state = State::Active(members.into_iter().collect());
    }

    /// Idempotent add.
    pub fn member_added(&mut self, id: String) {
        if let State::Active(members) = &mut self.state {
            members.insert(id);
        }
    }

    pub fn member_removed(&mut self, id: &str) {
        if let State::Active(members) = &mut self.state {
            members.remove(id);
        }
    }

    /// Teardown clears all state.
    pub fn unsubscribed(&mut self) {
        self.state = State::Unsubscribed;
    }

    pub fn is_online(&self, id: &str) -> bool {
        matches!(&self.state, State::Active(members) if members.contains(id))
    }

    pub fn members(&self) -> Vec<String> {
        match &self.state {
            State::Active(members) => {
                let mut sorted: Vec<_> = members.iter().cloned().collect();
                sorted.sort();
                sorted
            }
            _ => Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, State::Active(_))
    }
}
