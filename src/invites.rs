//! Per-community invite usage snapshots.
use std::{collections::HashMap, sync::Arc};

use gateway::types::{GuildId, Invite, User};
use tokio::sync::RwLock;

/// One invite code and how often it has been used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteCount {
    pub code: String,
    pub uses: u64,
    pub inviter: Option<User>,
}

impl From<Invite> for InviteCount {
    fn from(invite: Invite) -> Self {
        Self {
            code: invite.code,
            uses: invite.uses,
            inviter: invite.inviter,
        }
    }
}

/// Point-in-time copy of every invite code's use count, in the order the
/// service listed them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InviteSnapshot {
    entries: Vec<InviteCount>,
}

impl From<Vec<Invite>> for InviteSnapshot {
    fn from(invites: Vec<Invite>) -> Self {
        Self {
            entries: invites.into_iter().map(InviteCount::from).collect(),
        }
    }
}

impl InviteSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[InviteCount] {
        &self.entries
    }

    pub fn uses(&self, code: &str) -> Option<u64> {
        self.entries
            .iter()
            .find(|entry| entry.code == code)
            .map(|entry| entry.uses)
    }

    /// The first code in `newer` whose count strictly exceeds its count
    /// here. Codes unknown to this snapshot count from zero; decreases never
    /// match.
    pub fn first_consumed<'a>(&self, newer: &'a InviteSnapshot) -> Option<&'a InviteCount> {
        let old: HashMap<&str, u64> = self
            .entries
            .iter()
            .map(|entry| (entry.code.as_str(), entry.uses))
            .collect();

        newer
            .entries
            .iter()
            .find(|entry| entry.uses > old.get(entry.code.as_str()).copied().unwrap_or(0))
    }
}

/// Owned store of the latest snapshot per community. Snapshots are
/// replaced whole, never edited.
#[derive(Debug, Default)]
pub struct InviteCounterStore {
    snapshots: RwLock<HashMap<GuildId, Arc<InviteSnapshot>>>,
}

impl InviteCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, guild: GuildId) -> Option<Arc<InviteSnapshot>> {
        self.snapshots.read().await.get(&guild).cloned()
    }

    pub async fn replace(&self, guild: GuildId, snapshot: InviteSnapshot) {
        self.snapshots
            .write()
            .await
            .insert(guild, Arc::new(snapshot));
    }

    pub async fn contains(&self, guild: GuildId) -> bool {
        self.snapshots.read().await.contains_key(&guild)
    }

    pub async fn remove(&self, guild: GuildId) -> Option<Arc<InviteSnapshot>> {
        self.snapshots.write().await.remove(&guild)
    }

    pub async fn guilds(&self) -> Vec<GuildId> {
        self.snapshots.read().await.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(counts: &[(&str, u64)]) -> InviteSnapshot {
        counts
            .iter()
            .map(|(code, uses)| Invite::new(code, *uses, None))
            .collect::<Vec<_>>()
            .into()
    }

    #[test]
    fn single_increase_is_found() {
        let old = snapshot(&[("A", 3), ("B", 7)]);
        let new = snapshot(&[("A", 3), ("B", 8)]);
        assert_eq!(old.first_consumed(&new).map(|c| c.code.as_str()), Some("B"));
    }

    #[test]
    fn unchanged_or_decreased_counts_are_no_signal() {
        let old = snapshot(&[("A", 3), ("B", 7)]);
        assert_eq!(old.first_consumed(&old.clone()), None);

        let decreased = snapshot(&[("A", 1), ("B", 7)]);
        assert_eq!(old.first_consumed(&decreased), None);
    }

    #[test]
    fn new_code_counts_from_zero() {
        let old = snapshot(&[("A", 3)]);
        let unused = snapshot(&[("A", 3), ("C", 0)]);
        assert_eq!(old.first_consumed(&unused), None);

        let used = snapshot(&[("A", 3), ("C", 1)]);
        assert_eq!(old.first_consumed(&used).map(|c| c.code.as_str()), Some("C"));
    }

    #[test]
    fn first_increase_in_service_order_wins() {
        let old = snapshot(&[("A", 1), ("B", 1)]);
        let new = snapshot(&[("B", 2), ("A", 2)]);
        assert_eq!(old.first_consumed(&new).map(|c| c.code.as_str()), Some("B"));
    }

    #[tokio::test]
    async fn store_replaces_whole_snapshot() {
        let store = InviteCounterStore::new();
        let guild = GuildId(9);
        assert!(!store.contains(guild).await);

        store.replace(guild, snapshot(&[("A", 1), ("B", 2)])).await;
        store.replace(guild, snapshot(&[("C", 5)])).await;

        let current = store.get(guild).await.unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current.uses("A"), None);
        assert_eq!(current.uses("C"), Some(5));
        assert_eq!(store.guilds().await, vec![guild]);
    }
}
