//! Invite attribution: which link (and which inviter) brought an arrival.
use std::{cmp::Reverse, sync::Arc, time::Duration};

use gateway::{
    types::{GuildId, Role, RoleId, User},
    GatewayService,
};
use log::{debug, info, warn};
use tokio::time::sleep;

use crate::{
    error::AttributionError,
    invites::{InviteCounterStore, InviteSnapshot},
    story::StoryStore,
    supervisor::ConnectionStatus,
};

/// Wait for the service's counters to catch up with an arrival.
pub const SETTLE_DELAY: Duration = Duration::from_secs(1);
/// Role name reported when the inviter holds no ranked role.
pub const NO_ROLE: &str = "none";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributionResult {
    pub inviter: Option<User>,
    pub inviter_role: String,
    pub inviter_story: Option<String>,
    pub matched_code: Option<String>,
}

impl Default for AttributionResult {
    fn default() -> Self {
        Self::no_signal()
    }
}

impl AttributionResult {
    pub fn no_signal() -> Self {
        Self {
            inviter: None,
            inviter_role: NO_ROLE.to_string(),
            inviter_story: None,
            matched_code: None,
        }
    }

    pub fn is_attributed(&self) -> bool {
        self.matched_code.is_some()
    }

    pub fn inviter_name(&self) -> Option<&str> {
        self.inviter.as_ref().map(User::display_name)
    }
}

/// Name of the highest-ranked role in `held`, ignoring the community's
/// implicit everyone role (whose id equals the community id).
/// Equal positions rank the older (lower id) role higher.
pub fn highest_ranked(catalogue: &[Role], held: &[RoleId], guild: GuildId) -> Option<String> {
    catalogue
        .iter()
        .filter(|role| role.id.get() != guild.get() && held.contains(&role.id))
        .max_by_key(|role| (role.position, Reverse(role.id)))
        .map(|role| role.name.clone())
}

pub struct InviteAttributor<G, S> {
    gateway: Arc<G>,
    store: Arc<InviteCounterStore>,
    stories: Arc<S>,
    status: ConnectionStatus,
    settle_delay: Duration,
}

impl<G: GatewayService, S: StoryStore> InviteAttributor<G, S> {
    pub fn new(
        gateway: Arc<G>,
        store: Arc<InviteCounterStore>,
        stories: Arc<S>,
        status: ConnectionStatus,
    ) -> Self {
        Self {
            gateway,
            store,
            stories,
            status,
            settle_delay: SETTLE_DELAY,
        }
    }

    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    pub fn store(&self) -> &Arc<InviteCounterStore> {
        &self.store
    }

    /// Fetch the live invite list and store it as the community's snapshot.
    /// Returns the number of codes captured.
    pub async fn prime_snapshot(&self, guild: GuildId) -> Result<usize, AttributionError> {
        self.status
            .ensure_connected()
            .map_err(AttributionError::Unavailable)?;
        let snapshot = InviteSnapshot::from(self.gateway.fetch_invites(guild).await?);
        let codes = snapshot.len();
        self.store.replace(guild, snapshot).await;
        info!("Primed invite snapshot for guild {guild} with {codes} codes");
        Ok(codes)
    }

    /// Work out which invite `arrival` used. Every failure degrades to
    /// [`AttributionResult::no_signal`].
    pub async fn attribute(&self, guild: GuildId, arrival: &User) -> AttributionResult {
        if let Err(state) = self.status.ensure_connected() {
            warn!("Skipping attribution of {} while {state}", arrival.id);
            return AttributionResult::no_signal();
        }

        let Some(old) = self.store.get(guild).await else {
            warn!(
                "No invite snapshot for guild {guild}; priming instead of attributing {}",
                arrival.id
            );
            if let Err(e) = self.prime_snapshot(guild).await {
                warn!("Failed to prime invite snapshot for guild {guild}: {e}");
            }
            return AttributionResult::no_signal();
        };

        sleep(self.settle_delay).await;

        let new = match self.gateway.fetch_invites(guild).await {
            Ok(invites) => InviteSnapshot::from(invites),
            Err(e) => {
                warn!("Failed to fetch invites for guild {guild}: {e}");
                return AttributionResult::no_signal();
            }
        };

        let consumed = old.first_consumed(&new).cloned();
        self.store.replace(guild, new).await;

        let Some(consumed) = consumed else {
            info!("No invite use increased for arrival {} in guild {guild}", arrival.id);
            return AttributionResult::no_signal();
        };
        info!(
            "Arrival {} in guild {guild} used invite {}",
            arrival.id, consumed.code
        );

        let mut result = AttributionResult {
            matched_code: Some(consumed.code),
            ..AttributionResult::no_signal()
        };
        let Some(inviter) = consumed.inviter else {
            return result;
        };

        result.inviter_role = self
            .inviter_role(guild, &inviter)
            .await
            .unwrap_or_else(|| NO_ROLE.to_string());
        result.inviter_story = match self.stories.load(inviter.id).await {
            Ok(story) => story,
            Err(e) => {
                warn!("Failed to load story of inviter {}: {e}", inviter.id);
                None
            }
        };
        result.inviter = Some(inviter);
        result
    }

    async fn inviter_role(&self, guild: GuildId, inviter: &User) -> Option<String> {
        let held = match self.gateway.fetch_member_roles(guild, inviter.id).await {
            Ok(held) => held,
            Err(e) if e.is_not_found() => {
                debug!("Inviter {} is no longer in guild {guild}", inviter.id);
                return None;
            }
            Err(e) => {
                warn!("Failed to fetch roles of inviter {}: {e}", inviter.id);
                return None;
            }
        };
        match self.gateway.fetch_guild_roles(guild).await {
            Ok(catalogue) => highest_ranked(&catalogue, &held, guild),
            Err(e) => {
                warn!("Failed to fetch role catalogue of guild {guild}: {e}");
                None
            }
        }
    }
}
