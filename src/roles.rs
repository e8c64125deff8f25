//! Two-tag membership lifecycle: a member holds Outsider or Associate, never
//! both. Live roles are the only source of truth; every transition reads
//! them before acting and again afterwards.
use std::{fmt::Display, sync::Arc};

use gateway::{
    types::{GuildId, RoleId, UserId},
    GatewayError, GatewayService,
};
use log::{debug, info, warn};

use crate::{config::BotConfig, error::RoleError, supervisor::ConnectionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleTag {
    Outsider,
    Associate,
}

impl Display for LifecycleTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleTag::Outsider => write!(f, "Outsider"),
            LifecycleTag::Associate => write!(f, "Associate"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleRoles {
    pub outsider: RoleId,
    pub associate: RoleId,
}

impl LifecycleRoles {
    pub fn from_config(config: &BotConfig) -> Option<Self> {
        Some(Self {
            outsider: config.outsider_role?,
            associate: config.associate_role?,
        })
    }

    pub fn role(&self, tag: LifecycleTag) -> RoleId {
        match tag {
            LifecycleTag::Outsider => self.outsider,
            LifecycleTag::Associate => self.associate,
        }
    }

    pub fn classify(&self, held: &[RoleId]) -> MemberRoleState {
        match (held.contains(&self.outsider), held.contains(&self.associate)) {
            (true, true) => MemberRoleState::Inconsistent,
            (true, false) => MemberRoleState::Outsider,
            (false, true) => MemberRoleState::Associate,
            (false, false) => MemberRoleState::Neither,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberRoleState {
    Outsider,
    Associate,
    /// Both tags at once.
    Inconsistent,
    Neither,
}

impl MemberRoleState {
    pub fn holds(&self, tag: LifecycleTag) -> bool {
        matches!(
            (self, tag),
            (MemberRoleState::Inconsistent, _)
                | (MemberRoleState::Outsider, LifecycleTag::Outsider)
                | (MemberRoleState::Associate, LifecycleTag::Associate)
        )
    }
}

impl Display for MemberRoleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            MemberRoleState::Outsider => "Outsider",
            MemberRoleState::Associate => "Associate",
            MemberRoleState::Inconsistent => "Inconsistent",
            MemberRoleState::Neither => "Neither",
        };
        write!(f, "{state}")
    }
}

#[derive(Clone, Copy)]
enum Change {
    Grant,
    Revoke,
}

pub struct RoleConsistencyEngine<G> {
    gateway: Arc<G>,
    roles: Option<LifecycleRoles>,
    status: ConnectionStatus,
}

impl<G: GatewayService> RoleConsistencyEngine<G> {
    pub fn new(gateway: Arc<G>, roles: Option<LifecycleRoles>, status: ConnectionStatus) -> Self {
        Self {
            gateway,
            roles,
            status,
        }
    }

    pub fn roles(&self) -> Option<LifecycleRoles> {
        self.roles
    }

    fn ready(&self) -> Result<LifecycleRoles, RoleError> {
        self.status
            .ensure_connected()
            .map_err(RoleError::Unavailable)?;
        self.roles.ok_or(RoleError::NotConfigured)
    }

    /// Live roles, or `None` if the member has left.
    async fn live_roles(
        &self,
        guild: GuildId,
        user: UserId,
    ) -> Result<Option<Vec<RoleId>>, RoleError> {
        match self.gateway.fetch_member_roles(guild, user).await {
            Ok(held) => Ok(Some(held)),
            Err(e) if e.is_not_found() => {
                info!("Member {user} is no longer in guild {guild}");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_state(
        &self,
        roles: &LifecycleRoles,
        guild: GuildId,
        user: UserId,
    ) -> Result<Option<MemberRoleState>, RoleError> {
        Ok(self
            .live_roles(guild, user)
            .await?
            .map(|held| roles.classify(&held)))
    }

    /// Current lifecycle state from live roles. A departed member is
    /// `Neither`.
    pub async fn state(&self, guild: GuildId, user: UserId) -> Result<MemberRoleState, RoleError> {
        let roles = self.ready()?;
        Ok(self
            .read_state(&roles, guild, user)
            .await?
            .unwrap_or(MemberRoleState::Neither))
    }

    pub async fn grant(
        &self,
        guild: GuildId,
        user: UserId,
        tag: LifecycleTag,
    ) -> Result<MemberRoleState, RoleError> {
        let roles = self.ready()?;
        self.apply(&roles, guild, user, tag, Change::Grant).await
    }

    pub async fn revoke(
        &self,
        guild: GuildId,
        user: UserId,
        tag: LifecycleTag,
    ) -> Result<MemberRoleState, RoleError> {
        let roles = self.ready()?;
        self.apply(&roles, guild, user, tag, Change::Revoke).await
    }

    async fn apply(
        &self,
        roles: &LifecycleRoles,
        guild: GuildId,
        user: UserId,
        tag: LifecycleTag,
        change: Change,
    ) -> Result<MemberRoleState, RoleError> {
        let Some(before) = self.read_state(roles, guild, user).await? else {
            return Ok(MemberRoleState::Neither);
        };
        let wanted = matches!(change, Change::Grant);
        if before.holds(tag) == wanted {
            debug!("Member {user} already in state {before}; nothing to change for {tag}");
            return Ok(before);
        }

        let role = roles.role(tag);
        let result = match change {
            Change::Grant => self.gateway.add_role(guild, user, role).await,
            Change::Revoke => self.gateway.remove_role(guild, user, role).await,
        };
        match result {
            Ok(()) => {}
            Err(GatewayError::NotFound(what)) => {
                warn!("Role change {tag} for member {user} hit a vanished target: {what}");
            }
            Err(e) => return Err(e.into()),
        }

        let Some(after) = self.read_state(roles, guild, user).await? else {
            return Ok(MemberRoleState::Neither);
        };
        if after.holds(tag) != wanted {
            warn!(
                "Member {user} is {after} right after changing {tag}; a concurrent update raced us"
            );
        }
        Ok(after)
    }

    /// Associate wins: a member holding both tags loses Outsider.
    pub async fn reconcile(
        &self,
        guild: GuildId,
        user: UserId,
    ) -> Result<MemberRoleState, RoleError> {
        let roles = self.ready()?;
        let Some(state) = self.read_state(&roles, guild, user).await? else {
            return Ok(MemberRoleState::Neither);
        };
        if state != MemberRoleState::Inconsistent {
            return Ok(state);
        }

        info!("Member {user} holds both lifecycle roles; dropping Outsider");
        self.apply(&roles, guild, user, LifecycleTag::Outsider, Change::Revoke)
            .await
    }

    pub async fn promote_to_associate(
        &self,
        guild: GuildId,
        user: UserId,
    ) -> Result<MemberRoleState, RoleError> {
        let roles = self.ready()?;
        self.apply(&roles, guild, user, LifecycleTag::Outsider, Change::Revoke)
            .await?;
        self.apply(&roles, guild, user, LifecycleTag::Associate, Change::Grant)
            .await?;
        let state = self.reconcile(guild, user).await?;
        info!("Member {user} promoted to Associate in guild {guild}: now {state}");
        Ok(state)
    }
}
