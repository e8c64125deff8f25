//! In-memory gateway implementation.
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use tokio::{sync::broadcast, time::Instant};

use crate::{
    events::GatewayEvent,
    service::GatewayService,
    types::{
        ChannelId, CommandInvocation, CommandSpec, CreateMessage, GuildId, Invite, Message,
        MessageId, Role, RoleId, User, UserId,
    },
    GatewayError,
};

const EVENT_BUFFER: usize = 256;
const BOT_USER_ID: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleMutation {
    Added {
        guild: GuildId,
        user: UserId,
        role: RoleId,
    },
    Removed {
        guild: GuildId,
        user: UserId,
        role: RoleId,
    },
}

#[derive(Default)]
struct State {
    connect_failures: usize,
    fail_all_connects: bool,
    connect_attempts: Vec<Instant>,

    invites: HashMap<GuildId, Vec<Invite>>,
    invite_failures: usize,
    invite_fetches: usize,

    members: HashMap<(GuildId, UserId), Vec<RoleId>>,
    guild_roles: HashMap<GuildId, Vec<Role>>,
    role_mutations: Vec<RoleMutation>,

    /// Oldest first.
    history: HashMap<ChannelId, Vec<Message>>,
    next_message_id: u64,
    sent: Vec<(ChannelId, CreateMessage)>,
    replies: Vec<(CommandInvocation, CreateMessage)>,
    commands: Vec<(GuildId, CommandSpec)>,
}

/// Scriptable gateway for development and testing.
///
/// Every call is served from local state; nothing leaves the process.
/// Failure injection and call recording make the backoff, attribution and
/// role flows observable.
pub struct MemoryGateway {
    state: Mutex<State>,
    events: broadcast::Sender<GatewayEvent>,
    bot: User,
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGateway {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let mut bot = User::new(BOT_USER_ID, "citygate");
        bot.bot = true;
        Self {
            state: Mutex::new(State {
                next_message_id: 1,
                ..Default::default()
            }),
            events,
            bot,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The account `connect` authenticates as.
    pub fn bot_user(&self) -> &User {
        &self.bot
    }

    /// Push an event to every subscriber.
    pub fn emit(&self, event: GatewayEvent) {
        let _ = self.events.send(event);
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.state().connect_failures = count;
    }

    pub fn fail_all_connects(&self, fail: bool) {
        self.state().fail_all_connects = fail;
    }

    /// When each `connect` call was made, on the tokio clock.
    pub fn connect_attempts(&self) -> Vec<Instant> {
        self.state().connect_attempts.clone()
    }

    pub fn set_invites(&self, guild: GuildId, invites: Vec<Invite>) {
        self.state().invites.insert(guild, invites);
    }

    pub fn fail_next_invite_fetches(&self, count: usize) {
        self.state().invite_failures = count;
    }

    pub fn invite_fetches(&self) -> usize {
        self.state().invite_fetches
    }

    pub fn set_member_roles(&self, guild: GuildId, user: UserId, roles: Vec<RoleId>) {
        self.state().members.insert((guild, user), roles);
    }

    pub fn member_roles(&self, guild: GuildId, user: UserId) -> Option<Vec<RoleId>> {
        self.state().members.get(&(guild, user)).cloned()
    }

    /// The member leaves; later lookups and mutations report `NotFound`.
    pub fn remove_member(&self, guild: GuildId, user: UserId) {
        self.state().members.remove(&(guild, user));
    }

    /// Once a catalogue is set, granting a role outside it fails with
    /// `NotFound`.
    pub fn set_guild_roles(&self, guild: GuildId, roles: Vec<Role>) {
        self.state().guild_roles.insert(guild, roles);
    }

    pub fn role_mutations(&self) -> Vec<RoleMutation> {
        self.state().role_mutations.clone()
    }

    /// Seed a channel's history, oldest first.
    pub fn set_history(&self, channel: ChannelId, messages: Vec<Message>) {
        let mut state = self.state();
        let highest = messages.iter().map(|m| m.id.get()).max().unwrap_or(0);
        state.next_message_id = state.next_message_id.max(highest + 1);
        state.history.insert(channel, messages);
    }

    pub fn sent_messages(&self) -> Vec<(ChannelId, CreateMessage)> {
        self.state().sent.clone()
    }

    pub fn command_replies(&self) -> Vec<(CommandInvocation, CreateMessage)> {
        self.state().replies.clone()
    }

    pub fn registered_commands(&self) -> Vec<(GuildId, CommandSpec)> {
        self.state().commands.clone()
    }
}

#[async_trait]
impl GatewayService for MemoryGateway {
    async fn connect(&self) -> Result<(), GatewayError> {
        {
            let mut state = self.state();
            state.connect_attempts.push(Instant::now());
            if state.fail_all_connects {
                return Err(GatewayError::Api {
                    status: 503,
                    message: "gateway unavailable".into(),
                });
            }
            if state.connect_failures > 0 {
                state.connect_failures -= 1;
                return Err(GatewayError::Timeout("gateway handshake"));
            }
        }
        self.emit(GatewayEvent::Ready {
            user: self.bot.clone(),
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    async fn fetch_invites(&self, guild: GuildId) -> Result<Vec<Invite>, GatewayError> {
        let mut state = self.state();
        state.invite_fetches += 1;
        if state.invite_failures > 0 {
            state.invite_failures -= 1;
            return Err(GatewayError::Api {
                status: 500,
                message: "invite list unavailable".into(),
            });
        }
        Ok(state.invites.get(&guild).cloned().unwrap_or_default())
    }

    async fn fetch_member_roles(
        &self,
        guild: GuildId,
        user: UserId,
    ) -> Result<Vec<RoleId>, GatewayError> {
        self.member_roles(guild, user)
            .ok_or_else(|| GatewayError::NotFound(format!("member {user}")))
    }

    async fn fetch_guild_roles(&self, guild: GuildId) -> Result<Vec<Role>, GatewayError> {
        Ok(self
            .state()
            .guild_roles
            .get(&guild)
            .cloned()
            .unwrap_or_default())
    }

    async fn add_role(
        &self,
        guild: GuildId,
        user: UserId,
        role: RoleId,
    ) -> Result<(), GatewayError> {
        let mut state = self.state();
        let unknown_role = state
            .guild_roles
            .get(&guild)
            .is_some_and(|roles| !roles.is_empty() && roles.iter().all(|r| r.id != role));
        if unknown_role {
            return Err(GatewayError::NotFound(format!("role {role}")));
        }
        let held = state
            .members
            .get_mut(&(guild, user))
            .ok_or_else(|| GatewayError::NotFound(format!("member {user}")))?;
        if !held.contains(&role) {
            held.push(role);
        }
        state
            .role_mutations
            .push(RoleMutation::Added { guild, user, role });
        Ok(())
    }

    async fn remove_role(
        &self,
        guild: GuildId,
        user: UserId,
        role: RoleId,
    ) -> Result<(), GatewayError> {
        let mut state = self.state();
        let held = state
            .members
            .get_mut(&(guild, user))
            .ok_or_else(|| GatewayError::NotFound(format!("member {user}")))?;
        held.retain(|r| *r != role);
        state
            .role_mutations
            .push(RoleMutation::Removed { guild, user, role });
        Ok(())
    }

    async fn send_message(
        &self,
        channel: ChannelId,
        message: CreateMessage,
    ) -> Result<MessageId, GatewayError> {
        let mut state = self.state();
        let id = MessageId(state.next_message_id);
        state.next_message_id += 1;
        state.history.entry(channel).or_default().push(Message {
            id,
            channel_id: channel,
            author: self.bot.clone(),
            content: message.content.clone().unwrap_or_default(),
            embeds: message.embeds.clone(),
            ..Default::default()
        });
        state.sent.push((channel, message));
        Ok(id)
    }

    async fn fetch_recent_messages(
        &self,
        channel: ChannelId,
        limit: usize,
    ) -> Result<Vec<Message>, GatewayError> {
        Ok(self
            .state()
            .history
            .get(&channel)
            .map(|messages| messages.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn register_command(
        &self,
        guild: GuildId,
        command: &CommandSpec,
    ) -> Result<(), GatewayError> {
        self.state().commands.push((guild, command.clone()));
        Ok(())
    }

    async fn respond_to_command(
        &self,
        invocation: &CommandInvocation,
        message: CreateMessage,
    ) -> Result<(), GatewayError> {
        self.state().replies.push((invocation.clone(), message));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn history_is_returned_newest_first() {
        let gateway = MemoryGateway::new();
        let channel = ChannelId(5);
        for text in ["first", "second", "third"] {
            gateway
                .send_message(channel, CreateMessage::text(text))
                .await
                .unwrap();
        }

        let recent = gateway.fetch_recent_messages(channel, 2).await.unwrap();
        let contents: Vec<_> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["third", "second"]);
    }

    #[tokio::test]
    async fn departed_member_is_not_found() {
        let gateway = MemoryGateway::new();
        let (guild, user) = (GuildId(1), UserId(2));
        gateway.set_member_roles(guild, user, vec![RoleId(3)]);
        gateway.remove_member(guild, user);

        let err = gateway.fetch_member_roles(guild, user).await.unwrap_err();
        assert!(err.is_not_found());
        let err = gateway.add_role(guild, user, RoleId(3)).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(gateway.role_mutations().is_empty());
    }

    #[tokio::test]
    async fn scripted_connect_failures_run_out() {
        let gateway = MemoryGateway::new();
        let mut events = gateway.subscribe();
        gateway.fail_next_connects(1);

        assert!(gateway.connect().await.is_err());
        gateway.connect().await.unwrap();

        assert_eq!(gateway.connect_attempts().len(), 2);
        assert_eq!(
            events.recv().await.unwrap(),
            GatewayEvent::Ready {
                user: gateway.bot_user().clone()
            }
        );
    }
}
