//! Transport-agnostic gateway interface.
use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::{
    events::GatewayEvent,
    types::{
        ChannelId, CommandInvocation, CommandSpec, CreateMessage, GuildId, Invite, Message,
        MessageId, Role, RoleId, UserId,
    },
    GatewayError,
};

#[async_trait]
pub trait GatewayService: Send + Sync + 'static {
    /// Authenticate and start the event stream. Returns once the stream is
    /// ready; any previous stream is torn down first.
    async fn connect(&self) -> Result<(), GatewayError>;

    /// Subscribe to inbound events.
    ///
    /// The channel survives reconnects: events from every session are
    /// delivered to the same receivers.
    fn subscribe(&self) -> broadcast::Receiver<GatewayEvent>;

    /// Live invite list of a community, in the order the service returns it.
    async fn fetch_invites(&self, guild: GuildId) -> Result<Vec<Invite>, GatewayError>;

    /// Roles currently held by a member. `NotFound` if the member left.
    async fn fetch_member_roles(
        &self,
        guild: GuildId,
        user: UserId,
    ) -> Result<Vec<RoleId>, GatewayError>;

    /// The community's role catalogue.
    async fn fetch_guild_roles(&self, guild: GuildId) -> Result<Vec<Role>, GatewayError>;

    async fn add_role(&self, guild: GuildId, user: UserId, role: RoleId)
        -> Result<(), GatewayError>;

    async fn remove_role(
        &self,
        guild: GuildId,
        user: UserId,
        role: RoleId,
    ) -> Result<(), GatewayError>;

    async fn send_message(
        &self,
        channel: ChannelId,
        message: CreateMessage,
    ) -> Result<MessageId, GatewayError>;

    /// Most recent messages of a channel, newest first, at most `limit`.
    async fn fetch_recent_messages(
        &self,
        channel: ChannelId,
        limit: usize,
    ) -> Result<Vec<Message>, GatewayError>;

    async fn register_command(
        &self,
        guild: GuildId,
        command: &CommandSpec,
    ) -> Result<(), GatewayError>;

    /// Answer a command invocation directly.
    async fn respond_to_command(
        &self,
        invocation: &CommandInvocation,
        message: CreateMessage,
    ) -> Result<(), GatewayError>;
}
