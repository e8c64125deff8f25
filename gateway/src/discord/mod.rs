//! `GatewayService` backed by the Discord REST and event-stream APIs.
mod rest;
mod shard;

pub use rest::RestClient;

use async_trait::async_trait;
use log::info;
use tokio::sync::{broadcast, Mutex, OnceCell};

use crate::{
    events::GatewayEvent,
    service::GatewayService,
    types::{
        ApplicationId, ChannelId, CommandInvocation, CommandSpec, CreateMessage, GuildId, Invite,
        Message, MessageId, Role, RoleId, UserId,
    },
    GatewayError,
};

use shard::ShardHandle;

const EVENT_BUFFER: usize = 256;

pub struct DiscordGateway {
    rest: RestClient,
    token: String,
    events: broadcast::Sender<GatewayEvent>,
    shard: Mutex<Option<ShardHandle>>,
    application_id: OnceCell<ApplicationId>,
}

impl DiscordGateway {
    pub fn new(token: &str) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            rest: RestClient::new(token),
            token: token.to_string(),
            events,
            shard: Mutex::new(None),
            application_id: OnceCell::new(),
        }
    }
}

#[async_trait]
impl GatewayService for DiscordGateway {
    async fn connect(&self) -> Result<(), GatewayError> {
        let mut shard = self.shard.lock().await;
        if shard.take().is_some() {
            info!("Tearing down previous gateway session");
        }
        let url = self.rest.gateway_url().await?;
        *shard = Some(shard::open(&url, &self.token, self.events.clone()).await?);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    async fn fetch_invites(&self, guild: GuildId) -> Result<Vec<Invite>, GatewayError> {
        self.rest.invites(guild).await
    }

    async fn fetch_member_roles(
        &self,
        guild: GuildId,
        user: UserId,
    ) -> Result<Vec<RoleId>, GatewayError> {
        Ok(self.rest.member(guild, user).await?.roles)
    }

    async fn fetch_guild_roles(&self, guild: GuildId) -> Result<Vec<Role>, GatewayError> {
        self.rest.roles(guild).await
    }

    async fn add_role(
        &self,
        guild: GuildId,
        user: UserId,
        role: RoleId,
    ) -> Result<(), GatewayError> {
        self.rest.add_member_role(guild, user, role).await
    }

    async fn remove_role(
        &self,
        guild: GuildId,
        user: UserId,
        role: RoleId,
    ) -> Result<(), GatewayError> {
        self.rest.remove_member_role(guild, user, role).await
    }

    async fn send_message(
        &self,
        channel: ChannelId,
        message: CreateMessage,
    ) -> Result<MessageId, GatewayError> {
        self.rest.create_message(channel, &message).await
    }

    async fn fetch_recent_messages(
        &self,
        channel: ChannelId,
        limit: usize,
    ) -> Result<Vec<Message>, GatewayError> {
        self.rest.recent_messages(channel, limit).await
    }

    async fn register_command(
        &self,
        guild: GuildId,
        command: &CommandSpec,
    ) -> Result<(), GatewayError> {
        let application = self
            .application_id
            .get_or_try_init(|| self.rest.application_id())
            .await?;
        self.rest
            .create_guild_command(*application, guild, command)
            .await
    }

    async fn respond_to_command(
        &self,
        invocation: &CommandInvocation,
        message: CreateMessage,
    ) -> Result<(), GatewayError> {
        self.rest
            .create_interaction_response(invocation, &message)
            .await
    }
}
