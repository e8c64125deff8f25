use std::time::Duration;

use bounded_vec_deque::BoundedVecDeque;
use log::debug;
use reqwest::{header::AUTHORIZATION, Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::json;

use crate::{
    types::{
        ApplicationId, ChannelId, CommandInvocation, CommandSpec, CreateMessage, GuildId, Invite,
        Member, Message, MessageId, Role, RoleId, UserId,
    },
    GatewayError,
};

const API_BASE: &str = "https://discord.com/api/v10";
/// Largest page the messages endpoint returns.
const MESSAGE_PAGE: usize = 100;

const CHAT_INPUT_COMMAND: u8 = 1;
const CHANNEL_MESSAGE_WITH_SOURCE: u8 = 4;

#[derive(Deserialize)]
struct RateLimitBody {
    retry_after: f64,
}

#[derive(Deserialize)]
struct GatewayBot {
    url: String,
}

#[derive(Deserialize)]
struct CurrentApplication {
    id: ApplicationId,
}

#[derive(Deserialize)]
struct Created {
    id: MessageId,
}

/// Thin REST client for the HTTP half of the remote API.
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    token: String,
    base: String,
}

impl RestClient {
    pub fn new(token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            token: token.to_string(),
            base: API_BASE.to_string(),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base, path))
            .header(AUTHORIZATION, format!("Bot {}", self.token))
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response, GatewayError> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .json::<RateLimitBody>()
                .await
                .map(|body| body.retry_after.max(0.0))
                .unwrap_or(1.0);
            return Err(GatewayError::RateLimited {
                retry_after: Duration::from_secs_f64(retry_after),
            });
        }

        let message = response.text().await.unwrap_or_default();
        match status {
            StatusCode::NOT_FOUND => Err(GatewayError::NotFound(message)),
            StatusCode::UNAUTHORIZED => Err(GatewayError::Authentication(message)),
            _ => Err(GatewayError::Api {
                status: status.as_u16(),
                message,
            }),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, GatewayError> {
        let response = self.execute(self.request(Method::GET, path)).await?;
        Ok(response.json().await?)
    }

    pub async fn gateway_url(&self) -> Result<String, GatewayError> {
        Ok(self.get_json::<GatewayBot>("/gateway/bot").await?.url)
    }

    pub async fn application_id(&self) -> Result<ApplicationId, GatewayError> {
        Ok(self
            .get_json::<CurrentApplication>("/oauth2/applications/@me")
            .await?
            .id)
    }

    pub async fn invites(&self, guild: GuildId) -> Result<Vec<Invite>, GatewayError> {
        self.get_json(&format!("/guilds/{guild}/invites")).await
    }

    pub async fn member(&self, guild: GuildId, user: UserId) -> Result<Member, GatewayError> {
        self.get_json(&format!("/guilds/{guild}/members/{user}"))
            .await
    }

    pub async fn roles(&self, guild: GuildId) -> Result<Vec<Role>, GatewayError> {
        self.get_json(&format!("/guilds/{guild}/roles")).await
    }

    pub async fn add_member_role(
        &self,
        guild: GuildId,
        user: UserId,
        role: RoleId,
    ) -> Result<(), GatewayError> {
        let path = format!("/guilds/{guild}/members/{user}/roles/{role}");
        self.execute(self.request(Method::PUT, &path)).await?;
        Ok(())
    }

    pub async fn remove_member_role(
        &self,
        guild: GuildId,
        user: UserId,
        role: RoleId,
    ) -> Result<(), GatewayError> {
        let path = format!("/guilds/{guild}/members/{user}/roles/{role}");
        self.execute(self.request(Method::DELETE, &path)).await?;
        Ok(())
    }

    pub async fn create_message(
        &self,
        channel: ChannelId,
        message: &CreateMessage,
    ) -> Result<MessageId, GatewayError> {
        let path = format!("/channels/{channel}/messages");
        let response = self
            .execute(self.request(Method::POST, &path).json(message))
            .await?;
        Ok(response.json::<Created>().await?.id)
    }

    /// Walks the channel history backwards one page at a time until `limit`
    /// messages are collected or the history runs out.
    pub async fn recent_messages(
        &self,
        channel: ChannelId,
        limit: usize,
    ) -> Result<Vec<Message>, GatewayError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut window = BoundedVecDeque::new(limit);
        let mut before: Option<MessageId> = None;

        while window.len() < limit {
            let page_size = MESSAGE_PAGE.min(limit - window.len());
            let mut request = self
                .request(Method::GET, &format!("/channels/{channel}/messages"))
                .query(&[("limit", page_size.to_string())]);
            if let Some(before) = before {
                request = request.query(&[("before", before.to_string())]);
            }

            let page: Vec<Message> = self.execute(request).await?.json().await?;
            let exhausted = page.len() < page_size;
            before = page.last().map(|m| m.id);
            for message in page {
                window.push_back(message);
            }
            if exhausted || before.is_none() {
                break;
            }
        }

        debug!("Fetched {} messages from channel {channel}", window.len());
        Ok(window.into_unbounded().into_iter().collect())
    }

    pub async fn create_guild_command(
        &self,
        application: ApplicationId,
        guild: GuildId,
        command: &CommandSpec,
    ) -> Result<(), GatewayError> {
        let path = format!("/applications/{application}/guilds/{guild}/commands");
        let body = json!({
            "name": command.name,
            "description": command.description,
            "type": CHAT_INPUT_COMMAND,
        });
        self.execute(self.request(Method::POST, &path).json(&body))
            .await?;
        Ok(())
    }

    pub async fn create_interaction_response(
        &self,
        invocation: &CommandInvocation,
        message: &CreateMessage,
    ) -> Result<(), GatewayError> {
        let path = format!(
            "/interactions/{}/{}/callback",
            invocation.id, invocation.token
        );
        let body = json!({
            "type": CHANNEL_MESSAGE_WITH_SOURCE,
            "data": message,
        });
        self.execute(self.request(Method::POST, &path).json(&body))
            .await?;
        Ok(())
    }
}
