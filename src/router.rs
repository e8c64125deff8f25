//! Inbound event dispatch.
//!
//! One loop reads the shared event stream; every handler that talks to the
//! remote service runs as its own task so a slow member flow never stalls
//! the stream.
use std::{
    any::Any, collections::HashMap, future::Future, panic::AssertUnwindSafe, sync::Arc,
    time::Duration,
};

use futures::FutureExt;
use gateway::{
    types::{
        ChannelId, CommandInvocation, CommandSpec, CreateMessage, GuildId, Message, User, UserId,
    },
    GatewayEvent, GatewayService,
};
use log::{debug, error, info, warn};
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, RwLock},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    attribution::{AttributionResult, InviteAttributor},
    config::BotConfig,
    error::RouterError,
    invites::InviteCounterStore,
    onboarding::OnboardingFlow,
    roles::{LifecycleRoles, MemberRoleState, RoleConsistencyEngine},
    story::StoryStore,
    supervisor::{ConnectionStatus, ConnectionSupervisor},
};

pub const JOIN_COMMAND: &str = "join";
pub const JOIN_PREFIX: &str = "!join";
const JOIN_DESCRIPTION: &str = "Step through the city gates and become an Associate";
/// How long a freshly available community waits for the stream to settle.
const CONNECT_WAIT: Duration = Duration::from_secs(10);
/// How long an arrival's attribution is held waiting for their join.
pub const PENDING_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Where replies to a join request go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyTarget {
    Channel,
    Command(CommandInvocation),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinInvocation {
    pub guild: GuildId,
    pub channel: ChannelId,
    pub member: User,
    pub reply: ReplyTarget,
}

impl JoinInvocation {
    /// A plain-text `!join` message, if `message` is one.
    pub fn from_message(message: &Message) -> Option<Self> {
        if message.author.bot {
            return None;
        }
        let word = message.content.split_whitespace().next()?;
        if !word.eq_ignore_ascii_case(JOIN_PREFIX) {
            return None;
        }
        Some(Self {
            guild: message.guild_id?,
            channel: message.channel_id,
            member: message.author.clone(),
            reply: ReplyTarget::Channel,
        })
    }

    pub fn from_command(invocation: CommandInvocation) -> Option<Self> {
        if invocation.name != JOIN_COMMAND || invocation.invoker.bot {
            return None;
        }
        Some(Self {
            guild: invocation.guild_id,
            channel: invocation.channel_id,
            member: invocation.invoker.clone(),
            reply: ReplyTarget::Command(invocation),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Invoked outside the city-gates channel.
    Rejected,
    AlreadyMember,
    /// Prior participation found; promoted without onboarding.
    Returned,
    Onboarded,
    /// The flow failed and the member got an apology.
    Failed,
}

/// Sends join replies. The first reply to a slash command answers the
/// interaction itself; anything after that goes to the channel.
struct Responder<'a, G> {
    gateway: &'a G,
    invocation: &'a JoinInvocation,
    answered: bool,
}

impl<'a, G: GatewayService> Responder<'a, G> {
    fn new(gateway: &'a G, invocation: &'a JoinInvocation) -> Self {
        Self {
            gateway,
            invocation,
            answered: false,
        }
    }

    async fn reply(&mut self, text: String) {
        let message = CreateMessage::text(text);
        let sent = match &self.invocation.reply {
            ReplyTarget::Command(command) if !self.answered => self
                .gateway
                .respond_to_command(command, message)
                .await,
            _ => self
                .gateway
                .send_message(self.invocation.channel, message)
                .await
                .map(|_| ()),
        };
        self.answered = true;
        if let Err(e) = sent {
            warn!(
                "Failed to reply to {} in channel {}: {e}",
                self.invocation.member.id, self.invocation.channel
            );
        }
    }
}

struct PendingAttribution {
    result: AttributionResult,
    recorded_at: Instant,
}

impl PendingAttribution {
    fn is_fresh(&self) -> bool {
        self.recorded_at.elapsed() < PENDING_TTL
    }
}

pub struct EventRouter<G, O, S> {
    gateway: Arc<G>,
    supervisor: Arc<ConnectionSupervisor<G>>,
    status: ConnectionStatus,
    attributor: InviteAttributor<G, S>,
    roles: RoleConsistencyEngine<G>,
    onboarding: Arc<O>,
    stories: Arc<S>,
    city_gates: Option<ChannelId>,
    /// Attribution of recent arrivals, held until they join.
    pending: RwLock<HashMap<(GuildId, UserId), PendingAttribution>>,
}

impl<G, O, S> EventRouter<G, O, S>
where
    G: GatewayService,
    O: OnboardingFlow,
    S: StoryStore,
{
    pub fn new(
        gateway: Arc<G>,
        supervisor: Arc<ConnectionSupervisor<G>>,
        onboarding: Arc<O>,
        stories: Arc<S>,
        config: &BotConfig,
    ) -> Self {
        let status = supervisor.status();
        let roles = LifecycleRoles::from_config(config);
        if roles.is_none() {
            warn!("Lifecycle roles are not fully configured; join will fail");
        }
        Self {
            attributor: InviteAttributor::new(
                gateway.clone(),
                Arc::new(InviteCounterStore::new()),
                stories.clone(),
                status.clone(),
            ),
            roles: RoleConsistencyEngine::new(gateway.clone(), roles, status.clone()),
            gateway,
            supervisor,
            status,
            onboarding,
            stories,
            city_gates: config.city_gates_channel,
            pending: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.attributor = self.attributor.with_settle_delay(settle_delay);
        self
    }

    pub fn attributor(&self) -> &InviteAttributor<G, S> {
        &self.attributor
    }

    pub fn roles(&self) -> &RoleConsistencyEngine<G> {
        &self.roles
    }

    pub fn invite_store(&self) -> &Arc<InviteCounterStore> {
        self.attributor.store()
    }

    pub async fn pending_attribution(
        &self,
        guild: GuildId,
        user: UserId,
    ) -> Option<AttributionResult> {
        self.pending
            .read()
            .await
            .get(&(guild, user))
            .filter(|pending| pending.is_fresh())
            .map(|pending| pending.result.clone())
    }

    /// Number of arrivals whose attribution is still held.
    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    async fn forget_pending(&self, guild: GuildId, user: UserId) {
        self.pending.write().await.remove(&(guild, user));
    }

    /// Consume `events` until cancelled or the stream closes.
    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<GatewayEvent>,
        cancel: CancellationToken,
    ) {
        info!("Event router started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => {
                        self.dispatch(event);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Event router lagged behind; {skipped} events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
        info!("Event router stopped");
    }

    /// Route one event. Work that touches the remote service is spawned and
    /// its handle returned.
    pub fn dispatch(self: &Arc<Self>, event: GatewayEvent) -> Option<JoinHandle<()>> {
        match event {
            GatewayEvent::Ready { user } => {
                info!("Event stream ready as {}", user.username);
                None
            }
            GatewayEvent::Disconnected { cause } => self.supervisor.on_disconnected(&cause),
            GatewayEvent::GuildAvailable(guild) => {
                let router = Arc::clone(self);
                Some(spawn_handler("guild available", async move {
                    router.on_guild_available(guild).await
                }))
            }
            GatewayEvent::MemberArrived { guild_id, member } => {
                if member.user.bot {
                    return None;
                }
                let router = Arc::clone(self);
                Some(spawn_handler("member arrived", async move {
                    router.on_member_arrived(guild_id, member.user).await
                }))
            }
            GatewayEvent::MessageReceived(message) => {
                let invocation = JoinInvocation::from_message(&message)?;
                Some(self.spawn_join(invocation))
            }
            GatewayEvent::CommandInvoked(command) => {
                let Some(invocation) = JoinInvocation::from_command(command) else {
                    debug!("Ignoring unknown command");
                    return None;
                };
                Some(self.spawn_join(invocation))
            }
        }
    }

    fn spawn_join(self: &Arc<Self>, invocation: JoinInvocation) -> JoinHandle<()> {
        let router = Arc::clone(self);
        spawn_handler("join", async move {
            router.handle_join(invocation).await;
        })
    }

    async fn on_guild_available(&self, guild: GuildId) {
        if !self.status.wait_until_connected(CONNECT_WAIT).await {
            warn!(
                "Guild {guild} became available while {}; skipping setup",
                self.status.current()
            );
            return;
        }

        if let Err(e) = self.attributor.prime_snapshot(guild).await {
            warn!("Failed to prime invite snapshot for guild {guild}: {e}");
        }
        let command = CommandSpec::new(JOIN_COMMAND, JOIN_DESCRIPTION);
        match self.gateway.register_command(guild, &command).await {
            Ok(()) => info!("Registered /{JOIN_COMMAND} in guild {guild}"),
            Err(e) => warn!("Failed to register /{JOIN_COMMAND} in guild {guild}: {e}"),
        }
    }

    async fn on_member_arrived(&self, guild: GuildId, member: User) {
        let result = self.attributor.attribute(guild, &member).await;
        match (&result.matched_code, result.inviter_name()) {
            (Some(code), Some(inviter)) => info!(
                "{} arrived in guild {guild} via {code}, invited by {inviter} ({})",
                member.id, result.inviter_role
            ),
            (Some(code), None) => info!("{} arrived in guild {guild} via {code}", member.id),
            _ => info!("{} arrived in guild {guild}; no attribution", member.id),
        }
        let mut pending = self.pending.write().await;
        let before = pending.len();
        pending.retain(|_, held| held.is_fresh());
        if pending.len() < before {
            debug!("Expired {} unclaimed attributions", before - pending.len());
        }
        pending.insert(
            (guild, member.id),
            PendingAttribution {
                result,
                recorded_at: Instant::now(),
            },
        );
    }

    /// Run the join flow for one request. Never fails: errors become an
    /// apology to the member.
    pub async fn handle_join(&self, invocation: JoinInvocation) -> JoinOutcome {
        let mut responder = Responder::new(self.gateway.as_ref(), &invocation);

        if self.city_gates != Some(invocation.channel) {
            info!(
                "Rejected join from {} in channel {}",
                invocation.member.id, invocation.channel
            );
            let text = match self.city_gates {
                Some(gates) => format!("The gates only open in <#{gates}>. Try again there."),
                None => "The city gates are closed for now.".to_string(),
            };
            responder.reply(text).await;
            return JoinOutcome::Rejected;
        }

        match self.join(&invocation, &mut responder).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Join flow for {} failed: {e}", invocation.member.id);
                responder
                    .reply(format!(
                        "Sorry {}, something went wrong at the gates. Please try again later.",
                        invocation.member.mention()
                    ))
                    .await;
                JoinOutcome::Failed
            }
        }
    }

    async fn join(
        &self,
        invocation: &JoinInvocation,
        responder: &mut Responder<'_, G>,
    ) -> Result<JoinOutcome, RouterError> {
        let JoinInvocation { guild, channel, member, .. } = invocation;
        let (guild, channel) = (*guild, *channel);

        if self.roles.reconcile(guild, member.id).await? == MemberRoleState::Associate {
            responder
                .reply(format!("{}, you are already an Associate of the city.", member.mention()))
                .await;
            self.forget_pending(guild, member.id).await;
            return Ok(JoinOutcome::AlreadyMember);
        }

        if self
            .onboarding
            .scan_history_for_prior_participation(member)
            .await?
        {
            self.roles.promote_to_associate(guild, member.id).await?;
            self.forget_pending(guild, member.id).await;
            responder
                .reply(format!("Welcome back, {}. The city remembers you.", member.mention()))
                .await;
            return Ok(JoinOutcome::Returned);
        }

        responder
            .reply(format!(
                "Welcome to the city gates, {}. Answer a few questions to enter.",
                member.mention()
            ))
            .await;
        let responses = self
            .onboarding
            .conduct_onboarding(guild, channel, member)
            .await?;

        // Held until promotion succeeds so a retried join keeps it
        let attribution = self
            .pending_attribution(guild, member.id)
            .await
            .unwrap_or_else(AttributionResult::no_signal);
        let story = self
            .onboarding
            .generate_story(
                member,
                &responses,
                attribution.inviter_name(),
                &attribution.inviter_role,
                attribution.inviter_story.as_deref(),
            )
            .await?;

        if let Err(e) = self.stories.save(member.id, &story).await {
            warn!("Failed to save story of {}: {e}", member.id);
        }
        self.onboarding
            .send_story_to_channel(member, &story, attribution.is_attributed())
            .await?;
        self.roles.promote_to_associate(guild, member.id).await?;
        self.forget_pending(guild, member.id).await;

        responder
            .reply(format!(
                "Your story is told, {}. Welcome to the city, Associate.",
                member.mention()
            ))
            .await;
        Ok(JoinOutcome::Onboarded)
    }
}

fn spawn_handler<F>(label: &'static str, handler: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(panic) = AssertUnwindSafe(handler).catch_unwind().await {
            error!("{label} handler panicked: {}", panic_message(&*panic));
        }
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway::types::{InteractionId, MessageId};

    fn message(content: &str, author: User) -> Message {
        Message {
            id: MessageId(1),
            channel_id: ChannelId(2),
            guild_id: Some(GuildId(3)),
            author,
            content: content.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn join_prefix_is_case_insensitive() {
        let author = User::new(9, "wanderer");
        assert!(JoinInvocation::from_message(&message("!JOIN", author.clone())).is_some());
        assert!(JoinInvocation::from_message(&message("  !join please", author.clone())).is_some());
        assert!(JoinInvocation::from_message(&message("!joiner", author.clone())).is_none());
        assert!(JoinInvocation::from_message(&message("let me !join", author)).is_none());
    }

    #[test]
    fn bots_and_direct_messages_are_ignored() {
        let mut bot = User::new(9, "automaton");
        bot.bot = true;
        assert!(JoinInvocation::from_message(&message("!join", bot)).is_none());

        let mut direct = message("!join", User::new(9, "wanderer"));
        direct.guild_id = None;
        assert!(JoinInvocation::from_message(&direct).is_none());
    }

    #[test]
    fn only_the_join_command_is_routed() {
        let command = CommandInvocation {
            id: InteractionId(1),
            token: "tok".to_string(),
            name: "leave".to_string(),
            guild_id: GuildId(3),
            channel_id: ChannelId(2),
            invoker: User::new(9, "wanderer"),
        };
        assert!(JoinInvocation::from_command(command.clone()).is_none());

        let join = CommandInvocation {
            name: JOIN_COMMAND.to_string(),
            ..command
        };
        let invocation = JoinInvocation::from_command(join.clone()).unwrap();
        assert_eq!(invocation.reply, ReplyTarget::Command(join));
    }
}
