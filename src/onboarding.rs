//! The conversational onboarding collaborator and its default,
//! gateway-backed implementation.
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use gateway::{
    types::{ChannelId, CreateMessage, Embed, EmbedField, EmbedFooter, GuildId, Message, User},
    GatewayEvent, GatewayService,
};
use log::{debug, info, warn};
use tokio::{sync::broadcast::error::RecvError, time::timeout};

use crate::error::OnboardingError;

/// How far back the story channel is searched for earlier participation.
pub const HISTORY_SCAN_WINDOW: usize = 200;
pub const ANSWER_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const STORY_COLOR: u32 = 0xC8_9B_3C;
const VOUCHED_COLOR: u32 = 0x3C_8D_C8;
const MAX_STORY_CHARS: usize = 4000;

const QUESTIONS: [&str; 3] = [
    "What name should the city remember you by?",
    "What brought you to the city gates?",
    "What do you hope to build or find here?",
];

/// Answers gathered during onboarding, in the order asked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OnboardingResponses {
    pub answers: Vec<(String, String)>,
}

impl OnboardingResponses {
    pub fn push(&mut self, question: &str, answer: &str) {
        self.answers
            .push((question.to_string(), answer.trim().to_string()));
    }

    pub fn is_empty(&self) -> bool {
        self.answers.is_empty()
    }
}

/// Footer marker tying a posted story to its member.
pub fn story_marker(member: &User) -> String {
    format!("member:{}", member.id)
}

#[async_trait]
pub trait OnboardingFlow: Send + Sync + 'static {
    /// Run the question/answer exchange with `member` in `channel`.
    async fn conduct_onboarding(
        &self,
        guild: GuildId,
        channel: ChannelId,
        member: &User,
    ) -> Result<OnboardingResponses, OnboardingError>;

    async fn generate_story(
        &self,
        member: &User,
        responses: &OnboardingResponses,
        inviter_name: Option<&str>,
        inviter_role: &str,
        inviter_story: Option<&str>,
    ) -> Result<String, OnboardingError>;

    async fn send_story_to_channel(
        &self,
        member: &User,
        story: &str,
        had_attribution: bool,
    ) -> Result<(), OnboardingError>;

    /// Whether `member` already took part: mentioned in, or the subject of,
    /// one of the recent story-channel messages.
    async fn scan_history_for_prior_participation(
        &self,
        member: &User,
    ) -> Result<bool, OnboardingError>;
}

pub struct GatewayOnboarding<G> {
    gateway: Arc<G>,
    story_channel: Option<ChannelId>,
    answer_timeout: Duration,
}

impl<G: GatewayService> GatewayOnboarding<G> {
    pub fn new(gateway: Arc<G>, story_channel: Option<ChannelId>) -> Self {
        Self {
            gateway,
            story_channel,
            answer_timeout: ANSWER_TIMEOUT,
        }
    }

    pub fn with_answer_timeout(mut self, answer_timeout: Duration) -> Self {
        self.answer_timeout = answer_timeout;
        self
    }
}

fn is_answer(message: &Message, channel: ChannelId, member: &User) -> bool {
    message.channel_id == channel && message.author.id == member.id && !message.author.bot
}

fn references_member(message: &Message, member: &User, marker: &str) -> bool {
    let mention = member.mention();
    let nick_mention = format!("<@!{}>", member.id);
    message.mentions.iter().any(|u| u.id == member.id)
        || message.content.contains(&mention)
        || message.content.contains(&nick_mention)
        || message.embeds.iter().any(|embed| {
            embed
                .text_parts()
                .any(|text| text.split_whitespace().any(|word| word == marker))
        })
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((end, _)) => format!("{}…", &text[..end]),
        None => text.to_string(),
    }
}

#[async_trait]
impl<G: GatewayService> OnboardingFlow for GatewayOnboarding<G> {
    async fn conduct_onboarding(
        &self,
        guild: GuildId,
        channel: ChannelId,
        member: &User,
    ) -> Result<OnboardingResponses, OnboardingError> {
        info!("Starting onboarding of {} in guild {guild}", member.id);
        let mut events = self.gateway.subscribe();
        let mut responses = OnboardingResponses::default();

        for question in QUESTIONS {
            self.gateway
                .send_message(
                    channel,
                    CreateMessage::text(format!("{} {question}", member.mention())),
                )
                .await?;

            let answer = timeout(self.answer_timeout, async {
                loop {
                    match events.recv().await {
                        Ok(GatewayEvent::MessageReceived(message))
                            if is_answer(&message, channel, member) =>
                        {
                            return Ok(message.content);
                        }
                        Ok(_) => continue,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Onboarding of {} skipped {skipped} events", member.id);
                        }
                        Err(RecvError::Closed) => return Err(OnboardingError::StreamClosed),
                    }
                }
            })
            .await
            .map_err(|_| OnboardingError::AnswerTimeout {
                question: question.to_string(),
            })??;

            debug!("Member {} answered {question:?}", member.id);
            responses.push(question, &answer);
        }

        Ok(responses)
    }

    async fn generate_story(
        &self,
        member: &User,
        responses: &OnboardingResponses,
        inviter_name: Option<&str>,
        inviter_role: &str,
        inviter_story: Option<&str>,
    ) -> Result<String, OnboardingError> {
        let name = member.display_name();
        let mut story = match inviter_name {
            Some(inviter) => format!(
                "{name} arrived at the city gates at the invitation of {inviter}, \
                 known in the city as {inviter_role}."
            ),
            None => format!("{name} found the way to the city gates alone."),
        };

        for (question, answer) in &responses.answers {
            story.push_str(&format!("\n\nAsked \"{question}\", they answered: \"{answer}\""));
        }

        if let Some(inviter_story) = inviter_story {
            story.push_str(&format!(
                "\n\nThe one who vouched for them has a tale of their own: {}",
                truncate_chars(inviter_story, 280)
            ));
        }

        Ok(story)
    }

    async fn send_story_to_channel(
        &self,
        member: &User,
        story: &str,
        had_attribution: bool,
    ) -> Result<(), OnboardingError> {
        let Some(channel) = self.story_channel else {
            warn!("STORY_CHANNEL_ID is not set; not posting story of {}", member.id);
            return Ok(());
        };

        let embed = Embed {
            title: Some(format!("The arrival of {}", member.display_name())),
            description: Some(truncate_chars(story, MAX_STORY_CHARS)),
            color: Some(if had_attribution {
                VOUCHED_COLOR
            } else {
                STORY_COLOR
            }),
            footer: Some(EmbedFooter {
                text: story_marker(member),
            }),
            fields: vec![EmbedField {
                name: "Entered".to_string(),
                value: if had_attribution {
                    "by invitation".to_string()
                } else {
                    "unannounced".to_string()
                },
                inline: true,
            }],
        };
        self.gateway
            .send_message(
                channel,
                CreateMessage::embed(embed).with_content(member.mention()),
            )
            .await?;
        info!("Posted story of {} to channel {channel}", member.id);
        Ok(())
    }

    async fn scan_history_for_prior_participation(
        &self,
        member: &User,
    ) -> Result<bool, OnboardingError> {
        let Some(channel) = self.story_channel else {
            warn!("STORY_CHANNEL_ID is not set; cannot scan history for {}", member.id);
            return Ok(false);
        };

        let marker = story_marker(member);
        let history = self
            .gateway
            .fetch_recent_messages(channel, HISTORY_SCAN_WINDOW)
            .await?;
        let found = history
            .iter()
            .any(|message| references_member(message, member, &marker));
        debug!(
            "Scanned {} messages of channel {channel} for {}: found={found}",
            history.len(),
            member.id
        );
        Ok(found)
    }
}
