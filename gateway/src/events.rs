use crate::types::{CommandInvocation, GuildId, Member, Message, User};

/// Inbound notifications delivered by the event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// The stream is established and authenticated as `user`.
    Ready { user: User },
    /// A community became reachable (initial load or after a fresh session).
    GuildAvailable(GuildId),
    MemberArrived { guild_id: GuildId, member: Member },
    MessageReceived(Message),
    CommandInvoked(CommandInvocation),
    /// The stream dropped after a successful start.
    Disconnected { cause: String },
}
