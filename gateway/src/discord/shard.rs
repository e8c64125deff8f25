//! One event-stream session: handshake, heartbeat, dispatch decoding.
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{
    net::TcpStream,
    sync::broadcast,
    task::JoinHandle,
    time::{interval_at, timeout, Instant},
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};

use crate::{
    events::GatewayEvent,
    types::{ChannelId, CommandInvocation, GuildId, InteractionId, Member, Message, User},
    GatewayError,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const GATEWAY_QUERY: &str = "?v=10&encoding=json";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

mod op {
    pub const DISPATCH: u8 = 0;
    pub const HEARTBEAT: u8 = 1;
    pub const IDENTIFY: u8 = 2;
    pub const RECONNECT: u8 = 7;
    pub const INVALID_SESSION: u8 = 9;
    pub const HELLO: u8 = 10;
    pub const HEARTBEAT_ACK: u8 = 11;
}

mod intents {
    pub const GUILDS: u64 = 1 << 0;
    pub const GUILD_MEMBERS: u64 = 1 << 1;
    pub const GUILD_INVITES: u64 = 1 << 6;
    pub const GUILD_MESSAGES: u64 = 1 << 9;
    pub const MESSAGE_CONTENT: u64 = 1 << 15;
}

const INTENTS: u64 = intents::GUILDS
    | intents::GUILD_MEMBERS
    | intents::GUILD_INVITES
    | intents::GUILD_MESSAGES
    | intents::MESSAGE_CONTENT;

const APPLICATION_COMMAND: u8 = 2;

#[derive(Debug, Deserialize)]
struct Frame {
    op: u8,
    #[serde(default)]
    d: Value,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
}

#[derive(Deserialize)]
struct GuildCreate {
    id: GuildId,
    #[serde(default)]
    unavailable: bool,
}

#[derive(Deserialize)]
struct MemberAdd {
    guild_id: GuildId,
    #[serde(flatten)]
    member: Member,
}

#[derive(Deserialize)]
struct InteractionData {
    name: String,
}

#[derive(Deserialize)]
struct RawInteraction {
    id: InteractionId,
    #[serde(rename = "type")]
    kind: u8,
    token: String,
    guild_id: Option<GuildId>,
    channel_id: Option<ChannelId>,
    member: Option<Member>,
    user: Option<User>,
    data: Option<InteractionData>,
}

impl RawInteraction {
    fn into_invocation(self) -> Option<CommandInvocation> {
        if self.kind != APPLICATION_COMMAND {
            return None;
        }
        let invoker = self.member.map(|m| m.user).or(self.user)?;
        Some(CommandInvocation {
            id: self.id,
            token: self.token,
            name: self.data?.name,
            guild_id: self.guild_id?,
            channel_id: self.channel_id?,
            invoker,
        })
    }
}

/// A running session. Dropping the handle stops the session task without
/// emitting a disconnect.
pub(crate) struct ShardHandle {
    task: JoinHandle<()>,
}

impl Drop for ShardHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Open a session and block until READY.
pub(crate) async fn open(
    url: &str,
    token: &str,
    events: broadcast::Sender<GatewayEvent>,
) -> Result<ShardHandle, GatewayError> {
    timeout(HANDSHAKE_TIMEOUT, handshake(url, token))
        .await
        .map_err(|_| GatewayError::Timeout("gateway handshake"))?
        .map(|(ws, heartbeat, seq, user)| {
            info!("Gateway session ready as {}", user.username);
            let _ = events.send(GatewayEvent::Ready { user });
            ShardHandle {
                task: tokio::spawn(run(ws, heartbeat, seq, events)),
            }
        })
}

async fn handshake(
    url: &str,
    token: &str,
) -> Result<(WsStream, Duration, Option<u64>, User), GatewayError> {
    let (mut ws, _) = connect_async(format!("{url}/{GATEWAY_QUERY}")).await?;

    let hello = next_frame(&mut ws).await?;
    if hello.op != op::HELLO {
        return Err(GatewayError::Protocol(format!(
            "expected HELLO, got op {}",
            hello.op
        )));
    }
    let heartbeat = hello
        .d
        .get("heartbeat_interval")
        .and_then(Value::as_u64)
        .map(Duration::from_millis)
        .ok_or_else(|| GatewayError::Protocol("HELLO without heartbeat interval".into()))?;

    let identify = json!({
        "op": op::IDENTIFY,
        "d": {
            "token": token,
            "intents": INTENTS,
            "properties": { "os": std::env::consts::OS, "browser": "citygate", "device": "citygate" },
        },
    });
    ws.send(WsMessage::Text(identify.to_string())).await?;

    let mut seq = None;
    loop {
        let frame = next_frame(&mut ws).await?;
        seq = frame.s.or(seq);
        match frame.op {
            op::DISPATCH if frame.t.as_deref() == Some("READY") => {
                let user = serde_json::from_value(frame.d["user"].clone())?;
                return Ok((ws, heartbeat, seq, user));
            }
            op::HEARTBEAT => ws.send(heartbeat_frame(seq)).await?,
            op::INVALID_SESSION => {
                return Err(GatewayError::Authentication("session invalidated".into()))
            }
            _ => continue,
        }
    }
}

async fn next_frame(ws: &mut WsStream) -> Result<Frame, GatewayError> {
    loop {
        match ws.next().await {
            Some(Ok(WsMessage::Text(text))) => return Ok(serde_json::from_str(&text)?),
            Some(Ok(WsMessage::Close(frame))) => {
                let reason = frame
                    .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                    .unwrap_or_else(|| "no close frame".to_string());
                return Err(GatewayError::Authentication(reason));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
            None => return Err(GatewayError::Protocol("stream ended during handshake".into())),
        }
    }
}

fn heartbeat_frame(seq: Option<u64>) -> WsMessage {
    WsMessage::Text(json!({ "op": op::HEARTBEAT, "d": seq }).to_string())
}

async fn run(
    mut ws: WsStream,
    heartbeat: Duration,
    mut seq: Option<u64>,
    events: broadcast::Sender<GatewayEvent>,
) {
    let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
    let mut acked = true;

    let cause = loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !acked {
                    break "heartbeat not acknowledged".to_string();
                }
                acked = false;
                if let Err(e) = ws.send(heartbeat_frame(seq)).await {
                    break format!("heartbeat failed: {e}");
                }
            }
            incoming = ws.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    let frame: Frame = match serde_json::from_str(&text) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!("Skipping undecodable gateway frame: {e}");
                            continue;
                        }
                    };
                    seq = frame.s.or(seq);
                    match frame.op {
                        op::DISPATCH => {
                            if let Some(event) = decode_dispatch(frame.t.as_deref(), frame.d) {
                                let _ = events.send(event);
                            }
                        }
                        op::HEARTBEAT => {
                            if let Err(e) = ws.send(heartbeat_frame(seq)).await {
                                break format!("heartbeat failed: {e}");
                            }
                        }
                        op::HEARTBEAT_ACK => acked = true,
                        op::RECONNECT => break "server requested reconnect".to_string(),
                        op::INVALID_SESSION => break "session invalidated".to_string(),
                        other => debug!("Ignoring gateway op {other}"),
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    break match frame {
                        Some(f) => format!("closed by server: {} {}", u16::from(f.code), f.reason),
                        None => "closed by server".to_string(),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break e.to_string(),
                None => break "stream ended".to_string(),
            }
        }
    };

    warn!("Gateway session ended: {cause}");
    let _ = events.send(GatewayEvent::Disconnected { cause });
}

fn decode_dispatch(kind: Option<&str>, data: Value) -> Option<GatewayEvent> {
    let kind = kind?;
    let decoded = match kind {
        "GUILD_CREATE" => serde_json::from_value::<GuildCreate>(data).map(|guild| {
            (!guild.unavailable).then_some(GatewayEvent::GuildAvailable(guild.id))
        }),
        "GUILD_MEMBER_ADD" => serde_json::from_value::<MemberAdd>(data).map(|add| {
            Some(GatewayEvent::MemberArrived {
                guild_id: add.guild_id,
                member: add.member,
            })
        }),
        "MESSAGE_CREATE" => serde_json::from_value::<Message>(data)
            .map(|message| Some(GatewayEvent::MessageReceived(message))),
        "INTERACTION_CREATE" => serde_json::from_value::<RawInteraction>(data)
            .map(|raw| raw.into_invocation().map(GatewayEvent::CommandInvoked)),
        _ => return None,
    };

    decoded
        .inspect_err(|e| warn!("Failed to decode {kind} dispatch: {e}"))
        .ok()
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_member_arrival() {
        let data = json!({
            "guild_id": "10",
            "user": { "id": "42", "username": "wanderer" },
            "roles": [],
        });
        let event = decode_dispatch(Some("GUILD_MEMBER_ADD"), data);
        match event {
            Some(GatewayEvent::MemberArrived { guild_id, member }) => {
                assert_eq!(guild_id, GuildId(10));
                assert_eq!(member.user.id.get(), 42);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn skips_unavailable_guilds() {
        let data = json!({ "id": "10", "unavailable": true });
        assert_eq!(decode_dispatch(Some("GUILD_CREATE"), data), None);
    }

    #[test]
    fn decodes_slash_command_invocation() {
        let data = json!({
            "id": "7",
            "type": 2,
            "token": "tok",
            "guild_id": "10",
            "channel_id": "20",
            "member": { "user": { "id": "42", "username": "wanderer" }, "roles": [] },
            "data": { "name": "join" },
        });
        match decode_dispatch(Some("INTERACTION_CREATE"), data) {
            Some(GatewayEvent::CommandInvoked(invocation)) => {
                assert_eq!(invocation.name, "join");
                assert_eq!(invocation.channel_id, ChannelId(20));
                assert_eq!(invocation.invoker.username, "wanderer");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn ignores_component_interactions() {
        let data = json!({ "id": "7", "type": 3, "token": "tok", "guild_id": "10", "channel_id": "20" });
        assert_eq!(decode_dispatch(Some("INTERACTION_CREATE"), data), None);
    }
}
