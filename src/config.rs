use std::{path::PathBuf, str::FromStr};

use gateway::types::{ChannelId, RoleId};
use log::warn;

use crate::error::ConfigError;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_STORY_STORE_PATH: &str = "stories.json";

#[derive(Clone, Debug)]
pub struct BotConfig {
    pub token: String,
    pub outsider_role: Option<RoleId>,
    pub associate_role: Option<RoleId>,
    /// The only channel where `join` is accepted.
    pub city_gates_channel: Option<ChannelId>,
    pub story_channel: Option<ChannelId>,
    pub port: u16,
    pub story_store_path: PathBuf,
}

impl BotConfig {
    /// Read configuration from the process environment:
    /// - requires DISCORD_TOKEN
    /// - OUTSIDER_ROLE_ID, ASSOCIATE_ROLE_ID, CITY_GATES_CHANNEL_ID,
    ///   STORY_CHANNEL_ID degrade their feature when missing
    /// - PORT, STORY_STORE_PATH fall back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let token = get("DISCORD_TOKEN").ok_or(ConfigError::Missing("DISCORD_TOKEN"))?;

        let outsider_role = optional_id(&get, "OUTSIDER_ROLE_ID", "join is disabled");
        let associate_role = optional_id(&get, "ASSOCIATE_ROLE_ID", "join is disabled");
        let city_gates_channel =
            optional_id(&get, "CITY_GATES_CHANNEL_ID", "join will be rejected everywhere");
        let story_channel = optional_id(
            &get,
            "STORY_CHANNEL_ID",
            "stories will not be posted or scanned",
        );

        let port = match get("PORT") {
            None => DEFAULT_PORT,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!("PORT has invalid value {raw:?}; using {DEFAULT_PORT}");
                DEFAULT_PORT
            }),
        };
        let story_store_path = get("STORY_STORE_PATH")
            .unwrap_or_else(|| DEFAULT_STORY_STORE_PATH.to_string())
            .into();

        Ok(Self {
            token,
            outsider_role,
            associate_role,
            city_gates_channel,
            story_channel,
            port,
            story_store_path,
        })
    }
}

fn optional_id<T, F>(get: &F, name: &'static str, consequence: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get(name) else {
        warn!("{name} is not set; {consequence}");
        return None;
    };
    match raw.parse() {
        Ok(id) => Some(id),
        Err(_) => {
            let err = ConfigError::Invalid { name, value: raw };
            warn!("{err}; {consequence}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn token_is_required() {
        let err = BotConfig::from_lookup(lookup(&[("OUTSIDER_ROLE_ID", "1")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DISCORD_TOKEN")));
    }

    #[test]
    fn reads_ids_and_defaults() {
        let config = BotConfig::from_lookup(lookup(&[
            ("DISCORD_TOKEN", "secret"),
            ("OUTSIDER_ROLE_ID", "111"),
            ("ASSOCIATE_ROLE_ID", " 222 "),
            ("CITY_GATES_CHANNEL_ID", "333"),
        ]))
        .unwrap();

        assert_eq!(config.outsider_role, Some(RoleId(111)));
        assert_eq!(config.associate_role, Some(RoleId(222)));
        assert_eq!(config.city_gates_channel, Some(ChannelId(333)));
        assert_eq!(config.story_channel, None);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.story_store_path, PathBuf::from("stories.json"));
    }

    #[test]
    fn invalid_values_degrade_instead_of_failing() {
        let config = BotConfig::from_lookup(lookup(&[
            ("DISCORD_TOKEN", "secret"),
            ("OUTSIDER_ROLE_ID", "not-a-number"),
            ("PORT", "eighty"),
        ]))
        .unwrap();

        assert_eq!(config.outsider_role, None);
        assert_eq!(config.port, DEFAULT_PORT);
    }
}
