use gateway::GatewayError;

use crate::supervisor::ConnectionState;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Required variable {0} is not set")]
    Missing(&'static str),
    #[error("Variable {name} has invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Gave up connecting after {attempts} attempts: {source}")]
    ConnectExhausted {
        attempts: u32,
        #[source]
        source: GatewayError,
    },
    #[error("Connection already {0}")]
    AlreadyActive(ConnectionState),
}

#[derive(Debug, thiserror::Error)]
pub enum AttributionError {
    #[error("Gateway is {0}")]
    Unavailable(ConnectionState),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

#[derive(Debug, thiserror::Error)]
pub enum RoleError {
    #[error("Gateway is {0}")]
    Unavailable(ConnectionState),
    #[error("Lifecycle roles are not configured")]
    NotConfigured,
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

#[derive(Debug, thiserror::Error)]
pub enum StoryError {
    #[error("Problem from std::io library: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON processing error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum OnboardingError {
    #[error("Timed out waiting for an answer to {question:?}")]
    AnswerTimeout { question: String },
    #[error("Event stream closed during onboarding")]
    StreamClosed,
    #[error(transparent)]
    Story(#[from] StoryError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error(transparent)]
    Role(#[from] RoleError),
    #[error(transparent)]
    Onboarding(#[from] OnboardingError),
    #[error("An unknown error occurred: {0}")]
    Other(anyhow::Error),
}
