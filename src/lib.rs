pub mod attribution;
pub mod config;
pub mod error;
pub mod invites;
pub mod onboarding;
pub mod roles;
pub mod router;
pub mod server;
pub mod story;
pub mod supervisor;

pub use attribution::{AttributionResult, InviteAttributor};
pub use config::BotConfig;
pub use invites::{InviteCounterStore, InviteSnapshot};
pub use onboarding::{GatewayOnboarding, OnboardingFlow, OnboardingResponses};
pub use roles::{LifecycleRoles, LifecycleTag, MemberRoleState, RoleConsistencyEngine};
pub use router::{EventRouter, JoinInvocation, JoinOutcome};
pub use story::{JsonFileStoryStore, MemoryStoryStore, StoryStore};
pub use supervisor::{ConnectionState, ConnectionStatus, ConnectionSupervisor, RetryPolicy};
