mod loader;
mod schema;

pub use loader::{default_config_path, load_config, save_config, weave_home};
pub use schema::{
    AgentSettings, BrokerSettings, CacheSettings, Config, ContextSettings, FallbackSettings,
    ModelRef, OAuthConfig, ProviderSettings, ServerConfig, TracingSettings, TransportKind,
};
