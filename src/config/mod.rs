// Configuration management module
// Loads config.toml, overlays the flat environment settings and gates managed credentials

pub mod interactive;
pub mod settings;

pub use interactive::{run_interactive_config, show_config};
pub use settings::{
    Config, ConfigError, CosmosConfig, CosmosCredentials, EmbeddingConfig, EmbeddingCredentials,
    HttpConfig, LocalConfig, ManagedCredentials, SearchConfig, SearchCredentials, StorageMode,
};

/// Get the configuration directory path
#[inline]
pub fn get_config_dir() -> Result<std::path::PathBuf, ConfigError> {
    Config::config_dir()
}
