mod settings;

use std::path::Path;

use config::{Config, ConfigError, Environment, File};

use crate::config::settings::PartialSettings;

pub use settings::{
    BridgeSettings, DispatchSetting, LoggingSettings, PubSubSettings, ServerSettings, Settings,
};

/// Prefix of the environment variables that override file settings, e.g.
/// `PUBSUB_BRIDGE__PUBSUB__TOPIC`.
pub const ENV_PREFIX: &str = "PUBSUB_BRIDGE";

/// Loads `config/default.*` relative to the working directory, then the
/// environment, and merges the result over the defaults.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from(Path::new("."))
}

/// Same as `load_config`, with `config/default.*` looked up under `root`.
pub fn load_config_from(root: &Path) -> Result<Settings, ConfigError> {
    let file = root.join("config").join("default");
    let builder = Config::builder()
        .add_source(File::with_name(&file.to_string_lossy()).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    Ok(partial.merge(Settings::default()))
}

#[cfg(test)]
mod tests;
