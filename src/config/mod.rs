mod settings;

use std::path::Path;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{
    ClientSettings, GatewaySettings, LogSettings, ServerSettings, Settings, StoreSettings,
};

/// Prefix for environment overrides, e.g. `KEYRELAY_SERVER__PORT=9000`.
pub const ENV_PREFIX: &str = "KEYRELAY";

/// Loads `config/default.*` (if present) and `KEYRELAY_*` environment
/// variables, merged over the defaults.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from(None)
}

/// Like `load_config`, but reads `path` instead of `config/default`. An
/// explicit path must exist.
pub fn load_config_from(path: Option<&Path>) -> Result<Settings, ConfigError> {
    let file = match path {
        Some(p) => File::from(p).required(true),
        None => File::with_name("config/default").required(false),
    };

    let builder = Config::builder().add_source(file).add_source(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__"),
    );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge_with_defaults())
}
