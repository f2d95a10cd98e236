//! Layered configuration: built-in defaults, then `config/default.*` (any
//! format the `config` crate understands), then `RABTAP__SECTION__KEY`
//! environment variables.

mod settings;

use config::{Config, ConfigError, Environment, File};

pub use settings::{
    BrokerSettings, CaptureSettings, LogSettings, PartialSettings, RetrySettings, Settings,
    TapSettings,
};

/// Loads the configuration from `config/default` and the environment and
/// merges it with default values.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Same as [`load_config`] with the configuration file looked up at `base`
/// (without extension).
pub fn load_config_from(base: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(base).required(false))
        .add_source(
            Environment::with_prefix("RABTAP")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(Settings::merge(partial))
}
