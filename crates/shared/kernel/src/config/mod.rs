use config::{Config, Environment, File};
use serde::de::DeserializeOwned;
use std::borrow::Cow;
use std::path::Path;
use tracing::info;

/// Prefix of environment overrides, e.g. `QHUB__QUOTA__TEMPORARY_LIMIT`.
pub const ENV_PREFIX: &str = "QHUB";

#[qhub_derive::qhub_error]
pub enum ConfigError {
    #[error("Config error{}: {source}", format_context(.context))]
    Config { source: config::ConfigError, context: Option<Cow<'static, str>> },
}

/// Loads configuration from an optional file overlaid with `QHUB__`-prefixed environment variables.
///
/// The layers are:
/// 1. **Base File**: TOML, YAML or JSON, chosen by extension. Required when `path` is given.
///    Without a path, a `qhub` file in the working directory is used if present.
/// 2. **Environment Overrides**: nested keys are separated by double underscores
///    (`QHUB__QUOTA__STORAGE_DIR` maps to `quota.storage_dir`).
///
/// Missing fields fall back to the target's `#[serde(default)]` values.
///
/// # Errors
/// Returns [`ConfigError::Config`] if an explicit file cannot be read, a value has the wrong
/// type, or deserialization into `T` fails.
///
/// # Example
/// ```rust
/// use qhub_kernel::config::load_config;
///
/// #[derive(Default, serde::Deserialize)]
/// struct AppConfig {
///     port: u16,
/// }
///
/// let cfg: AppConfig = load_config(Some("config/local.toml")).unwrap_or_default();
/// ```
pub fn load_config<T>(path: Option<impl AsRef<Path>>) -> Result<T, ConfigError>
where
    T: DeserializeOwned,
{
    let file = match &path {
        Some(p) => {
            info!(path = %p.as_ref().display(), "Loading config");
            File::from(p.as_ref()).required(true)
        },
        None => File::with_name("qhub").required(false),
    };

    let config = Config::builder()
        .add_source(file)
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build config")?
        .try_deserialize::<T>()
        .context("Failed to deserialize config")?;

    Ok(config)
}
