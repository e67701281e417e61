//! Settings loading: serde defaults, then an optional file, then
//! `HYDROCHAIN_*` environment variables.

use anyhow::Context;
use config::{Config, Environment, File};
use hydrochain::Settings;
use std::path::Path;

pub const ENV_PREFIX: &str = "HYDROCHAIN";

/// Loads settings from `path` and the process environment, resolves a
/// relative `base_path` against the working directory and validates.
pub fn load(path: Option<&Path>) -> anyhow::Result<Settings> {
    let mut settings = load_from(path, None)?;
    if settings.base_path.is_relative() {
        let cwd = std::env::current_dir().context("reading working directory")?;
        settings.base_path = cwd.join(&settings.base_path);
    }
    settings.validate()?;
    Ok(settings)
}

/// `env` replaces the process environment when given.
pub fn load_from(
    path: Option<&Path>,
    env: Option<config::Map<String, String>>,
) -> anyhow::Result<Settings> {
    let mut builder = Config::builder();

    if let Some(path) = path {
        builder = builder.add_source(File::from(path).required(true));
    }

    // Nested keys use a double underscore: HYDROCHAIN_HOOKS__EVALUATE.
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("chaining_vars")
            .source(env),
    );

    let settings: Settings = builder
        .build()
        .and_then(Config::try_deserialize)
        .with_context(|| match path {
            Some(path) => format!("loading settings from {}", path.display()),
            None => "loading settings from the environment".to_string(),
        })?;
    Ok(settings)
}
