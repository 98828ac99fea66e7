use super::schema::Config;
use crate::error::{ConfigError, Result};
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use std::path::Path;

const ENV_PREFIX: &str = "RESTPIPE_";

pub async fn load_from_env_or_file() -> Result<Config> {
    let config: Config = Figment::new()
        .merge(Toml::file("restpipe.toml"))
        .merge(Json::file("restpipe.json"))
        .merge(Yaml::file("restpipe.yaml"))
        .merge(Yaml::file("restpipe.yml"))
        // Override with environment variables (RESTPIPE_LISTENER__PORT=9090)
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    validate(&config)?;
    apply_env_substitutions(config)
}

pub async fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();

    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Figment::new().merge(Toml::file(path)),
        Some("json") => Figment::new().merge(Json::file(path)),
        Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
        _ => {
            return Err(ConfigError::Parse(
                "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
            )
            .into())
        }
    };

    let config: Config = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    validate(&config)?;
    apply_env_substitutions(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.buffers.buffer_size == 0 {
        return Err(ConfigError::Validation("buffers.bufferSize must be greater than 0".into()).into());
    }

    if config.buffers.max_content_size < config.buffers.buffer_size {
        return Err(ConfigError::Validation(format!(
            "buffers.maxContentSize ({}) must be at least buffers.bufferSize ({})",
            config.buffers.max_content_size, config.buffers.buffer_size
        ))
        .into());
    }

    if config.async_interceptors.max_concurrent == 0 {
        return Err(ConfigError::Validation(
            "asyncInterceptors.maxConcurrent must be greater than 0".into(),
        )
        .into());
    }

    config
        .plugins
        .validate()
        .map_err(ConfigError::Validation)?;

    let mut proxy_names = std::collections::HashSet::new();
    for proxy in &config.proxies {
        if !proxy_names.insert(&proxy.name) {
            return Err(ConfigError::Validation(format!("Duplicate proxy '{}'", proxy.name)).into());
        }
        if !proxy.uri.starts_with('/') {
            return Err(ConfigError::Validation(format!(
                "Proxy '{}' uri must start with '/'",
                proxy.name
            ))
            .into());
        }
        if !proxy.upstream.starts_with("http://") && !proxy.upstream.starts_with("https://") {
            return Err(ConfigError::Validation(format!(
                "Proxy '{}' has invalid upstream URL",
                proxy.name
            ))
            .into());
        }
    }

    for stream in &config.change_streams.streams {
        if stream.db.is_empty() || stream.coll.is_empty() || stream.uri.is_empty() {
            return Err(ConfigError::Validation(
                "Change stream definitions need db, coll and uri".into(),
            )
            .into());
        }
        if stream.stages.iter().any(|s| !s.is_object()) {
            return Err(ConfigError::Validation(format!(
                "Change stream '{}' stages must be objects",
                stream.uri
            ))
            .into());
        }
    }

    Ok(())
}

fn apply_env_substitutions(mut config: Config) -> Result<Config> {
    for proxy in &mut config.proxies {
        proxy.upstream = substitute_env_vars(&proxy.upstream)?;
    }

    if let Some(dir) = &config.plugins.plugin_dir {
        let substituted = substitute_env_vars(&dir.to_string_lossy())?;
        config.plugins.plugin_dir = Some(substituted.into());
    }

    Ok(config)
}

fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(value) => {
                result = result.replace(&cap[0], &value);
            }
            Err(_) => {
                // ${VAR:-default}
                if let Some((name, default)) = var_name.split_once(":-") {
                    match std::env::var(name) {
                        Ok(value) => result = result.replace(&cap[0], &value),
                        Err(_) => result = result.replace(&cap[0], default),
                    }
                } else {
                    return Err(ConfigError::EnvVar(format!(
                        "Environment variable '{}' not found",
                        var_name
                    ))
                    .into());
                }
            }
        }
    }

    Ok(result)
}
