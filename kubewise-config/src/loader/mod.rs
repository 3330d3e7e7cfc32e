pub mod error;

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use kubewise_core::ControllerConfig;
use tracing::debug;
use url::Url;

use self::error::ConfigLoadError;
use crate::{
    constants::{
        DEFAULT_CONFIG_LOCATIONS, DEFAULT_KUBERNETES_PORT, service_account_ca_path,
        service_account_token_path,
    },
    models::{Config, ConfigMetadata, HandlerKind, KubeSettings, SlackSettings},
    models::sources::{EnvConfig, FileConfig, FileControllerConfig, FileKubeConfig},
    util::{duration_millis, non_empty, parse_duration},
    validation::{self, ConfigWarning, ConfigWarnings},
};

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    /// Replaces the process environment; no `.env` file is read when set.
    pub env: Option<EnvConfig>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn with_env(mut self, env: EnvConfig) -> Self {
        self.options.env = Some(env);
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let (env_config, env_file_loaded) = match &self.options.env {
            Some(env) => (env.clone(), false),
            None => {
                let loaded = self.load_env_file()?;
                (EnvConfig::gather(), loaded)
            }
        };

        let (file_config, config_path) = self.load_file_config(&env_config)?;
        let config_present = file_config.is_some();

        let config = compose_config(
            file_config.unwrap_or_default(),
            env_config,
            ConfigMetadata {
                config_path,
                env_file_loaded,
            },
        )?;

        let mut warnings = ConfigWarnings::default();
        if !config_present {
            warnings.extend([ConfigWarning::new(
                "No kubewise.toml detected; using environment variables only",
            )
            .hint("Pass --config or set KW_CONFIG to load a configuration file")]);
        }
        warnings.extend(validation::review(&config));

        Ok(ConfigLoad { config, warnings })
    }

    fn load_env_file(&self) -> Result<bool, ConfigLoadError> {
        let result = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true),
            None => dotenvy::dotenv().map(|_| true),
        };
        match result {
            Ok(loaded) => Ok(loaded),
            Err(dotenvy::Error::Io(_)) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn load_file_config(
        &self,
        env_config: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let explicit = self
            .options
            .config_path
            .clone()
            .or_else(|| env_config.config_path.clone());

        let path = match explicit {
            Some(path) if !path.exists() => {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            Some(path) => path,
            None => match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .map(PathBuf::from)
                .find(|candidate| candidate.exists())
            {
                Some(path) => path,
                None => return Ok((None, None)),
            },
        };

        debug!(path = %path.display(), "reading configuration file");
        let file_config = read_file_config(&path)?;
        Ok((Some(file_config), Some(path)))
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn compose_config(
    file: FileConfig,
    env: EnvConfig,
    metadata: ConfigMetadata,
) -> Result<Config, ConfigLoadError> {
    let controller = compose_controller(&file.controller, &env)?;

    let namespace = non_empty(env.namespace.clone().or(file.namespace));

    let slack = non_empty(env.slack_token.clone().or(file.slack.token)).map(|token| {
        SlackSettings {
            token,
            channel: non_empty(env.slack_channel.clone().or(file.slack.channel)),
        }
    });

    let handlers = compose_handlers(env.handlers.clone().or(file.handlers), slack.is_some())?;
    let kube = compose_kube(file.kube, &env)?;

    Ok(Config {
        controller,
        namespace,
        handlers,
        slack,
        kube,
        metadata,
    })
}

fn compose_controller(
    file: &FileControllerConfig,
    env: &EnvConfig,
) -> Result<ControllerConfig, ConfigLoadError> {
    let mut controller = ControllerConfig::default();

    if let Some(marker) = non_empty(env.marker_type.clone().or_else(|| file.marker_type.clone()))
    {
        controller.watch.marker_type = marker;
    }

    match &env.max_retries {
        Some(raw) => {
            controller.retry.max_retries =
                raw.trim()
                    .parse()
                    .map_err(|source| ConfigLoadError::InvalidNumber {
                        key: "max_retries",
                        value: raw.clone(),
                        source,
                    })?;
        }
        None => {
            if let Some(max_retries) = file.max_retries {
                controller.retry.max_retries = max_retries;
            }
        }
    }

    let backoff_base = file.retry_backoff_base.as_deref();
    if let Some(base) = duration_setting("retry_backoff_base", backoff_base)? {
        controller.retry.backoff_base_ms = duration_millis(base);
    }
    let backoff_max = file.retry_backoff_max.as_deref();
    if let Some(max) = duration_setting("retry_backoff_max", backoff_max)? {
        controller.retry.backoff_max_ms = duration_millis(max);
    }

    let dispatch_timeout = env
        .dispatch_timeout
        .as_deref()
        .or(file.dispatch_timeout.as_deref());
    if let Some(timeout) = duration_setting("dispatch_timeout", dispatch_timeout)? {
        controller.dispatch.timeout_ms = duration_millis(timeout);
    }

    let sync_timeout = env
        .cache_sync_timeout
        .as_deref()
        .or(file.cache_sync_timeout.as_deref());
    if let Some(timeout) = duration_setting("cache_sync_timeout", sync_timeout)? {
        controller.watch.cache_sync_timeout_ms = duration_millis(timeout);
    }

    Ok(controller)
}

fn duration_setting(
    key: &'static str,
    raw: Option<&str>,
) -> Result<Option<Duration>, ConfigLoadError> {
    raw.map(|value| {
        parse_duration(value).map_err(|source| ConfigLoadError::InvalidDuration {
            key,
            value: value.to_string(),
            source,
        })
    })
    .transpose()
}

/// Explicit lists are honoured as given; otherwise Slack is used when a
/// token is present and the log handler when it is not.
fn compose_handlers(
    requested: Option<Vec<String>>,
    slack_configured: bool,
) -> Result<Vec<HandlerKind>, ConfigLoadError> {
    let requested = requested.unwrap_or_default();
    if requested.is_empty() {
        return Ok(vec![if slack_configured {
            HandlerKind::Slack
        } else {
            HandlerKind::Log
        }]);
    }

    let mut handlers = Vec::with_capacity(requested.len());
    for name in requested {
        let kind = name
            .parse::<HandlerKind>()
            .map_err(ConfigLoadError::UnknownHandler)?;
        if !handlers.contains(&kind) {
            handlers.push(kind);
        }
    }
    if handlers.contains(&HandlerKind::Slack) && !slack_configured {
        return Err(ConfigLoadError::MissingSlackToken);
    }
    Ok(handlers)
}

fn compose_kube(file: FileKubeConfig, env: &EnvConfig) -> Result<KubeSettings, ConfigLoadError> {
    let in_cluster = env.kubernetes_service_host.is_some();

    let api_url = match non_empty(env.kube_api.clone().or(file.api_url)) {
        Some(raw) => Some(parse_api_url(&raw)?),
        None => match &env.kubernetes_service_host {
            Some(host) => {
                let port = env
                    .kubernetes_service_port
                    .clone()
                    .unwrap_or_else(|| DEFAULT_KUBERNETES_PORT.to_string());
                let host = if host.contains(':') {
                    format!("[{host}]")
                } else {
                    host.clone()
                };
                Some(parse_api_url(&format!("https://{host}:{port}"))?)
            }
            None => None,
        },
    };

    let token_file = env
        .kube_token_file
        .clone()
        .or(file.token_file)
        .or_else(|| in_cluster.then(service_account_token_path));
    let ca_file = env
        .kube_ca_file
        .clone()
        .or(file.ca_file)
        .or_else(|| in_cluster.then(service_account_ca_path));

    Ok(KubeSettings {
        api_url,
        token_file,
        ca_file,
    })
}

fn parse_api_url(raw: &str) -> Result<Url, ConfigLoadError> {
    Url::parse(raw).map_err(|source| ConfigLoadError::InvalidApiUrl {
        value: raw.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_handler_follows_slack_token() {
        assert_eq!(compose_handlers(None, false).expect("handlers"), vec![HandlerKind::Log]);
        assert_eq!(compose_handlers(None, true).expect("handlers"), vec![HandlerKind::Slack]);
    }

    #[test]
    fn explicit_slack_handler_requires_token() {
        let err = compose_handlers(Some(vec!["slack".into()]), false).expect_err("no token");
        assert!(matches!(err, ConfigLoadError::MissingSlackToken));

        let err = compose_handlers(Some(vec!["email".into()]), true).expect_err("unknown");
        assert!(matches!(err, ConfigLoadError::UnknownHandler(name) if name == "email"));
    }

    #[test]
    fn in_cluster_defaults_use_service_variables() {
        let env = EnvConfig {
            kubernetes_service_host: Some("10.0.0.1".into()),
            kubernetes_service_port: Some("6443".into()),
            ..EnvConfig::default()
        };
        let kube = compose_kube(FileKubeConfig::default(), &env).expect("kube");

        assert_eq!(
            kube.api_url.as_ref().map(Url::as_str),
            Some("https://10.0.0.1:6443/")
        );
        assert_eq!(kube.token_file, Some(service_account_token_path()));
        assert_eq!(kube.ca_file, Some(service_account_ca_path()));
    }

    #[test]
    fn ipv6_service_host_is_bracketed() {
        let env = EnvConfig {
            kubernetes_service_host: Some("fd00::1".into()),
            ..EnvConfig::default()
        };
        let kube = compose_kube(FileKubeConfig::default(), &env).expect("kube");
        assert_eq!(
            kube.api_url.as_ref().and_then(|url| url.host_str()),
            Some("[fd00::1]")
        );
    }

    #[test]
    fn out_of_cluster_without_endpoint_has_no_api_url() {
        let kube = compose_kube(FileKubeConfig::default(), &EnvConfig::default()).expect("kube");
        assert!(kube.api_url.is_none());
        assert!(kube.token_file.is_none());
    }
}
