use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::util::{non_empty, parse_csv};

/// Raw configuration as defined in a TOML file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handlers: Option<Vec<String>>,
    #[serde(default)]
    pub slack: FileSlackConfig,
    #[serde(default)]
    pub kube: FileKubeConfig,
    #[serde(default)]
    pub controller: FileControllerConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileSlackConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileKubeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<PathBuf>,
}

/// Controller tuning. Durations use humantime notation (`"10s"`, `"1m"`).
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileControllerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marker_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_backoff_base: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_backoff_max: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatch_timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_sync_timeout: Option<String>,
}

/// Environment-derived configuration values.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub namespace: Option<String>,
    pub handlers: Option<Vec<String>>,
    pub slack_token: Option<String>,
    pub slack_channel: Option<String>,
    pub marker_type: Option<String>,
    pub max_retries: Option<String>,
    pub dispatch_timeout: Option<String>,
    pub cache_sync_timeout: Option<String>,
    pub kube_api: Option<String>,
    pub kube_token_file: Option<PathBuf>,
    pub kube_ca_file: Option<PathBuf>,
    pub kubernetes_service_host: Option<String>,
    pub kubernetes_service_port: Option<String>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the environment layer from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| non_empty(lookup(name));
        Self {
            config_path: var("KW_CONFIG").map(PathBuf::from),
            namespace: var("KW_NAMESPACE"),
            handlers: var("KW_HANDLERS").map(|raw| parse_csv(&raw)),
            slack_token: var("KW_SLACK_TOKEN"),
            slack_channel: var("KW_SLACK_CHANNEL"),
            marker_type: var("KW_MARKER_TYPE"),
            max_retries: var("KW_MAX_RETRIES"),
            dispatch_timeout: var("KW_DISPATCH_TIMEOUT"),
            cache_sync_timeout: var("KW_CACHE_SYNC_TIMEOUT"),
            kube_api: var("KW_KUBE_API"),
            kube_token_file: var("KW_KUBE_TOKEN_FILE").map(PathBuf::from),
            kube_ca_file: var("KW_KUBE_CA_FILE").map(PathBuf::from),
            kubernetes_service_host: var("KUBERNETES_SERVICE_HOST"),
            kubernetes_service_port: var("KUBERNETES_SERVICE_PORT"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn blank_variables_count_as_unset() {
        let vars: HashMap<&str, &str> =
            [("KW_NAMESPACE", "  "), ("KW_HANDLERS", "slack,log")].into();
        let env = EnvConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(env.namespace, None);
        assert_eq!(env.handlers, Some(vec!["slack".into(), "log".into()]));
    }

    #[test]
    fn file_sections_are_optional() {
        let file: FileConfig = toml::from_str("namespace = \"team-a\"").expect("parse");
        assert_eq!(file.namespace.as_deref(), Some("team-a"));
        assert!(file.slack.token.is_none());
        assert!(file.controller.max_retries.is_none());
    }
}
