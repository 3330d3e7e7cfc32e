pub mod sources;

use std::{fmt, path::PathBuf, str::FromStr};

use kubewise_core::ControllerConfig;
use url::Url;

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub controller: ControllerConfig,
    /// Namespace to watch; `None` watches every namespace.
    pub namespace: Option<String>,
    pub handlers: Vec<HandlerKind>,
    pub slack: Option<SlackSettings>,
    pub kube: KubeSettings,
    pub metadata: ConfigMetadata,
}

impl Config {
    pub fn handler_enabled(&self, kind: HandlerKind) -> bool {
        self.handlers.contains(&kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Slack,
    Log,
}

impl HandlerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HandlerKind::Slack => "slack",
            HandlerKind::Log => "log",
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HandlerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "slack" => Ok(HandlerKind::Slack),
            "log" | "logs" | "tracing" => Ok(HandlerKind::Log),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct SlackSettings {
    pub token: String,
    pub channel: Option<String>,
}

impl fmt::Debug for SlackSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlackSettings")
            .field("token", &"<redacted>")
            .field("channel", &self.channel)
            .finish()
    }
}

/// How to reach the cluster API.
#[derive(Debug, Clone, Default)]
pub struct KubeSettings {
    /// `None` when neither an explicit endpoint nor the in-cluster service
    /// variables are available.
    pub api_url: Option<Url>,
    pub token_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}
