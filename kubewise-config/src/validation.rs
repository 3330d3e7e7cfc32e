//! Non-fatal configuration checks.

use crate::models::{Config, HandlerKind};

/// A setting that loaded but is probably not what the operator meant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub message: String,
    /// How to silence the warning, when there is a single obvious fix.
    pub hint: Option<String>,
}

impl ConfigWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            hint: None,
        }
    }

    pub fn hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// Warnings gathered while loading, in the order they were found.
#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings(Vec<ConfigWarning>);

impl ConfigWarnings {
    pub fn iter(&self) -> std::slice::Iter<'_, ConfigWarning> {
        self.0.iter()
    }
}

impl Extend<ConfigWarning> for ConfigWarnings {
    fn extend<I: IntoIterator<Item = ConfigWarning>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl IntoIterator for ConfigWarnings {
    type Item = ConfigWarning;
    type IntoIter = std::vec::IntoIter<ConfigWarning>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a ConfigWarnings {
    type Item = &'a ConfigWarning;
    type IntoIter = std::slice::Iter<'a, ConfigWarning>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Flags settings that load fine but are likely mistakes.
pub fn review(config: &Config) -> ConfigWarnings {
    let mut warnings = Vec::new();

    if config.controller.retry.max_retries == 0 {
        warnings.push(
            ConfigWarning::new("max_retries is 0; failed notifications are never retried")
                .hint("Set KW_MAX_RETRIES to a positive value"),
        );
    }
    if config.controller.dispatch.timeout_ms == 0 {
        warnings.push(
            ConfigWarning::new("dispatch timeout is 0; a hung handler will stall the worker")
                .hint("Set KW_DISPATCH_TIMEOUT, e.g. `10s`"),
        );
    }
    if config.controller.retry.backoff_base_ms > config.controller.retry.backoff_max_ms {
        warnings.push(ConfigWarning::new(
            "retry backoff base exceeds its maximum; every retry waits the maximum",
        ));
    }

    if config.slack.is_some() && !config.handler_enabled(HandlerKind::Slack) {
        warnings.push(
            ConfigWarning::new("a Slack token is configured but the slack handler is not enabled")
                .hint("Add `slack` to KW_HANDLERS"),
        );
    }
    if let Some(slack) = &config.slack
        && slack
            .channel
            .as_deref()
            .is_some_and(|channel| !channel.starts_with('#') && !channel.starts_with('C'))
    {
        warnings.push(ConfigWarning::new(
            "Slack channel does not look like `#name` or a channel id; messages may be rejected",
        ));
    }

    if let Some(url) = &config.kube.api_url {
        if url.scheme() == "http" && config.kube.token_file.is_some() {
            warnings.push(ConfigWarning::new(format!(
                "cluster API {url} is plain HTTP; the bearer token is sent unencrypted"
            )));
        }
        if let Some(path) = &config.kube.token_file
            && !path.exists()
        {
            warnings.push(ConfigWarning::new(format!(
                "token file {} does not exist",
                path.display()
            )));
        }
        if let Some(path) = &config.kube.ca_file
            && !path.exists()
        {
            warnings.push(ConfigWarning::new(format!(
                "CA file {} does not exist",
                path.display()
            )));
        }
    }

    ConfigWarnings(warnings)
}
