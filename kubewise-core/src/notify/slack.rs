use std::{fmt, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use super::presenter;
use crate::{
    dispatch::{NotificationHandler, NotifyError},
    model::{Release, ReleaseEvent},
};

pub const DEFAULT_SLACK_CHANNEL: &str = "#general";
pub const DEFAULT_SLACK_API: &str = "https://slack.com/api/";

const TOKEN_PLACEHOLDER: &str = "<slack-api-token>";

/// Slack Web API failures that clear up on their own.
const RETRYABLE_API_ERRORS: &[&str] = &[
    "ratelimited",
    "rate_limited",
    "request_timeout",
    "service_unavailable",
    "fatal_error",
    "internal_error",
];

#[derive(Clone)]
pub struct SlackConfig {
    pub token: String,
    pub channel: String,
    pub api_base: Url,
    pub request_timeout: Duration,
}

impl fmt::Debug for SlackConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlackConfig")
            .field("token", &TOKEN_PLACEHOLDER)
            .field("channel", &self.channel)
            .field("api_base", &self.api_base.as_str())
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl SlackConfig {
    pub fn new(token: impl Into<String>, channel: Option<String>) -> Result<Self, NotifyError> {
        let api_base = Url::parse(DEFAULT_SLACK_API)
            .map_err(|err| NotifyError::Rejected(format!("invalid Slack API URL: {err}")))?;
        Ok(Self {
            token: token.into(),
            channel: channel
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| DEFAULT_SLACK_CHANNEL.to_string()),
            api_base,
            request_timeout: Duration::from_secs(5),
        })
    }
}

#[derive(Serialize)]
struct PostMessage<'a> {
    channel: &'a str,
    text: &'a str,
    as_user: bool,
}

#[derive(Deserialize, Default)]
struct PostMessageResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    ts: Option<String>,
}

/// Posts presenter messages to a Slack channel via `chat.postMessage`.
pub struct SlackNotifier {
    client: Client,
    config: SlackConfig,
}

impl fmt::Debug for SlackNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlackNotifier")
            .field("config", &self.config)
            .finish()
    }
}

impl SlackNotifier {
    pub fn new(config: SlackConfig) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| NotifyError::Rejected(format!("failed to build HTTP client: {err}")))?;
        Ok(Self { client, config })
    }

    fn redact(&self, message: impl Into<String>) -> String {
        redact_token(&message.into(), &self.config.token)
    }

    async fn post(&self, text: &str) -> Result<(), NotifyError> {
        let url = self
            .config
            .api_base
            .join("chat.postMessage")
            .map_err(|err| NotifyError::Rejected(format!("invalid Slack API URL: {err}")))?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.token)
            .json(&PostMessage {
                channel: &self.config.channel,
                text,
                as_user: true,
            })
            .send()
            .await
            .map_err(|err| NotifyError::Transient(self.redact(err.to_string())))?;

        let status = response.status();
        let body = response
            .json::<PostMessageResponse>()
            .await
            .unwrap_or_default();
        let sent = interpret(status, &body).map_err(|err| match err {
            NotifyError::Transient(msg) => NotifyError::Transient(self.redact(msg)),
            NotifyError::Rejected(msg) => NotifyError::Rejected(self.redact(msg)),
            other => other,
        })?;

        info!(
            target: "kubewise::notify",
            channel = sent.0.as_deref().unwrap_or(&self.config.channel),
            ts = sent.1.as_deref().unwrap_or_default(),
            "message sent to Slack"
        );
        Ok(())
    }
}

type Posted = (Option<String>, Option<String>);

fn interpret(status: StatusCode, body: &PostMessageResponse) -> Result<Posted, NotifyError> {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Err(NotifyError::Transient(format!("Slack answered HTTP {status}")));
    }
    if !status.is_success() {
        return Err(NotifyError::Rejected(format!("Slack answered HTTP {status}")));
    }
    if body.ok {
        return Ok((body.channel.clone(), body.ts.clone()));
    }
    let code = body.error.as_deref().unwrap_or("unknown_error");
    if RETRYABLE_API_ERRORS.contains(&code) {
        Err(NotifyError::Transient(format!("Slack API error: {code}")))
    } else {
        Err(NotifyError::Rejected(format!("Slack API error: {code}")))
    }
}

fn redact_token(message: &str, token: &str) -> String {
    if token.is_empty() {
        return message.to_string();
    }
    message.replace(token, TOKEN_PLACEHOLDER)
}

#[async_trait]
impl NotificationHandler for SlackNotifier {
    fn name(&self) -> &str {
        "slack"
    }

    async fn handle_event(&self, event: &ReleaseEvent) -> Result<(), NotifyError> {
        let message = presenter::event_message(event);
        if message.is_empty() {
            debug!(target: "kubewise::notify", action = %event.action, "nothing to post");
            return Ok(());
        }
        self.post(&message).await
    }

    async fn handle_server_startup(&self, releases: &[Release]) -> Result<(), NotifyError> {
        let message = presenter::startup_message(releases);
        if message.is_empty() {
            return Ok(());
        }
        self.post(&message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(ok: bool, error: Option<&str>) -> PostMessageResponse {
        PostMessageResponse {
            ok,
            error: error.map(str::to_string),
            channel: Some("C123".into()),
            ts: Some("1714557600.000100".into()),
        }
    }

    #[test]
    fn token_never_appears_in_errors() {
        let redacted = redact_token(
            "error sending request for url (https://x/?token=xoxb-secret)",
            "xoxb-secret",
        );
        assert!(!redacted.contains("xoxb-secret"));
        assert!(redacted.contains(TOKEN_PLACEHOLDER));
    }

    #[test]
    fn classifies_slack_responses() {
        assert!(interpret(StatusCode::OK, &response(true, None)).is_ok());

        let throttled = interpret(StatusCode::TOO_MANY_REQUESTS, &response(false, None))
            .expect_err("throttled");
        assert!(throttled.is_retryable());

        let limited = interpret(StatusCode::OK, &response(false, Some("ratelimited")))
            .expect_err("ratelimited");
        assert!(limited.is_retryable());

        let missing = interpret(StatusCode::OK, &response(false, Some("channel_not_found")))
            .expect_err("channel_not_found");
        assert!(!missing.is_retryable());
    }

    #[test]
    fn channel_defaults_to_general() {
        let config = SlackConfig::new("xoxb-secret", None).expect("config");
        assert_eq!(config.channel, DEFAULT_SLACK_CHANNEL);
        assert!(!format!("{config:?}").contains("xoxb-secret"));
    }
}
