use std::{fmt, path::PathBuf, time::Duration};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;
use url::Url;

use super::{ObjectList, SourceError, WatchNotification, WatchSource, WatchStream};
use crate::model::{Secret, WatchedObject};

/// Server-side cap on a single watch request; the watcher re-watches when
/// the stream ends.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// Credential presented to the API server.
#[derive(Clone)]
pub enum BearerToken {
    Static(String),
    /// Re-read on every request so rotated service-account tokens are picked up.
    File(PathBuf),
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BearerToken::Static(_) => f.write_str("Static(<redacted>)"),
            BearerToken::File(path) => f.debug_tuple("File").field(path).finish(),
        }
    }
}

impl BearerToken {
    fn resolve(&self) -> Result<String, SourceError> {
        match self {
            BearerToken::Static(token) => Ok(token.clone()),
            BearerToken::File(path) => {
                Ok(std::fs::read_to_string(path)?.trim().to_string())
            }
        }
    }
}

/// Connection settings for [`KubeApiSource`].
#[derive(Clone, Debug)]
pub struct KubeApiConfig {
    pub base_url: Url,
    pub token: Option<BearerToken>,
    /// PEM bundle trusted in addition to the system roots.
    pub ca_pem: Option<Vec<u8>>,
    pub namespace: Option<String>,
    /// Optional server-side field selector, e.g. `type=helm.sh/release.v1`.
    pub field_selector: Option<String>,
    pub connect_timeout: Duration,
}

impl KubeApiConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            token: None,
            ca_pem: None,
            namespace: None,
            field_selector: None,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_token(mut self, token: BearerToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn with_ca_pem(mut self, pem: Vec<u8>) -> Self {
        self.ca_pem = Some(pem);
        self
    }

    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace.filter(|ns| !ns.is_empty());
        self
    }

    pub fn with_field_selector(mut self, selector: impl Into<String>) -> Self {
        self.field_selector = Some(selector.into());
        self
    }
}

/// List/watch of `v1/Secret` objects over the cluster REST API.
pub struct KubeApiSource {
    client: Client,
    config: KubeApiConfig,
}

impl fmt::Debug for KubeApiSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeApiSource")
            .field("base_url", &self.config.base_url.as_str())
            .field("namespace", &self.config.namespace)
            .field("field_selector", &self.config.field_selector)
            .field("has_token", &self.config.token.is_some())
            .finish()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListMeta {
    #[serde(default)]
    resource_version: Option<String>,
}

#[derive(Deserialize)]
struct ListResponse {
    #[serde(default)]
    metadata: Option<ListMeta>,
    #[serde(default)]
    items: Vec<Value>,
}

#[derive(Deserialize)]
struct RawWatchEvent {
    #[serde(rename = "type")]
    type_: String,
    object: Value,
}

#[derive(Deserialize, Default)]
struct ApiStatus {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: Option<String>,
}

impl KubeApiSource {
    pub fn new(config: KubeApiConfig) -> Result<Self, SourceError> {
        let mut builder = Client::builder().connect_timeout(config.connect_timeout);
        if let Some(pem) = &config.ca_pem {
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(pem)?);
        }
        Ok(Self {
            client: builder.build()?,
            config,
        })
    }

    fn collection_url(&self) -> Result<Url, SourceError> {
        let mut url = self.config.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                SourceError::Config(format!(
                    "API URL {} cannot be used as a base",
                    self.config.base_url
                ))
            })?;
            segments.pop_if_empty().extend(["api", "v1"]);
            if let Some(namespace) = &self.config.namespace {
                segments.extend(["namespaces", namespace.as_str()]);
            }
            segments.push("secrets");
        }
        if let Some(selector) = &self.config.field_selector {
            url.query_pairs_mut().append_pair("fieldSelector", selector);
        }
        Ok(url)
    }

    async fn send(&self, url: Url) -> Result<Response, SourceError> {
        let mut request = self.client.get(url);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token.resolve()?);
        }
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiStatus>(&body)
            .ok()
            .and_then(|status| status.message)
            .unwrap_or(body);
        if status == StatusCode::GONE {
            Err(SourceError::Gone(message))
        } else {
            Err(SourceError::Status {
                status: status.as_u16(),
                message,
            })
        }
    }
}

/// List items and watch objects omit `kind` inconsistently; everything this
/// source serves is a secret.
fn into_secret_object(mut raw: Value) -> Result<WatchedObject, SourceError> {
    if let Value::Object(map) = &mut raw {
        map.entry("kind")
            .or_insert_with(|| Value::String(Secret::KIND.to_string()));
    }
    Ok(WatchedObject::from_value(raw)?)
}

/// Decodes one watch line. Objects that cannot be read are logged and skipped
/// (`Ok(None)`) so one bad record cannot stall the watch on its resource
/// version; `ERROR` lines surface as errors.
fn parse_watch_line(line: &[u8]) -> Result<Option<WatchNotification>, SourceError> {
    let event: RawWatchEvent = match serde_json::from_slice(line) {
        Ok(event) => event,
        Err(err) => {
            warn!(target: "kubewise::watcher", "skipping unreadable watch line: {err}");
            return Ok(None);
        }
    };
    let notification = match event.type_.as_str() {
        "ADDED" => into_secret_object(event.object).map(WatchNotification::Added),
        "MODIFIED" => into_secret_object(event.object).map(WatchNotification::Modified),
        "DELETED" => into_secret_object(event.object).map(WatchNotification::Deleted),
        "BOOKMARK" => WatchedObject::from_value(event.object)
            .map(|object| WatchNotification::Bookmark {
                resource_version: object.resource_version().unwrap_or_default().to_string(),
            })
            .map_err(SourceError::from),
        "ERROR" => {
            let status = ApiStatus::deserialize(&event.object).unwrap_or_default();
            let message = status.message.unwrap_or_else(|| "watch error".to_string());
            return match status.code {
                Some(410) => Err(SourceError::Gone(message)),
                code => Err(SourceError::Status {
                    status: code.unwrap_or(500),
                    message,
                }),
            };
        }
        other => Err(SourceError::InvalidObject(format!(
            "unknown watch event type {other:?}"
        ))),
    };
    match notification {
        Ok(notification) => Ok(Some(notification)),
        Err(err) => {
            warn!(
                target: "kubewise::watcher",
                kind = %event.type_,
                "skipping watch event: {err}"
            );
            Ok(None)
        }
    }
}

/// Decodes list items, dropping (and logging) any that are not readable objects.
fn decode_items(items: Vec<Value>) -> Vec<WatchedObject> {
    items
        .into_iter()
        .filter_map(|item| match into_secret_object(item) {
            Ok(object) => Some(object),
            Err(err) => {
                warn!(target: "kubewise::watcher", "skipping unreadable list item: {err}");
                None
            }
        })
        .collect()
}

#[async_trait]
impl WatchSource for KubeApiSource {
    fn namespace(&self) -> Option<&str> {
        self.config.namespace.as_deref()
    }

    async fn list(&self) -> Result<ObjectList, SourceError> {
        let response = self.send(self.collection_url()?).await?;
        let body: ListResponse = response.json().await?;
        Ok(ObjectList {
            items: decode_items(body.items),
            resource_version: body.metadata.and_then(|meta| meta.resource_version),
        })
    }

    async fn watch(
        &self,
        resource_version: Option<String>,
    ) -> Result<WatchStream, SourceError> {
        let mut url = self.collection_url()?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("watch", "1")
                .append_pair("allowWatchBookmarks", "true")
                .append_pair("timeoutSeconds", &WATCH_TIMEOUT_SECS.to_string());
            if let Some(rv) = &resource_version {
                query.append_pair("resourceVersion", rv);
            }
        }

        let response = self.send(url).await?;
        let chunks = response.bytes_stream().boxed();

        // Newline-delimited JSON; a chunk may hold several events or a partial one.
        let stream = futures::stream::unfold(
            (chunks, Vec::<u8>::new(), false),
            |(mut chunks, mut buffer, finished)| async move {
                loop {
                    if let Some(pos) = buffer.iter().position(|byte| *byte == b'\n') {
                        let line: Vec<u8> = buffer.drain(..=pos).collect();
                        if line.trim_ascii().is_empty() {
                            continue;
                        }
                        match parse_watch_line(&line).transpose() {
                            Some(item) => return Some((item, (chunks, buffer, finished))),
                            None => continue,
                        }
                    }
                    if finished {
                        return None;
                    }
                    match chunks.next().await {
                        Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                        Some(Err(err)) => {
                            return Some((Err(SourceError::Http(err)), (chunks, buffer, true)));
                        }
                        None => {
                            if buffer.trim_ascii().is_empty() {
                                return None;
                            }
                            let line = std::mem::take(&mut buffer);
                            return parse_watch_line(&line)
                                .transpose()
                                .map(|item| (item, (chunks, buffer, true)));
                        }
                    }
                }
            },
        );

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source(namespace: Option<&str>) -> KubeApiSource {
        let config = KubeApiConfig::new(Url::parse("https://10.0.0.1:443").expect("url"))
            .with_namespace(namespace.map(str::to_string))
            .with_field_selector("type=helm.sh/release.v1");
        KubeApiSource::new(config).expect("client")
    }

    #[test]
    fn collection_url_is_scoped_by_namespace() {
        assert_eq!(
            source(None).collection_url().expect("url").as_str(),
            "https://10.0.0.1/api/v1/secrets?fieldSelector=type%3Dhelm.sh%2Frelease.v1"
        );
        assert_eq!(
            source(Some("team-a")).collection_url().expect("url").path(),
            "/api/v1/namespaces/team-a/secrets"
        );
    }

    const ADDED: &[u8] = br#"{"type":"ADDED","object":{"type":"Opaque",
        "metadata":{"name":"x","namespace":"a","resourceVersion":"7"}}}"#;
    const GONE: &[u8] = br#"{"type":"ERROR","object":{"kind":"Status",
        "code":410,"message":"too old resource version"}}"#;

    #[test]
    fn watch_lines_become_notifications() {
        let added = parse_watch_line(ADDED).expect("added");
        let Some(WatchNotification::Added(object)) = added else {
            panic!("expected an Added notification");
        };
        assert_eq!(object.kind(), Some("Secret"));
        assert_eq!(object.resource_version(), Some("7"));

        let bookmark = parse_watch_line(
            br#"{"type":"BOOKMARK","object":{"metadata":{"resourceVersion":"42"}}}"#,
        )
        .expect("bookmark")
        .expect("notification");
        assert_eq!(bookmark.resource_version(), Some("42"));
    }

    #[test]
    fn expired_watch_requires_relist() {
        let err = parse_watch_line(GONE).expect_err("gone");
        assert!(err.requires_relist());
    }

    #[test]
    fn malformed_watch_lines_are_skipped() {
        let lines: [&[u8]; 3] = [
            br#"{"type":"MODIFIED","object":{"metadata":{"name":17}}}"#,
            br#"{"type":"RESYNC","object":{}}"#,
            b"not json",
        ];
        for line in lines {
            assert!(parse_watch_line(line).expect("skipped, not failed").is_none());
        }
    }

    #[test]
    fn unreadable_list_items_are_dropped() {
        let items = decode_items(vec![
            json!({ "metadata": { "name": "good", "namespace": "a" } }),
            json!({ "metadata": { "name": ["bad"] } }),
        ]);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].kind(), Some("Secret"));
    }
}
