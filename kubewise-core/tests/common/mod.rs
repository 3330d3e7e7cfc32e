#![allow(dead_code)]

use std::{io::Write, sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, SecondsFormat, Utc};
use flate2::{Compression, write::GzEncoder};
use kubewise_core::{
    ControllerEvent, DEFAULT_MARKER_TYPE, NotificationHandler, NotifyError, Release,
    ReleaseAction, ReleaseEvent,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::broadcast;

/// A Helm storage secret as the API serves it.
pub fn release_secret(
    namespace: &str,
    name: &str,
    version: u32,
    status: &str,
    created: DateTime<Utc>,
) -> Value {
    let release = json!({
        "name": name,
        "namespace": namespace,
        "version": version,
        "info": { "status": status },
        "chart": { "metadata": { "name": name, "version": "1.0.0" } }
    });
    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(release.to_string().as_bytes()).expect("gzip write");
    let helm = STANDARD.encode(gz.finish().expect("gzip finish"));

    json!({
        "kind": "Secret",
        "metadata": {
            "name": format!("sh.helm.release.v1.{name}.v{version}"),
            "namespace": namespace,
            "creationTimestamp": created.to_rfc3339_opts(SecondsFormat::Secs, true),
            "labels": { "owner": "helm", "name": name, "version": version.to_string() }
        },
        "type": DEFAULT_MARKER_TYPE,
        "data": { "release": STANDARD.encode(helm) }
    })
}

pub fn secret_name(name: &str, version: u32) -> String {
    format!("sh.helm.release.v1.{name}.v{version}")
}

/// Handler that remembers what it was asked to deliver.
pub struct Recorder {
    events: Mutex<Vec<(String, ReleaseAction)>>,
    startups: Mutex<Vec<Vec<Release>>>,
    failure: Option<NotifyError>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            startups: Mutex::new(Vec::new()),
            failure: None,
        })
    }

    pub fn failing(error: NotifyError) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            startups: Mutex::new(Vec::new()),
            failure: Some(error),
        })
    }

    pub fn events(&self) -> Vec<(String, ReleaseAction)> {
        self.events.lock().clone()
    }

    pub fn startups(&self) -> Vec<Vec<Release>> {
        self.startups.lock().clone()
    }
}

#[async_trait]
impl NotificationHandler for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn handle_event(&self, event: &ReleaseEvent) -> Result<(), NotifyError> {
        self.events
            .lock()
            .push((event.release.name.clone(), event.action));
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn handle_server_startup(&self, releases: &[Release]) -> Result<(), NotifyError> {
        self.startups.lock().push(releases.to_vec());
        Ok(())
    }
}

/// Receives the next controller event, failing the test after a few seconds.
pub async fn next_event(rx: &mut broadcast::Receiver<ControllerEvent>) -> ControllerEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("controller event in time")
        .expect("event bus open")
}

/// Collects `n` controller events.
pub async fn next_events(
    rx: &mut broadcast::Receiver<ControllerEvent>,
    n: usize,
) -> Vec<ControllerEvent> {
    let mut events = Vec::with_capacity(n);
    for _ in 0..n {
        events.push(next_event(rx).await);
    }
    events
}
