//! Scripted release activity against an in-memory cluster.

use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{SecondsFormat, Utc};
use kubewise_core::{DEFAULT_MARKER_TYPE, MemoryCluster, SourceError};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEMO_NAMESPACE: &str = "demo";

/// Helm release secret for `name` at `version`, payload stored as plain JSON.
fn release_record(name: &str, version: u32, status: &str, created: Option<String>) -> Value {
    let release = json!({
        "name": name,
        "namespace": DEMO_NAMESPACE,
        "version": version,
        "info": { "status": status, "description": format!("{name} {status}") },
        "chart": {
            "metadata": {
                "name": name,
                "version": format!("1.{version}.0"),
                "appVersion": format!("{version}.0")
            }
        }
    });
    let helm_payload = STANDARD.encode(release.to_string());
    let mut metadata = json!({
        "name": format!("sh.helm.release.v1.{name}.v{version}"),
        "namespace": DEMO_NAMESPACE,
        "labels": {
            "owner": "helm",
            "name": name,
            "status": status,
            "version": version.to_string()
        }
    });
    if let Some(created) = created {
        metadata["creationTimestamp"] = Value::String(created);
    }
    json!({
        "kind": "Secret",
        "metadata": metadata,
        "type": DEFAULT_MARKER_TYPE,
        "data": { "release": STANDARD.encode(helm_payload) }
    })
}

/// Records that exist before the controller starts.
pub fn seed(cluster: &MemoryCluster) -> Result<(), SourceError> {
    let an_hour_ago = (Utc::now() - chrono::Duration::hours(1))
        .to_rfc3339_opts(SecondsFormat::Secs, true);
    cluster.apply(release_record("ingress-nginx", 1, "deployed", Some(an_hour_ago)))?;
    Ok(())
}

/// Installs, upgrades and finally uninstalls a release, one step per `interval`.
pub async fn play(cluster: MemoryCluster, interval: Duration, shutdown: CancellationToken) {
    let steps: [(&str, fn(&MemoryCluster) -> Result<(), SourceError>); 3] = [
        ("install podinfo", |cluster| {
            cluster.apply(release_record("podinfo", 1, "deployed", None))?;
            Ok(())
        }),
        ("upgrade podinfo", |cluster| {
            cluster.apply(release_record("podinfo", 2, "deployed", None))?;
            cluster.apply(release_record("podinfo", 1, "superseded", None))?;
            Ok(())
        }),
        ("uninstall podinfo", |cluster| {
            cluster.apply(release_record("podinfo", 2, "uninstalling", None))?;
            cluster.delete(Some(DEMO_NAMESPACE), "sh.helm.release.v1.podinfo.v2");
            cluster.delete(Some(DEMO_NAMESPACE), "sh.helm.release.v1.podinfo.v1");
            Ok(())
        }),
    ];

    for (label, step) in steps {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        info!(step = label, "demo");
        if let Err(err) = step(&cluster) {
            warn!(step = label, "demo step failed: {err}");
        }
    }
    info!("demo script finished; press Ctrl-C to exit");
}
