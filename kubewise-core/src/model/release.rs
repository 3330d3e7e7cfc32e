use std::{fmt, io::Read};

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::object::Secret;

/// Field of a Helm storage secret holding the encoded release.
pub const RELEASE_DATA_FIELD: &str = "release";

const GZIP_MAGIC: [u8; 3] = [0x1f, 0x8b, 0x08];

/// Lifecycle state Helm records on every release revision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseStatus {
    Deployed,
    Uninstalled,
    Superseded,
    Failed,
    Uninstalling,
    PendingInstall,
    PendingUpgrade,
    PendingRollback,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ReleaseStatus::Deployed => "deployed",
            ReleaseStatus::Uninstalled => "uninstalled",
            ReleaseStatus::Superseded => "superseded",
            ReleaseStatus::Failed => "failed",
            ReleaseStatus::Uninstalling => "uninstalling",
            ReleaseStatus::PendingInstall => "pending-install",
            ReleaseStatus::PendingUpgrade => "pending-upgrade",
            ReleaseStatus::PendingRollback => "pending-rollback",
            ReleaseStatus::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartInfo {
    #[serde(default)]
    pub metadata: Option<ChartMetadata>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub status: ReleaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_deployed: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_deployed: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Default for ReleaseInfo {
    fn default() -> Self {
        Self {
            status: ReleaseStatus::Unknown,
            first_deployed: None,
            last_deployed: None,
            description: None,
        }
    }
}

/// Decoded Helm release revision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    pub version: u32,
    #[serde(default)]
    pub info: ReleaseInfo,
    #[serde(default)]
    pub chart: ChartInfo,
}

#[derive(Error, Debug)]
pub enum ReleaseDecodeError {
    #[error("secret has no `{RELEASE_DATA_FIELD}` field")]
    MissingPayload,
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("failed to decompress payload: {0}")]
    Gzip(#[from] std::io::Error),
    #[error("invalid release document: {0}")]
    Json(#[from] serde_json::Error),
}

impl Release {
    /// Decodes the release stored in a Helm storage secret.
    pub fn from_secret(secret: &Secret) -> Result<Self, ReleaseDecodeError> {
        let payload = secret
            .decoded(RELEASE_DATA_FIELD)
            .ok_or(ReleaseDecodeError::MissingPayload)??;
        Self::decode(&payload)
    }

    /// Helm stores `base64(gzip(json))`, with gzip optional for old records.
    pub fn decode(payload: &[u8]) -> Result<Self, ReleaseDecodeError> {
        let compressed = STANDARD.decode(payload.trim_ascii())?;
        if compressed.starts_with(&GZIP_MAGIC) {
            let mut json = Vec::with_capacity(compressed.len() * 4);
            GzDecoder::new(compressed.as_slice()).read_to_end(&mut json)?;
            Ok(serde_json::from_slice(&json)?)
        } else {
            Ok(serde_json::from_slice(&compressed)?)
        }
    }

    pub fn status(&self) -> ReleaseStatus {
        self.info.status
    }

    pub fn chart_name(&self) -> Option<&str> {
        self.chart.metadata.as_ref().map(|meta| meta.name.as_str())
    }

    pub fn chart_version(&self) -> Option<&str> {
        self.chart.metadata.as_ref().map(|meta| meta.version.as_str())
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use base64::{Engine, engine::general_purpose::STANDARD};

    #[test]
    fn decodes_gzipped_release() {
        let payload = helm_payload(&release_json("web", "team-a", 3, "deployed"));
        let release = Release::decode(payload.as_bytes()).expect("decode");

        assert_eq!(release.name, "web");
        assert_eq!(release.namespace, "team-a");
        assert_eq!(release.version, 3);
        assert_eq!(release.status(), ReleaseStatus::Deployed);
        assert_eq!(release.chart_name(), Some("nginx"));
        assert_eq!(release.chart_version(), Some("15.1.0"));
    }

    #[test]
    fn decodes_plain_json_release() {
        let body = release_json("api", "default", 1, "pending-install").to_string();
        let payload = STANDARD.encode(body);
        let release = Release::decode(payload.as_bytes()).expect("decode");
        assert_eq!(release.status(), ReleaseStatus::PendingInstall);
    }

    #[test]
    fn unrecognised_status_maps_to_unknown() {
        let body = release_json("api", "default", 1, "something-new").to_string();
        let release = Release::decode(STANDARD.encode(body).as_bytes()).expect("decode");
        assert_eq!(release.status(), ReleaseStatus::Unknown);
    }

    #[test]
    fn corrupt_base64_is_rejected() {
        let err = Release::decode(b"%%%not-base64%%%").expect_err("corrupt");
        assert!(matches!(err, ReleaseDecodeError::Base64(_)));
    }
}
