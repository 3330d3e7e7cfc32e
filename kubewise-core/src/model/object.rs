use std::{collections::BTreeMap, fmt};

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

/// Subset of the cluster object metadata the controller relies on.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Stable identity of a watched object: `namespace/name`, or just `name`
/// for cluster-scoped objects.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey(String);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyExtractionError {
    #[error("object has no name")]
    MissingName,
    #[error("object name {0:?} contains a '/'")]
    InvalidName(String),
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        match namespace {
            Some(ns) if !ns.is_empty() => Self(format!("{ns}/{name}")),
            _ => Self(name.to_string()),
        }
    }

    pub fn from_meta(meta: &ObjectMeta) -> Result<Self, KeyExtractionError> {
        if meta.name.is_empty() {
            return Err(KeyExtractionError::MissingName);
        }
        if meta.name.contains('/') {
            return Err(KeyExtractionError::InvalidName(meta.name.clone()));
        }
        Ok(Self::new(meta.namespace.as_deref(), &meta.name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn namespace(&self) -> Option<&str> {
        self.0.split_once('/').map(|(ns, _)| ns)
    }

    pub fn name(&self) -> &str {
        self.0.split_once('/').map_or(self.0.as_str(), |(_, name)| name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Untyped record as delivered by the watch source.
///
/// The metadata is parsed eagerly because every stage needs it; the rest of
/// the document stays raw until something casts it (see [`Secret`]).
#[derive(Clone, Debug, PartialEq)]
pub struct WatchedObject {
    pub metadata: ObjectMeta,
    pub raw: Value,
}

impl WatchedObject {
    pub fn from_value(raw: Value) -> Result<Self, serde_json::Error> {
        let metadata = match raw.get("metadata") {
            Some(meta) => ObjectMeta::deserialize(meta)?,
            None => ObjectMeta::default(),
        };
        Ok(Self { metadata, raw })
    }

    pub fn key(&self) -> Result<ObjectKey, KeyExtractionError> {
        ObjectKey::from_meta(&self.metadata)
    }

    pub fn kind(&self) -> Option<&str> {
        self.raw.get("kind").and_then(Value::as_str)
    }

    /// The `type` discriminator of the record (empty when absent).
    pub fn subtype(&self) -> &str {
        self.raw.get("type").and_then(Value::as_str).unwrap_or_default()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.metadata.namespace.as_deref()
    }

    pub fn creation_timestamp(&self) -> Option<DateTime<Utc>> {
        self.metadata.creation_timestamp
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.metadata.resource_version.as_deref()
    }
}

impl Serialize for WatchedObject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.raw.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for WatchedObject {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        Self::from_value(raw).map_err(serde::de::Error::custom)
    }
}

/// Raised when a cached record cannot be viewed as the expected shape.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("expected a {expected} object, found {found}")]
pub struct TypeMismatch {
    pub expected: &'static str,
    pub found: String,
}

/// Typed view over a `v1/Secret`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Secret {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(rename = "type", default)]
    pub type_: String,
    /// Values are base64 encoded, exactly as served by the API.
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl Secret {
    pub const KIND: &'static str = "Secret";

    pub fn from_object(object: &WatchedObject) -> Result<Self, TypeMismatch> {
        // List responses omit `kind` on their items; absence is not a mismatch.
        if let Some(kind) = object.kind()
            && kind != Self::KIND
        {
            return Err(TypeMismatch {
                expected: Self::KIND,
                found: kind.to_string(),
            });
        }

        Secret::deserialize(&object.raw).map_err(|err| TypeMismatch {
            expected: Self::KIND,
            found: format!("malformed document ({err})"),
        })
    }

    /// Returns the decoded bytes for `field`, if present.
    pub fn decoded(
        &self,
        field: &str,
    ) -> Option<Result<Vec<u8>, base64::DecodeError>> {
        self.data.get(field).map(|value| STANDARD.decode(value.trim()))
    }
}
