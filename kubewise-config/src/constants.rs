use std::path::PathBuf;

/// Files tried, in order, when no configuration path is given.
pub const DEFAULT_CONFIG_LOCATIONS: &[&str] = &["kubewise.toml", "config/kubewise.toml"];

pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

pub fn service_account_token_path() -> PathBuf {
    PathBuf::from(SERVICE_ACCOUNT_DIR).join("token")
}

pub fn service_account_ca_path() -> PathBuf {
    PathBuf::from(SERVICE_ACCOUNT_DIR).join("ca.crt")
}

pub const DEFAULT_KUBERNETES_PORT: u16 = 443;
