//! YAML + environment configuration, following `SG60-hello-rust/src/settings.rs`'s
//! figment-based pattern, extended with the `yaml` feature (the original used only
//! toml+env) since original spec §6 mandates YAML config files.

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::Deserialize;
use std::path::Path;

use crate::{auth::AuthConfig, error::FabricError};

#[derive(Debug, Clone, Deserialize)]
pub struct CommonSettings {
    /// e.g. "0.0.0.0:8080"
    pub http_listen_address: String,
    /// KV-store (etcd-like) endpoint, e.g. "http://127.0.0.1:2379"
    pub kv_store_endpoint: String,
    /// in-memory (Redis-like) store address, e.g. "127.0.0.1:6379"
    pub presence_store_address: String,
    pub auth: AuthConfig,
    #[serde(default = "default_logger_level")]
    pub logger_level: String,
}

fn default_logger_level() -> String {
    "info".to_owned()
}

impl CommonSettings {
    pub fn load(config_file: impl AsRef<Path>) -> Result<Self, FabricError> {
        Figment::new()
            .merge(Yaml::file(config_file.as_ref()))
            .merge(Env::prefixed("APP_").split("__"))
            .extract()
            .map_err(|e| FabricError::InvalidConfig(format!("loading configuration: {e}")))
    }
}

/// Event-server-only settings layered on top of `CommonSettings`.
#[derive(Debug, Clone, Deserialize)]
pub struct EventServerSettings {
    #[serde(flatten)]
    pub common: CommonSettings,
    pub server_id: String,
    pub grpc_listen_address: String,
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_heartbeat_ttl_secs")]
    pub heartbeat_ttl_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

fn default_lease_ttl_secs() -> u64 {
    15
}

fn default_refresh_interval_secs() -> u64 {
    15
}

fn default_heartbeat_ttl_secs() -> u64 {
    20
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}

impl EventServerSettings {
    pub fn load(config_file: impl AsRef<Path>) -> Result<Self, FabricError> {
        Figment::new()
            .merge(Yaml::file(config_file.as_ref()))
            .merge(Env::prefixed("APP_").split("__"))
            .extract()
            .map_err(|e| FabricError::InvalidConfig(format!("loading configuration: {e}")))
    }
}

/// Gateway-only settings layered on top of `CommonSettings`.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySettings {
    #[serde(flatten)]
    pub common: CommonSettings,
    #[serde(default = "default_active_user_ttl_secs")]
    pub active_user_ttl_secs: u64,
}

fn default_active_user_ttl_secs() -> u64 {
    30
}

impl GatewaySettings {
    pub fn load(config_file: impl AsRef<Path>) -> Result<Self, FabricError> {
        Figment::new()
            .merge(Yaml::file(config_file.as_ref()))
            .merge(Env::prefixed("APP_").split("__"))
            .extract()
            .map_err(|e| FabricError::InvalidConfig(format!("loading configuration: {e}")))
    }
}
