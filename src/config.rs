//! Configuration loading for the gallery service.

use config::{Config as ConfigBuilder, Environment, File};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    pub api: ApiConfig,
    pub kv: KvConfig,
    pub images: ImagesConfig,
    pub delivery: DeliveryConfig,
    pub database: DatabaseConfig,
    pub comments: CommentsConfig,
    #[serde(default)]
    pub access: AccessConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Remote key-value namespace holding the collection document,
/// the site auth secrets and the comment rate-limit windows.
#[derive(Debug, Clone, Deserialize)]
pub struct KvConfig {
    #[serde(default = "default_cloud_api_base")]
    pub api_base: String,
    pub account_id: String,
    pub namespace_id: String,
    pub api_token: String,
    #[serde(default = "default_kv_timeout_secs")]
    pub timeout_secs: u64,
}

/// Remote image service holding the actual asset bytes.
#[derive(Debug, Clone, Deserialize)]
pub struct ImagesConfig {
    #[serde(default = "default_cloud_api_base")]
    pub api_base: String,
    #[serde(default = "default_batch_base")]
    pub batch_base: String,
    pub account_id: String,
    pub api_token: String,
    #[serde(default = "default_images_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_delete_concurrency")]
    pub delete_concurrency: usize,
}

/// Signed delivery URL issuing.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_delivery_base")]
    pub base: String,
    pub account_hash: String,
    pub signing_key: String,
    #[serde(default = "default_url_expiry_secs")]
    pub url_expiry_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommentsConfig {
    #[serde(default = "default_comment_limit")]
    pub max_per_window: u32,
    #[serde(default = "default_comment_window_secs")]
    pub window_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccessConfig {
    /// When set and no site secrets exist yet, this key is stored as the
    /// initial secret on startup.
    #[serde(default)]
    pub bootstrap_admin_key: Option<String>,
}

fn default_service_name() -> String {
    "atelier".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_cloud_api_base() -> String {
    "https://api.cloudflare.com/client/v4".to_string()
}

fn default_batch_base() -> String {
    "https://batch.imagedelivery.net".to_string()
}

fn default_delivery_base() -> String {
    "https://imagedelivery.net".to_string()
}

fn default_url_expiry_secs() -> u64 {
    86_400
}

fn default_kv_timeout_secs() -> u64 {
    30
}

fn default_images_timeout_secs() -> u64 {
    60
}

fn default_delete_concurrency() -> usize {
    5
}

fn default_database_url() -> String {
    "sqlite:atelier.db?mode=rwc".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_comment_limit() -> u32 {
    5
}

fn default_comment_window_secs() -> u64 {
    60
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = ConfigBuilder::builder()
            // Start with default values
            .set_default("service.name", "atelier")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .set_default("api.host", "0.0.0.0")?
            .set_default("api.port", 8080)?
            .set_default("comments.max_per_window", 5)?
            .set_default("comments.window_secs", 60)?
            .set_default("database.url", default_database_url())?
            // Add config file if present
            .add_source(File::with_name("config/gallery").required(false))
            .add_source(File::with_name("/etc/atelier/gallery").required(false))
            // Override with environment variables
            // GALLERY__KV__ACCOUNT_ID -> kv.account_id
            .add_source(
                Environment::with_prefix("GALLERY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

}

impl KvConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ImagesConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl CommentsConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}
