use config::{Config, ConfigError, Environment};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub source: ClusterSettings,
    pub target: ClusterSettings,
    pub replicator: ReplicatorSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterSettings {
    pub contact_points: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplicatorSettings {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_page_size")]
    pub page_size: i32,
    #[serde(default = "default_cdc_enabled")]
    pub cdc_enabled: bool,
    #[serde(default = "default_ledger_keyspace")]
    pub ledger_keyspace: String,
}

fn default_workers() -> usize {
    8
}

fn default_page_size() -> i32 {
    5000
}

fn default_cdc_enabled() -> bool {
    false
}

fn default_ledger_keyspace() -> String {
    "replicator".to_string()
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(Environment::default().separator("__"))
            .set_default("source.contact_points", vec!["127.0.0.1:9042"])?
            .set_default("target.contact_points", vec!["127.0.0.1:9042"])?
            .set_default("replicator.workers", 8)?
            .build()?;

        config.try_deserialize()
    }
}
