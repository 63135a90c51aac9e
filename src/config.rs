use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Bunch realtime gateway
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "bunch-gateway", version, about = "Bunch realtime gateway")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "BUNCH_PORT", default_value = "8000")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "BUNCH_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./bunch-gateway.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "BUNCH_JSON_LOGS")]
    pub json_logs: bool,

    /// Data directory for persistent state (DB, JWT signing key)
    #[arg(long, env = "BUNCH_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Capacity of each connection's outbound frame queue
    #[arg(long, env = "BUNCH_OUTBOUND_QUEUE_SIZE", default_value = "256")]
    pub outbound_queue_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8000,
            bind_address: "0.0.0.0".to_string(),
            config: "./bunch-gateway.toml".to_string(),
            json_logs: false,
            data_dir: "./data".to_string(),
            outbound_queue_size: 256,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (BUNCH_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("BUNCH_"))
            .merge(Serialized::defaults(cli))
            .extract()
    }
}
