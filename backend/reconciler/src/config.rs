//! Application configuration loaded from environment variables.

use crate::errors::{ReconcilerError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Escrow node JSON-RPC endpoint
    pub rpc_url: String,
    /// The escrow contract address
    pub escrow_contract: String,
    /// The USDC token contract address
    pub token_contract: String,
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// How often (in seconds) the background sweep re-reconciles campaigns
    pub sweep_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            rpc_url: env_var("RPC_URL").unwrap_or_else(|_| "http://localhost:8545".to_string()),
            escrow_contract: env_var("ESCROW_CONTRACT").map_err(|_| {
                ReconcilerError::Config("ESCROW_CONTRACT environment variable is required".to_string())
            })?,
            token_contract: env_var("TOKEN_CONTRACT").map_err(|_| {
                ReconcilerError::Config("TOKEN_CONTRACT environment variable is required".to_string())
            })?,
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./campaigns.db".to_string()),
            api_port: env_var("API_PORT")
                .unwrap_or_else(|_| "3001".to_string())
                .parse()
                .map_err(|_| ReconcilerError::Config("Invalid API_PORT".to_string()))?,
            sweep_interval_secs: env_var("SWEEP_INTERVAL_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .map_err(|_| ReconcilerError::Config("Invalid SWEEP_INTERVAL_SECS".to_string()))?,
        })
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| ReconcilerError::Config(format!("Missing env var: {key}")))
}
