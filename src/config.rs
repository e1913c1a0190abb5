use bigdecimal::BigDecimal;
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::str::FromStr;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server_port: u16,
    pub database_url: String,
    pub worker_count: usize,
    /// Credit limit assigned to cards created lazily on first authorization.
    pub default_credit_limit: BigDecimal,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok(); // Load .env file if present

        Ok(Config {
            server_port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()?,
            database_url: env::var("DATABASE_URL")?,
            worker_count: env::var("WORKER_COUNT")
                .unwrap_or_else(|_| "4".to_string())
                .parse()?,
            default_credit_limit: parse_credit_limit(
                &env::var("DEFAULT_CREDIT_LIMIT").unwrap_or_else(|_| "10000".to_string()),
            )?,
        })
    }
}

fn parse_credit_limit(raw: &str) -> anyhow::Result<BigDecimal> {
    let limit = BigDecimal::from_str(raw.trim())
        .map_err(|e| anyhow::anyhow!("DEFAULT_CREDIT_LIMIT is not a valid decimal: {}", e))?;

    if limit <= BigDecimal::from(0) {
        anyhow::bail!("DEFAULT_CREDIT_LIMIT must be greater than zero");
    }

    Ok(limit)
}
