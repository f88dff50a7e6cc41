use std::{env, net::SocketAddr, time::Duration};

use axum::http::HeaderValue;
use thiserror::Error;

pub const DEFAULT_BIND_PORT: u16 = 3000;
pub const DEFAULT_KEEPALIVE_SECS: u64 = 15;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub bind_port: u16,
    pub allowed_origins: AllowedOrigins,
    pub stream_keep_alive: Duration,
}

/// Origins permitted by the CORS layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedOrigins {
    Any,
    List(Vec<HeaderValue>),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("BIND_PORT must be a valid u16")]
    InvalidPort,
    #[error("MCP_SSE_KEEPALIVE_SECS must be a positive integer")]
    InvalidKeepAlive,
    #[error("MCP_ALLOWED_ORIGINS contains an invalid origin: {0}")]
    InvalidOrigin(String),
    #[error("invalid bind address or port")]
    InvalidSocket,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| env::var(key).ok())
    }

    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind_addr = lookup("BIND_ADDR")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let bind_port = lookup("BIND_PORT")
            .map(|value| {
                value
                    .trim()
                    .parse::<u16>()
                    .map_err(|_| ConfigError::InvalidPort)
            })
            .transpose()?
            .unwrap_or(DEFAULT_BIND_PORT);
        let keep_alive_secs = lookup("MCP_SSE_KEEPALIVE_SECS")
            .map(|value| {
                value
                    .trim()
                    .parse::<u64>()
                    .ok()
                    .filter(|secs| *secs > 0)
                    .ok_or(ConfigError::InvalidKeepAlive)
            })
            .transpose()?
            .unwrap_or(DEFAULT_KEEPALIVE_SECS);
        let allowed_origins = parse_allowed_origins(lookup("MCP_ALLOWED_ORIGINS").as_deref())?;

        let config = Self {
            bind_addr,
            bind_port,
            allowed_origins,
            stream_keep_alive: Duration::from_secs(keep_alive_secs),
        };

        let _ = config.bind_socket()?;
        Ok(config)
    }

    pub fn bind_socket(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_addr, self.bind_port)
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidSocket)
    }
}

fn parse_allowed_origins(raw: Option<&str>) -> Result<AllowedOrigins, ConfigError> {
    let origins = raw
        .unwrap_or("*")
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .collect::<Vec<_>>();

    if origins.is_empty() || origins.contains(&"*") {
        return Ok(AllowedOrigins::Any);
    }

    origins
        .into_iter()
        .map(|origin| {
            HeaderValue::from_str(origin).map_err(|_| ConfigError::InvalidOrigin(origin.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(AllowedOrigins::List)
}
