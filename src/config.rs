use std::{env, net::SocketAddr, time::Duration};

use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub api_token: String,
    pub bind_addr: String,
    pub bind_port: u16,
    pub worker_command: String,
    pub worker_args: Vec<String>,
    pub invoke_timeout: Duration,
    pub max_in_flight: usize,
    pub max_restarts: u32,
    pub restart_window: Duration,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("BRIDGE_API_TOKEN is required and must not be empty")]
    MissingApiToken,
    #[error("WORKER_COMMAND is required and must not be empty")]
    MissingWorkerCommand,
    #[error("BIND_PORT must be a valid u16")]
    InvalidPort,
    #[error("{var} must be a positive integer")]
    InvalidNumber { var: &'static str },
    #[error("MAX_RESTARTS must be a non-negative integer")]
    InvalidMaxRestarts,
    #[error("invalid bind address or port")]
    InvalidSocket,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_token = non_empty_var("BRIDGE_API_TOKEN").ok_or(ConfigError::MissingApiToken)?;
        let worker_command =
            non_empty_var("WORKER_COMMAND").ok_or(ConfigError::MissingWorkerCommand)?;
        let worker_args = env::var("WORKER_ARGS")
            .map(|value| {
                value
                    .split_whitespace()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1".to_string());
        let bind_port = env::var("BIND_PORT")
            .ok()
            .map(|value| value.parse::<u16>().map_err(|_| ConfigError::InvalidPort))
            .transpose()?
            .unwrap_or(8080);

        let max_restarts = env::var("MAX_RESTARTS")
            .ok()
            .map(|value| {
                value
                    .parse::<u32>()
                    .map_err(|_| ConfigError::InvalidMaxRestarts)
            })
            .transpose()?
            .unwrap_or(3);

        let config = Self {
            api_token,
            bind_addr,
            bind_port,
            worker_command,
            worker_args,
            invoke_timeout: Duration::from_millis(positive_var("INVOKE_TIMEOUT_MS", 30_000)?),
            max_in_flight: positive_var("MAX_IN_FLIGHT", 32)? as usize,
            max_restarts,
            restart_window: Duration::from_secs(positive_var("RESTART_WINDOW_SECS", 60)?),
            shutdown_grace: Duration::from_millis(positive_var("SHUTDOWN_GRACE_MS", 5_000)?),
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

fn non_empty_var(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn positive_var(var: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(var) {
        Err(_) => Ok(default),
        Ok(value) => value
            .parse::<u64>()
            .ok()
            .filter(|parsed| *parsed > 0)
            .ok_or(ConfigError::InvalidNumber { var }),
    }
}
