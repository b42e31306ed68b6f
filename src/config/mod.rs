//! Manages application configuration loaded from environment variables.
//!
//! Defines the `Config` struct holding all runtime settings and the
//! `from_env` constructor that populates it. Variables may come from a
//! `.env` file via the `dotenv` crate; every optional setting has a default.

use std::env;
use std::fmt::Display;
use std::str::FromStr;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};

/// Runtime configuration, typically loaded from `POSTBOX_*` environment
/// variables via [`Config::from_env`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Canonical server domain; recipients at this domain are local.
    /// (Required: `POSTBOX_DOMAIN`)
    pub domain_name: String,

    /// The IP address the SMTP server listens on. (Optional: `POSTBOX_BIND_ADDRESS`, default "0.0.0.0")
    pub bind_address: String,

    /// The SMTP listening port. (Optional: `POSTBOX_PORT`, default 2525)
    pub port: u16,

    /// The IP address the health check server listens on. (Optional: `POSTBOX_HEALTH_BIND_ADDRESS`, default "0.0.0.0")
    pub health_bind_address: String,

    /// The health check port. (Optional: `POSTBOX_HEALTH_PORT`, default 8080)
    pub health_port: u16,

    /// Hard cap on concurrently admitted sessions. (Optional: `POSTBOX_MAX_SESSIONS`, default 32768)
    pub max_sessions: usize,

    /// Per-session soft-error budget. (Optional: `POSTBOX_MAX_ERRORS`, default 3)
    pub max_errors: usize,

    /// Per-message body byte cap. (Optional: `POSTBOX_MAX_BUFFER_SIZE`, default 6553600)
    pub max_buffer_size: usize,

    /// Per-envelope recipient cap. (Optional: `POSTBOX_MAX_RECIPIENTS`, default 256)
    pub max_recipients: usize,

    /// Whether remote-to-remote mail may be queued for delayed delivery.
    /// (Optional: `POSTBOX_ALLOW_DELAY`, default false)
    pub allow_delay: bool,

    /// Tail of the 220 greeting banner. (Optional: `POSTBOX_SERVICE_INFO`)
    pub service_info: String,

    /// Local mailboxes, comma-separated RFC 5322 addresses.
    /// (Optional: `POSTBOX_MAILBOXES`)
    pub mailboxes: Vec<String>,

    /// PEM certificate chain for STARTTLS. (Optional: `POSTBOX_TLS_CERT`)
    pub tls_cert_path: Option<String>,

    /// PEM private key for STARTTLS. (Optional: `POSTBOX_TLS_KEY`)
    pub tls_key_path: Option<String>,

    /// Generate a self-signed certificate for STARTTLS instead of loading
    /// one. (Optional: `POSTBOX_TLS_SELF_SIGNED`, default false)
    pub tls_self_signed: bool,

    /// Seconds without input before a session is closed with 421.
    /// (Optional: `POSTBOX_IDLE_TIMEOUT`, default 300)
    pub idle_timeout_secs: u64,

    /// Seconds sessions get to drain on shutdown before being cancelled.
    /// (Optional: `POSTBOX_SHUTDOWN_GRACE`, default 5)
    pub shutdown_grace_secs: u64,
}

impl Config {
    /// Loads configuration from `POSTBOX_*` environment variables, reading a
    /// `.env` file first if one is present.
    ///
    /// # Errors
    ///
    /// Returns an `Err` if `POSTBOX_DOMAIN` is missing or empty, or if a
    /// numeric or boolean variable is set but unparseable.
    pub fn from_env() -> Result<Self> {
        // Load variables from a .env file, if it exists. Ignore errors.
        let _ = dotenv::dotenv();

        let domain_name = match env::var("POSTBOX_DOMAIN") {
            Ok(val) if !val.trim().is_empty() => val.trim().to_string(),
            Ok(_) => {
                let err_msg = "POSTBOX_DOMAIN cannot be empty";
                log::error!("{}", err_msg);
                bail!(err_msg);
            }
            Err(e) => {
                let err_msg = "POSTBOX_DOMAIN environment variable must be set";
                log::error!("{}: {}", err_msg, e);
                return Err(anyhow!(e).context(err_msg));
            }
        };

        let service_info = env::var("POSTBOX_SERVICE_INFO")
            .unwrap_or_else(|_| format!("{} ESMTP service ready", domain_name));

        let mailboxes: Vec<String> = env::var("POSTBOX_MAILBOXES")
            .map(|val| {
                val.split(',')
                    .map(|mailbox| mailbox.trim().to_string())
                    .filter(|mailbox| !mailbox.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let config = Config {
            domain_name,
            bind_address: env_or("POSTBOX_BIND_ADDRESS", "0.0.0.0"),
            port: env_parse("POSTBOX_PORT", 2525)?,
            health_bind_address: env_or("POSTBOX_HEALTH_BIND_ADDRESS", "0.0.0.0"),
            health_port: env_parse("POSTBOX_HEALTH_PORT", 8080)?,
            max_sessions: env_parse("POSTBOX_MAX_SESSIONS", 32768)?,
            max_errors: env_parse("POSTBOX_MAX_ERRORS", 3)?,
            max_buffer_size: env_parse("POSTBOX_MAX_BUFFER_SIZE", 6_553_600)?,
            max_recipients: env_parse("POSTBOX_MAX_RECIPIENTS", 256)?,
            allow_delay: env_parse("POSTBOX_ALLOW_DELAY", false)?,
            service_info,
            mailboxes,
            tls_cert_path: env::var("POSTBOX_TLS_CERT").ok(),
            tls_key_path: env::var("POSTBOX_TLS_KEY").ok(),
            tls_self_signed: env_parse("POSTBOX_TLS_SELF_SIGNED", false)?,
            idle_timeout_secs: env_parse("POSTBOX_IDLE_TIMEOUT", 300)?,
            shutdown_grace_secs: env_parse("POSTBOX_SHUTDOWN_GRACE", 5)?,
        };

        match serde_json::to_string(&config) {
            Ok(json) => log::debug!("config: {}", json),
            Err(e) => log::debug!("config not serializable: {}", e),
        }
        Ok(config)
    }
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(name) {
        Ok(val) => val
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow!("{} ('{}') is not valid: {}", name, val, e)),
        Err(_) => Ok(default),
    }
}
