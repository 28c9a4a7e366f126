//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration files (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub instance: InstanceConfig,
    pub federation: FederationConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "blogs.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://blogs.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Instance-wide switches
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    /// Software name reported by NodeInfo and shown to operators
    pub site_name: String,
    pub description: String,
    /// Single-blog mode: every actor endpoint routes to collection 1
    pub single_user: bool,
    /// Master switch for everything ActivityPub
    pub federation: bool,
    /// Private instances never push activities out
    pub private: bool,
}

/// Federation tuning
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Maximum number of inboxes posted to at the same time per activity
    pub delivery_concurrency: usize,
    /// Total timeout for one outbound request
    pub http_timeout_seconds: u64,
    /// Delay before an Accept is posted back to a follower
    pub accept_delay_ms: u64,
    /// RSA modulus size for newly generated blog keys
    pub key_bits: usize,
    /// Items per outbox/followers page
    pub page_size: i64,
    /// Permit outbound requests to loopback and private networks
    pub allow_private_hosts: bool,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            delivery_concurrency: 4,
            http_timeout_seconds: 15,
            accept_delay_ms: 2000,
            key_bits: 2048,
            page_size: 10,
            allow_private_hosts: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (INKFED__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let defaults = FederationConfig::default();

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("server.domain", "localhost")?
            .set_default("database.path", "data/inkfed.db")?
            .set_default("instance.site_name", env!("CARGO_PKG_NAME"))?
            .set_default("instance.description", "")?
            .set_default("instance.single_user", false)?
            .set_default("instance.federation", true)?
            .set_default("instance.private", false)?
            .set_default(
                "federation.delivery_concurrency",
                defaults.delivery_concurrency as i64,
            )?
            .set_default(
                "federation.http_timeout_seconds",
                defaults.http_timeout_seconds,
            )?
            .set_default("federation.accept_delay_ms", defaults.accept_delay_ms)?
            .set_default("federation.key_bits", defaults.key_bits as i64)?
            .set_default("federation.page_size", defaults.page_size)?
            .set_default("federation.allow_private_hosts", false)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (INKFED__*)
            .add_source(
                Environment::with_prefix("INKFED")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    /// User-Agent sent with every outbound federation request.
    pub fn user_agent(&self) -> String {
        format!(
            "{}/{} ({})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            self.server.domain
        )
    }

    pub fn validate(&self) -> Result<(), crate::error::AppError> {
        const MIN_KEY_BITS: usize = 1024;

        let protocol = self.server.protocol.to_ascii_lowercase();
        if protocol != "http" && protocol != "https" {
            return Err(crate::error::AppError::Config(format!(
                "server.protocol must be http or https, got {}",
                self.server.protocol
            )));
        }

        if self.server.domain.trim().is_empty() {
            return Err(crate::error::AppError::Config(
                "server.domain must not be empty".to_string(),
            ));
        }

        if self.federation.delivery_concurrency == 0 {
            return Err(crate::error::AppError::Config(
                "federation.delivery_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.federation.page_size <= 0 {
            return Err(crate::error::AppError::Config(
                "federation.page_size must be greater than 0".to_string(),
            ));
        }

        if self.federation.key_bits < MIN_KEY_BITS {
            return Err(crate::error::AppError::Config(format!(
                "federation.key_bits must be at least {}",
                MIN_KEY_BITS
            )));
        }

        if protocol == "http" {
            if is_local_server_domain(&self.server.domain) {
                let host = normalized_server_host(&self.server.domain);
                tracing::warn!(
                    host = %host,
                    "Serving federation endpoints over plain http for local development"
                );
            } else {
                return Err(crate::error::AppError::Config(
                    "server.protocol must be https for non-local server domains".to_string(),
                ));
            }
        }

        Ok(())
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}
