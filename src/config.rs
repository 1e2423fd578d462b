use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub storage: StorageConfig,
    pub amqp: Option<AmqpConfig>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Shared key every client must send in `X-API-KEY`.
    pub api_key: String,
    pub jwt_secret: String,
    pub jwt_ttl_hours: i64,
    /// Code accepted by `verify-otp`. SMS delivery is not wired up yet.
    pub otp_code: String,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub root: String,
    pub public_url: String,
}

#[derive(Debug, Clone)]
pub struct AmqpConfig {
    pub url: String,
    pub exchange: String,
}

fn required(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Missing required environment variable {key}"))
}

fn optional(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("Invalid value for {key}: {raw}")),
        Err(_) => Ok(default),
    }
}

/// Reads the service configuration from the environment (after `.env` has been loaded).
pub fn load() -> Result<Config> {
    let amqp = match std::env::var("AMQP_URL") {
        Ok(url) if !url.is_empty() => Some(AmqpConfig {
            url,
            exchange: optional("AMQP_EXCHANGE", "consultations.broadcast"),
        }),
        _ => None,
    };

    Ok(Config {
        server: ServerConfig {
            host: optional("SERVER_HOST", "0.0.0.0"),
            port: parsed("SERVER_PORT", 3000)?,
        },
        database: DatabaseConfig {
            url: required("DATABASE_URL")?,
            max_connections: parsed("DATABASE_MAX_CONNECTIONS", 10)?,
        },
        auth: AuthConfig {
            api_key: required("API_KEY")?,
            jwt_secret: required("JWT_SECRET")?,
            jwt_ttl_hours: parsed("JWT_TTL_HOURS", 24 * 30)?,
            otp_code: optional("OTP_CODE", "666666"),
        },
        storage: StorageConfig {
            root: optional("STORAGE_ROOT", "storage/public"),
            public_url: optional("STORAGE_PUBLIC_URL", "http://localhost:3000/storage"),
        },
        amqp,
    })
}
