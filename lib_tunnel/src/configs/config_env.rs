//! # Runtime Configuration
//!
//! Loads the gateway configuration from environment variables (a `.env` file
//! is honored when present), applies defaults and validates the result.
//! The configuration is immutable after server start; every invalid value is
//! a startup-fatal error.

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use thiserror::Error;

#[derive(Debug, Error)]
/// # Configuration Error
///
/// Startup-fatal problems found while reading the environment.
pub enum ConfigError {
    /// A variable was present but could not be parsed into its target type.
    #[error("invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),

    /// A variable required by the selected mode was missing.
    #[error("missing environment variable: {0}")]
    MissingEnvVar(&'static str),

    /// A value parsed fine but failed a range/format rule.
    #[error("validation failed for {0}: {1}")]
    Validation(&'static str, String),
}

/// Which backend the object store uses, selected by `XPS_MODE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreMode {
    /// Remote HTTP object store at `XPS_URL`.
    Http,
    /// Local directory backend (development and tests).
    Dir,
}

/// # Gateway Configuration
///
/// All runtime tunables. Field defaults mirror the deployed service:
/// a 65 KiB carrier copy buffer, 64 KiB HTTP/2 read frames, 30 s retry
/// ceiling, 2 s warm-up and a 45 s client ping interval.
#[derive(Debug, Clone)]
pub struct Config {
    /// Carrier copy-buffer size in KiB (`>= 1`).
    pub ws_buf_kib: usize,
    /// HTTP/2 `max_frame_size` in KiB (`>= 1`).
    pub h2_max_frame_kib: u32,
    /// Verbose HTTP/2 logging (`H2_LOGS`).
    pub h2_verbose: bool,
    /// Ceiling for the serve-retry backoff in seconds (`H2_RETRY_MAX_SECOND`).
    pub h2_retry_max_secs: u64,
    /// Delay before the first serve attempt in seconds (`H2_SLEEP_SECOND`).
    pub h2_warmup_secs: u64,
    /// Ping interval advertised to clients in seconds (`PING_SECOND`).
    pub ping_secs: u64,
    /// Extra plain-TCP listener port for the tunneled service; 0 means
    /// carrier-only (`WSH_TCP`).
    pub tcp_port: u16,
    /// Development mode (`DEV`).
    pub dev: bool,
    /// Log level override (`ZAP_LEVEL`), empty for the mode default.
    pub log_level: String,
    /// Domain the ACME certificate is issued for (`ACME_DOMAIN`).
    pub acme_domain: String,
    /// ACME directory URL (`ACME_DIRECTORY`); defaults to Let's Encrypt
    /// production.
    pub acme_directory: String,
    /// Skip ACME and load a local key pair (`TEST_MODE`).
    pub test_mode: bool,
    /// Certificate path used in test mode.
    pub server_crt: String,
    /// Private-key path used in test mode.
    pub server_key: String,
    /// Address the plain-HTTP front binds to (`HOST`/`PORT`, paas style).
    pub bind_addr: SocketAddr,
    /// Object-store backend (`XPS_MODE`).
    pub store_mode: StoreMode,
    /// Base64 of the 32-byte sealing key (`XPS_PASSWORD`), decoded.
    pub store_key: [u8; 32],
    /// Remote store base URL (`XPS_URL`) or local directory path.
    pub store_url: String,
}

impl Config {
    /// Reads the full configuration from the process environment.
    ///
    /// `dotenvy` has to be invoked by the binary before calling this, so a
    /// `.env` file can seed the variables the same way the platform does.
    pub fn from_env() -> Result<Self, ConfigError> {
        let ws_buf_kib = parse_var("WS_BUF_KIB", 65usize)?;
        if ws_buf_kib < 1 {
            return Err(ConfigError::Validation("WS_BUF_KIB", "must be >= 1".into()));
        }
        let h2_max_frame_kib = parse_var("H2_MAX_FRAME_KIB", 64u32)?;
        if h2_max_frame_kib < 1 {
            return Err(ConfigError::Validation("H2_MAX_FRAME_KIB", "must be >= 1".into()));
        }

        let h2_retry_max_secs = parse_var("H2_RETRY_MAX_SECOND", 30u64)?;
        if h2_retry_max_secs < 1 {
            return Err(ConfigError::Validation("H2_RETRY_MAX_SECOND", "must be >= 1".into()));
        }

        let log_level = env::var("ZAP_LEVEL").unwrap_or_default();
        match log_level.as_str() {
            "" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::Validation("ZAP_LEVEL", format!("unknown level {other:?}")));
            }
        }

        let test_mode = parse_bool("TEST_MODE")?;
        let acme_domain = env::var("ACME_DOMAIN").unwrap_or_default();
        if !test_mode && acme_domain.is_empty() {
            return Err(ConfigError::MissingEnvVar("ACME_DOMAIN"));
        }

        let store_mode = match env::var("XPS_MODE").as_deref() {
            Ok("dir") => StoreMode::Dir,
            Ok("http") | Ok("") | Err(_) => StoreMode::Http,
            Ok(other) => {
                return Err(ConfigError::InvalidValue("XPS_MODE", other.to_string()));
            }
        };
        let store_url = match store_mode {
            StoreMode::Http if !test_mode => {
                env::var("XPS_URL").map_err(|_| ConfigError::MissingEnvVar("XPS_URL"))?
            }
            _ => env::var("XPS_URL").unwrap_or_else(|_| ".".into()),
        };
        let store_key = if test_mode {
            [0u8; 32]
        } else {
            let password =
                env::var("XPS_PASSWORD").map_err(|_| ConfigError::MissingEnvVar("XPS_PASSWORD"))?;
            decode_store_key(&password)?
        };

        // The platform hands the front address over as HOST/PORT.
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = parse_var("PORT", 8080u16)?;
        let bind_addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|e| ConfigError::InvalidValue("HOST/PORT", format!("{e}")))?;

        Ok(Self {
            ws_buf_kib,
            h2_max_frame_kib,
            h2_verbose: parse_bool("H2_LOGS")?,
            h2_retry_max_secs,
            h2_warmup_secs: parse_var("H2_SLEEP_SECOND", 2u64)?,
            ping_secs: parse_var("PING_SECOND", 45u64)?,
            tcp_port: parse_var("WSH_TCP", 0u16)?,
            dev: parse_bool("DEV")?,
            log_level,
            acme_domain,
            acme_directory: env::var("ACME_DIRECTORY")
                .unwrap_or_else(|_| "https://acme-v02.api.letsencrypt.org/directory".into()),
            test_mode,
            server_crt: env::var("SERVER_CRT").unwrap_or_else(|_| "server.crt".into()),
            server_key: env::var("SERVER_KEY").unwrap_or_else(|_| "server.key".into()),
            bind_addr,
            store_mode,
            store_key,
            store_url,
        })
    }

    /// Carrier copy-buffer size in bytes.
    pub fn ws_buf_bytes(&self) -> usize {
        self.ws_buf_kib << 10
    }

    /// HTTP/2 `max_frame_size` in bytes.
    pub fn h2_max_frame_bytes(&self) -> u32 {
        self.h2_max_frame_kib << 10
    }

    /// Delay before the first tunneled serve attempt.
    pub fn h2_warmup(&self) -> Duration {
        Duration::from_secs(self.h2_warmup_secs)
    }

    /// The tracing filter directive for this configuration: `ZAP_LEVEL`
    /// wins, otherwise `debug` under `DEV` and `info` in production.
    pub fn log_directive(&self) -> &str {
        if !self.log_level.is_empty() {
            return &self.log_level;
        }
        if self.dev {
            "debug"
        } else {
            "info"
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) if !raw.is_empty() => raw
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name, e.to_string())),
        _ => Ok(default),
    }
}

fn parse_bool(name: &'static str) -> Result<bool, ConfigError> {
    match env::var(name).as_deref() {
        Ok("1") | Ok("true") | Ok("TRUE") => Ok(true),
        Ok("") | Ok("0") | Ok("false") | Ok("FALSE") | Err(_) => Ok(false),
        Ok(other) => Err(ConfigError::InvalidValue(name, other.to_string())),
    }
}

fn decode_store_key(password: &str) -> Result<[u8; 32], ConfigError> {
    let raw = general_purpose::STANDARD
        .decode(password.trim())
        .map_err(|e| ConfigError::InvalidValue("XPS_PASSWORD", e.to_string()))?;
    if raw.len() != 32 {
        return Err(ConfigError::Validation(
            "XPS_PASSWORD",
            format!("expected 32 bytes after base64, got {}", raw.len()),
        ));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&raw);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    // Env-var tests share process state; serialize them.
    fn env_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_env() {
        for name in [
            "WS_BUF_KIB",
            "H2_MAX_FRAME_KIB",
            "H2_LOGS",
            "H2_RETRY_MAX_SECOND",
            "H2_SLEEP_SECOND",
            "PING_SECOND",
            "WSH_TCP",
            "DEV",
            "ZAP_LEVEL",
            "ACME_DOMAIN",
            "TEST_MODE",
            "XPS_MODE",
            "XPS_PASSWORD",
            "XPS_URL",
            "HOST",
            "PORT",
        ] {
            env::remove_var(name);
        }
    }

    #[test]
    fn test_defaults_in_test_mode() {
        let _guard = env_lock().lock().unwrap();
        clear_env();
        env::set_var("TEST_MODE", "1");

        let config = Config::from_env().expect("defaults should validate");
        assert_eq!(config.ws_buf_kib, 65);
        assert_eq!(config.h2_max_frame_kib, 64);
        assert_eq!(config.h2_retry_max_secs, 30);
        assert_eq!(config.h2_warmup_secs, 2);
        assert_eq!(config.ping_secs, 45);
        assert_eq!(config.tcp_port, 0);
        assert!(!config.h2_verbose);
        assert!(config.test_mode);
        assert_eq!(config.log_directive(), "info");
    }

    #[test]
    fn test_env_overrides() {
        let _guard = env_lock().lock().unwrap();
        clear_env();
        env::set_var("TEST_MODE", "1");
        env::set_var("H2_RETRY_MAX_SECOND", "7");
        env::set_var("H2_SLEEP_SECOND", "0");
        env::set_var("PING_SECOND", "10");
        env::set_var("WSH_TCP", "9443");
        env::set_var("DEV", "1");

        let config = Config::from_env().unwrap();
        assert_eq!(config.h2_retry_max_secs, 7);
        assert_eq!(config.h2_warmup_secs, 0);
        assert_eq!(config.ping_secs, 10);
        assert_eq!(config.tcp_port, 9443);
        assert_eq!(config.log_directive(), "debug");
    }

    #[test]
    fn test_missing_domain_outside_test_mode() {
        let _guard = env_lock().lock().unwrap();
        clear_env();
        env::set_var("XPS_MODE", "dir");
        env::set_var("XPS_PASSWORD", general_purpose::STANDARD.encode([7u8; 32]));

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar("ACME_DOMAIN")));
    }

    #[test]
    fn test_store_key_must_be_32_bytes() {
        let _guard = env_lock().lock().unwrap();
        clear_env();
        env::set_var("ACME_DOMAIN", "example.com");
        env::set_var("XPS_MODE", "dir");
        env::set_var("XPS_PASSWORD", general_purpose::STANDARD.encode([7u8; 16]));

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Validation("XPS_PASSWORD", _)));
    }

    #[test]
    fn test_bad_level_rejected() {
        let _guard = env_lock().lock().unwrap();
        clear_env();
        env::set_var("TEST_MODE", "1");
        env::set_var("ZAP_LEVEL", "loud");

        assert!(Config::from_env().is_err());
    }
}
