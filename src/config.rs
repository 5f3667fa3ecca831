//! CLI arguments and the resolved runtime settings.

use clap::{ArgAction, Parser};
use regex::Regex;
use shadow_rs::formatcp;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::auth::{TokenSet, generate_token};
use crate::build;
use crate::duration::{DurationParseError, parse_duration};
use crate::expiration::{ExpirationSettings, ExpirationStrategy};
use crate::gc::DEFAULT_GC_PATTERNS;
use crate::logging::LogFormat;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_MAX_UPLOAD_SIZE: u64 = 5 * 1024 * 1024;
pub const DEFAULT_UPLOAD_PATH_PREFIX: &str = "files";
pub const DEFAULT_SCHEDULER_QUEUE: &str = "axo-share";

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "axo-share", version = VERSION_INFO, about = "AxoShare file server")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "AXO_STORAGE_DIR",
        default_value = ".axo/storage",
        help = "Storage directory for files"
    )]
    pub storage_dir: String,
    #[arg(
        short = 'b',
        long,
        env = "AXO_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "AXO_PORT",
        default_value_t = 8080,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        long,
        env = "AXO_ENABLE_CORS",
        default_value_t = true,
        action = ArgAction::Set,
        help = "Emit CORS headers"
    )]
    pub enable_cors: bool,
    #[arg(
        long,
        env = "AXO_CORS_ORIGINS",
        help = "Comma separated CORS origins (any origin when unset)"
    )]
    pub cors_origins: Option<String>,
    #[arg(long, env = "AXO_ENABLE_AUTH", help = "Require bearer tokens")]
    pub enable_auth: bool,
    #[arg(
        long,
        env = "AXO_READ_ONLY_TOKENS",
        value_delimiter = ',',
        help = "Comma separated read only tokens"
    )]
    pub read_only_tokens: Vec<String>,
    #[arg(
        long,
        env = "AXO_READ_WRITE_TOKENS",
        value_delimiter = ',',
        help = "Comma separated read write tokens"
    )]
    pub read_write_tokens: Vec<String>,
    #[arg(
        long,
        env = "AXO_MAX_UPLOAD_SIZE",
        default_value_t = DEFAULT_MAX_UPLOAD_SIZE,
        help = "Max upload size in bytes (0 to disable)"
    )]
    pub max_upload_size: u64,
    #[arg(
        long,
        env = "AXO_READ_TIMEOUT",
        default_value = "15s",
        help = "Request body read timeout (0 to disable)"
    )]
    pub read_timeout: String,
    #[arg(
        long,
        env = "AXO_WRITE_TIMEOUT",
        default_value = "300s",
        help = "Whole request timeout (0 to disable)"
    )]
    pub write_timeout: String,
    #[arg(
        long,
        env = "AXO_SHUTDOWN_TIMEOUT",
        default_value = "15s",
        help = "Graceful shutdown timeout (0 to wait forever)"
    )]
    pub shutdown_timeout: String,
    #[arg(
        long,
        env = "AXO_LOG_LEVEL",
        default_value = "info",
        help = "Log filter when RUST_LOG is unset"
    )]
    pub log_level: String,
    #[arg(
        long,
        env = "AXO_LOG_FORMAT",
        value_enum,
        default_value_t = LogFormat::Console,
        help = "Log output format"
    )]
    pub log_format: LogFormat,
    #[arg(
        long,
        env = "AXO_GC_PATTERNS",
        value_delimiter = ',',
        default_values_t = DEFAULT_GC_PATTERNS.iter().map(|p| p.to_string()),
        help = "File name patterns deleted by garbage collection"
    )]
    pub gc_patterns: Vec<String>,
    #[arg(
        long,
        env = "AXO_GC_INTERVAL",
        default_value = "5s",
        help = "Garbage collection interval"
    )]
    pub gc_interval: String,
    #[arg(
        long,
        env = "AXO_EXPIRATION",
        value_enum,
        default_value_t = ExpirationStrategy::Polling,
        help = "Expiration strategy for anonymous uploads"
    )]
    pub expiration: ExpirationStrategy,
    #[arg(
        long,
        env = "AXO_DATABASE",
        default_value = ".axo/share.db",
        help = "SQLite database path"
    )]
    pub database: String,
    #[arg(
        long,
        env = "AXO_EXPIRE_SWEEP_INTERVAL",
        default_value = "5s",
        help = "Expired upload sweep interval (polling strategy)"
    )]
    pub expire_sweep_interval: String,
    #[arg(
        long,
        env = "AXO_SCHEDULER_QUEUE",
        default_value = DEFAULT_SCHEDULER_QUEUE,
        help = "Scheduled deletion queue name (workflow strategy)"
    )]
    pub scheduler_queue: String,
    #[arg(
        long,
        env = "AXO_SCHEDULER_POLL_INTERVAL",
        default_value = "1s",
        help = "Due deletion poll interval (workflow strategy)"
    )]
    pub scheduler_poll_interval: String,
    #[arg(
        long,
        env = "AXO_UPLOAD_PATH_PREFIX",
        default_value = DEFAULT_UPLOAD_PATH_PREFIX,
        help = "Prefix of paths returned by anonymous uploads"
    )]
    pub upload_path_prefix: String,
    #[arg(long, env = "AXO_WEB_ROOT", help = "Static web root served as fallback")]
    pub web_root: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid bind address {0:?}")]
    InvalidHost(String),
    #[error("invalid --{flag}: {source}")]
    InvalidDuration {
        flag: &'static str,
        #[source]
        source: DurationParseError,
    },
    #[error("--{0} must be greater than zero")]
    ZeroInterval(&'static str),
    #[error("invalid garbage collection pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct HttpTimeouts {
    /// `None` 表示不限制。
    pub read: Option<Duration>,
    pub write: Option<Duration>,
    pub shutdown: Option<Duration>,
}

/// Settings resolved once at startup and passed to constructors.
#[derive(Debug)]
pub struct Settings {
    pub storage_dir: PathBuf,
    pub listen: SocketAddr,
    pub enable_cors: bool,
    pub cors_origins: Option<String>,
    pub tokens: TokenSet,
    pub max_upload_size: u64,
    pub timeouts: HttpTimeouts,
    pub gc_patterns: Vec<Regex>,
    pub gc_interval: Duration,
    pub database: PathBuf,
    pub expiration: ExpirationSettings,
    pub upload_path_prefix: String,
    pub web_root: Option<PathBuf>,
}

impl Settings {
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let host = args
            .host
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::InvalidHost(args.host.clone()))?;

        let gc_patterns = args
            .gc_patterns
            .iter()
            .map(|pattern| pattern.trim())
            .filter(|pattern| !pattern.is_empty())
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
                    pattern: pattern.to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let tokens = if !args.enable_auth {
            TokenSet::default()
        } else {
            let configured = TokenSet::new(args.read_only_tokens, args.read_write_tokens);
            if configured.is_disabled() {
                info!("authentication is enabled but no tokens provided, generating random tokens");
                let read_only = generate_token();
                let read_write = generate_token();
                info!(token = read_only, "generated read only token");
                info!(token = read_write, "generated read write token");
                TokenSet::new(vec![read_only], vec![read_write])
            } else {
                configured
            }
        };

        Ok(Self {
            storage_dir: PathBuf::from(args.storage_dir),
            listen: SocketAddr::new(host, args.port),
            enable_cors: args.enable_cors,
            cors_origins: args.cors_origins,
            tokens,
            max_upload_size: args.max_upload_size,
            timeouts: HttpTimeouts {
                read: optional_duration("read-timeout", &args.read_timeout)?,
                write: optional_duration("write-timeout", &args.write_timeout)?,
                shutdown: optional_duration("shutdown-timeout", &args.shutdown_timeout)?,
            },
            gc_patterns,
            gc_interval: interval("gc-interval", &args.gc_interval)?,
            database: PathBuf::from(args.database),
            expiration: ExpirationSettings {
                strategy: args.expiration,
                sweep_interval: interval("expire-sweep-interval", &args.expire_sweep_interval)?,
                scheduler_queue: args.scheduler_queue,
                scheduler_poll_interval: interval(
                    "scheduler-poll-interval",
                    &args.scheduler_poll_interval,
                )?,
            },
            upload_path_prefix: args.upload_path_prefix,
            web_root: args.web_root.map(PathBuf::from),
        })
    }
}

fn duration(flag: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).map_err(|source| ConfigError::InvalidDuration { flag, source })
}

/// 0 表示关闭对应的超时。
fn optional_duration(flag: &'static str, value: &str) -> Result<Option<Duration>, ConfigError> {
    let parsed = duration(flag, value)?;
    Ok((!parsed.is_zero()).then_some(parsed))
}

fn interval(flag: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let parsed = duration(flag, value)?;
    if parsed.is_zero() {
        return Err(ConfigError::ZeroInterval(flag));
    }
    Ok(parsed)
}
