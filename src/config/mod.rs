//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{collections::HashMap, net::SocketAddr, str::FromStr, time::Duration};

use axum::http::{HeaderName, HeaderValue};
use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{
    DEFAULT_CDN_HEADER, StoreBackend, StrategyName, StrategyOverride, StrategyRegistry,
};
use crate::crypto::{KeyError, MessageCipher};

pub use cli::{
    CliArgs, Command, DecryptArgs, EncryptArgs, KeyOverride, ServeArgs, ServeOverrides,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "hubcache";
const ENV_PREFIX: &str = "HUBCACHE";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_ADMIN_HOST: &str = "127.0.0.1";
const DEFAULT_PUBLIC_PORT: u16 = 3000;
const DEFAULT_ADMIN_PORT: u16 = 3001;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_MEMORY_CAPACITY: usize = 10_000;
const DEFAULT_PRODUCER_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_FILL_LOCK_LEASE_MS: u64 = 5_000;
const DEFAULT_FILL_LOCK_POLL_MS: u64 = 50;
const DEFAULT_REDIS_NAMESPACE: &str = "hubcache";
const DEFAULT_UPSTREAM_TIMEOUT_MS: u64 = 10_000;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub crypto: CryptoSettings,
    pub upstream: UpstreamSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub public_addr: SocketAddr,
    pub admin_addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub backend: StoreBackend,
    pub memory_capacity: usize,
    pub producer_timeout_ms: u64,
    pub fill_lock_lease_ms: u64,
    pub fill_lock_poll_ms: u64,
    pub strategies: HashMap<StrategyName, StrategyOverride>,
    pub cdn_headers: Vec<String>,
    pub build_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CryptoSettings {
    /// Validated 64-character hex key; `None` when not configured.
    pub message_key: Option<String>,
}

impl CryptoSettings {
    /// Build the message cipher, failing when no key is configured.
    pub fn cipher(&self) -> Result<MessageCipher, KeyError> {
        match self.message_key.as_deref() {
            Some(key) => MessageCipher::from_hex(key),
            None => Err(KeyError::Missing),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    /// Base URL without a trailing slash; `None` disables the gateway routes.
    pub base_url: Option<String>,
    pub timeout: Duration,
    pub routes: Vec<RouteRule>,
}

/// Caching policy for upstream paths under `prefix`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    pub prefix: String,
    pub strategy: StrategyName,
    pub tags: Vec<String>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Encrypt(args)) => raw.apply_key_override(&args.key),
        Some(Command::Decrypt(args)) => raw.apply_key_override(&args.key),
        Some(Command::GenKey) => {}
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    crypto: RawCryptoSettings,
    upstream: RawUpstreamSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(host) = overrides.server_admin_host.as_ref() {
            self.server.admin_host = Some(host.clone());
        }
        if let Some(port) = overrides.public_port {
            self.server.public_port = Some(port);
        }
        if let Some(port) = overrides.admin_port {
            self.server.admin_port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(backend) = overrides.cache_backend.as_ref() {
            self.cache.backend = Some(backend.clone());
        }
        if let Some(url) = overrides.redis_url.as_ref() {
            self.cache.redis_url = Some(url.clone());
        }
        if let Some(build_id) = overrides.build_id.as_ref() {
            self.cache.build_id = Some(build_id.clone());
        }
        if let Some(url) = overrides.upstream_url.as_ref() {
            self.upstream.base_url = Some(url.clone());
        }

        self.apply_key_override(&overrides.key);
    }

    fn apply_key_override(&mut self, overrides: &KeyOverride) {
        if let Some(key) = overrides.message_key.as_ref() {
            self.crypto.message_key = Some(key.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
            crypto,
            upstream,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;
        let crypto = build_crypto_settings(crypto)?;
        let upstream = build_upstream_settings(upstream)?;

        Ok(Self {
            server,
            logging,
            cache,
            crypto,
            upstream,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let admin_host = server
        .admin_host
        .unwrap_or_else(|| DEFAULT_ADMIN_HOST.to_string());

    let public_port = server.public_port.unwrap_or(DEFAULT_PUBLIC_PORT);
    if public_port == 0 {
        return Err(LoadError::invalid(
            "server.public_port",
            "port must be greater than zero",
        ));
    }

    let admin_port = server.admin_port.unwrap_or(DEFAULT_ADMIN_PORT);
    if admin_port == 0 {
        return Err(LoadError::invalid(
            "server.admin_port",
            "port must be greater than zero",
        ));
    }

    let public_addr = parse_socket_addr(&host, public_port)
        .map_err(|reason| LoadError::invalid("server.public_addr", reason))?;
    let admin_addr = parse_socket_addr(&admin_host, admin_port)
        .map_err(|reason| LoadError::invalid("server.admin_addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        public_addr,
        admin_addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let backend = match non_empty(cache.backend)
        .map(|value| value.to_ascii_lowercase())
        .as_deref()
    {
        None | Some("memory") => StoreBackend::Memory,
        Some("redis") => {
            let url = non_empty(cache.redis_url).ok_or_else(|| {
                LoadError::invalid("cache.redis_url", "required when cache.backend = \"redis\"")
            })?;
            if !(url.starts_with("redis://")
                || url.starts_with("rediss://")
                || url.starts_with("unix://"))
            {
                return Err(LoadError::invalid(
                    "cache.redis_url",
                    format!("`{url}` is not a redis://, rediss:// or unix:// URL"),
                ));
            }
            let namespace = non_empty(cache.redis_namespace)
                .unwrap_or_else(|| DEFAULT_REDIS_NAMESPACE.to_string());
            StoreBackend::Redis { url, namespace }
        }
        Some(other) => {
            return Err(LoadError::invalid(
                "cache.backend",
                format!("unknown backend `{other}` (expected memory or redis)"),
            ));
        }
    };

    let memory_capacity = cache.memory_capacity.unwrap_or(DEFAULT_MEMORY_CAPACITY);
    if memory_capacity == 0 {
        return Err(LoadError::invalid(
            "cache.memory_capacity",
            "must be greater than zero",
        ));
    }

    let producer_timeout_ms = positive(
        cache.producer_timeout_ms.unwrap_or(DEFAULT_PRODUCER_TIMEOUT_MS),
        "cache.producer_timeout_ms",
    )?;
    let fill_lock_lease_ms = positive(
        cache.fill_lock_lease_ms.unwrap_or(DEFAULT_FILL_LOCK_LEASE_MS),
        "cache.fill_lock_lease_ms",
    )?;
    let fill_lock_poll_ms = positive(
        cache.fill_lock_poll_ms.unwrap_or(DEFAULT_FILL_LOCK_POLL_MS),
        "cache.fill_lock_poll_ms",
    )?;
    if fill_lock_poll_ms >= fill_lock_lease_ms {
        return Err(LoadError::invalid(
            "cache.fill_lock_poll_ms",
            "must be shorter than cache.fill_lock_lease_ms",
        ));
    }

    let mut strategies = HashMap::new();
    for (name, tuning) in cache.strategies {
        let name = name
            .parse::<StrategyName>()
            .map_err(|err| LoadError::invalid("cache.strategies", err.to_string()))?;
        strategies.insert(
            name,
            StrategyOverride {
                max_age_secs: tuning.max_age_secs,
                stale_while_revalidate_secs: tuning.stale_while_revalidate_secs,
                cdn_max_age_secs: tuning.cdn_max_age_secs,
            },
        );
    }
    StrategyRegistry::with_overrides(&strategies)
        .map_err(|err| LoadError::invalid("cache.strategies", err.to_string()))?;

    let cdn_headers = cache
        .cdn_headers
        .unwrap_or_else(|| vec![DEFAULT_CDN_HEADER.to_string()]);
    for name in &cdn_headers {
        HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
            LoadError::invalid("cache.cdn_headers", format!("`{name}` is not a header name"))
        })?;
    }

    let build_id = non_empty(cache.build_id);
    if let Some(id) = build_id.as_deref() {
        HeaderValue::from_str(id).map_err(|_| {
            LoadError::invalid("cache.build_id", "must be printable ASCII")
        })?;
    }

    Ok(CacheSettings {
        backend,
        memory_capacity,
        producer_timeout_ms,
        fill_lock_lease_ms,
        fill_lock_poll_ms,
        strategies,
        cdn_headers,
        build_id,
    })
}

fn build_crypto_settings(crypto: RawCryptoSettings) -> Result<CryptoSettings, LoadError> {
    let message_key = non_empty(crypto.message_key);
    if let Some(key) = message_key.as_deref() {
        MessageCipher::from_hex(key)
            .map_err(|err| LoadError::invalid("crypto.message_key", err.to_string()))?;
    }
    Ok(CryptoSettings { message_key })
}

fn build_upstream_settings(upstream: RawUpstreamSettings) -> Result<UpstreamSettings, LoadError> {
    let base_url = match non_empty(upstream.base_url) {
        Some(url) if url.starts_with("http://") || url.starts_with("https://") => {
            Some(url.trim_end_matches('/').to_string())
        }
        Some(url) => {
            return Err(LoadError::invalid(
                "upstream.base_url",
                format!("`{url}` is not an http(s) URL"),
            ));
        }
        None => None,
    };

    let timeout_ms = positive(
        upstream.timeout_ms.unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_MS),
        "upstream.timeout_ms",
    )?;

    let routes = upstream
        .routes
        .into_iter()
        .map(|rule| {
            if !rule.prefix.starts_with('/') {
                return Err(LoadError::invalid(
                    "upstream.routes",
                    format!("prefix `{}` must start with `/`", rule.prefix),
                ));
            }
            let strategy = rule
                .strategy
                .parse::<StrategyName>()
                .map_err(|err| LoadError::invalid("upstream.routes", err.to_string()))?;
            Ok(RouteRule {
                prefix: rule.prefix,
                strategy,
                tags: rule.tags,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(UpstreamSettings {
        base_url,
        timeout: Duration::from_millis(timeout_ms),
        routes,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    admin_host: Option<String>,
    public_port: Option<u16>,
    admin_port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    backend: Option<String>,
    redis_url: Option<String>,
    redis_namespace: Option<String>,
    memory_capacity: Option<usize>,
    producer_timeout_ms: Option<u64>,
    fill_lock_lease_ms: Option<u64>,
    fill_lock_poll_ms: Option<u64>,
    strategies: HashMap<String, RawStrategyOverride>,
    cdn_headers: Option<Vec<String>>,
    build_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStrategyOverride {
    max_age_secs: Option<u64>,
    stale_while_revalidate_secs: Option<u64>,
    cdn_max_age_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCryptoSettings {
    message_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawUpstreamSettings {
    base_url: Option<String>,
    timeout_ms: Option<u64>,
    routes: Vec<RawRouteRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawRouteRule {
    prefix: String,
    strategy: String,
    #[serde(default)]
    tags: Vec<String>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn positive(value: u64, key: &'static str) -> Result<u64, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(value)
}
