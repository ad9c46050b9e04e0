use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the hubcache binary.
#[derive(Debug, Parser)]
#[command(
    name = "hubcache",
    version,
    about = "Caching gateway and message sealing tools"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "HUBCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the caching gateway.
    Serve(Box<ServeArgs>),
    /// Seal a message with the configured key and print the wire form.
    Encrypt(EncryptArgs),
    /// Open a sealed message and print its plaintext.
    Decrypt(DecryptArgs),
    /// Print a freshly generated message key.
    #[command(name = "gen-key")]
    GenKey,
}

#[derive(Debug, Args, Default, Clone)]
pub struct KeyOverride {
    /// Override the 64-character hex message key.
    #[arg(long = "message-key", value_name = "HEX")]
    pub message_key: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct EncryptArgs {
    #[command(flatten)]
    pub key: KeyOverride,

    /// Plaintext to seal.
    #[arg(value_name = "TEXT")]
    pub text: String,
}

#[derive(Debug, Args, Clone)]
pub struct DecryptArgs {
    #[command(flatten)]
    pub key: KeyOverride,

    /// Sealed message in `iv:tag:ciphertext` form.
    #[arg(value_name = "ENCODED")]
    pub encoded: String,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub key: KeyOverride,

    /// Override the public listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the administrative listener host.
    #[arg(long = "server-admin-host", value_name = "HOST")]
    pub server_admin_host: Option<String>,

    /// Override the public listener port.
    #[arg(long = "server-public-port", value_name = "PORT")]
    pub public_port: Option<u16>,

    /// Override the administrative listener port.
    #[arg(long = "server-admin-port", value_name = "PORT")]
    pub admin_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the cache backend (memory|redis).
    #[arg(long = "cache-backend", value_name = "BACKEND")]
    pub cache_backend: Option<String>,

    /// Override the Redis connection URL.
    #[arg(long = "redis-url", value_name = "URL")]
    pub redis_url: Option<String>,

    /// Override the build identifier echoed in `X-Build-Id`.
    #[arg(long = "build-id", value_name = "ID")]
    pub build_id: Option<String>,

    /// Override the upstream API base URL.
    #[arg(long = "upstream-url", value_name = "URL")]
    pub upstream_url: Option<String>,
}
