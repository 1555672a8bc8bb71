//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::NonZeroUsize,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::CacheConfig;

mod cli;

pub use cli::{
    CacheOverrides, ClearArgs, CliArgs, Command, LogArgs, OutputArgs, PreloadArgs, ServeArgs,
    ServeOverrides,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "ppsc";
const ENV_PREFIX: &str = "PPSC";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_ADMIN_HOST: &str = "127.0.0.1";
const DEFAULT_PUBLIC_PORT: u16 = 3000;
const DEFAULT_ADMIN_PORT: u16 = 3001;
const DEFAULT_UPSTREAM_ORIGIN: &str = "http://127.0.0.1:8080";
const DEFAULT_MANIFEST_PATH: &str = "ppsc-resources.toml";

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub upstream: UpstreamSettings,
    pub manifest: ManifestSettings,
    pub operator: OperatorSettings,
    pub preload: PreloadSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub public_addr: SocketAddr,
    pub admin_addr: SocketAddr,
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
    pub directory: PathBuf,
    pub log_file: String,
    pub lock_marker: String,
    pub signature: String,
    pub annotate_responses: bool,
    pub single_flight: bool,
    pub max_capture_bytes: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub origin: Url,
}

#[derive(Debug, Clone)]
pub struct ManifestSettings {
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct OperatorSettings {
    /// Hex SHA-256 of the operator bearer token; `None` disables privileged access.
    pub token_digest: Option<String>,
    /// Secret anti-forgery tokens are derived from.
    pub form_secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PreloadSettings {
    pub public_base_url: Url,
    pub cookie: Option<String>,
    pub timeout: Option<Duration>,
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

    raw.apply_cache_overrides(&cli.cache);
    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Preload(args)) => raw.apply_preload_overrides(args),
        Some(Command::Coverage(_) | Command::Clear(_) | Command::ClearAll | Command::Log(_)) => {}
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    upstream: RawUpstreamSettings,
    manifest: RawManifestSettings,
    operator: RawOperatorSettings,
    preload: RawPreloadSettings,
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
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(origin) = overrides.upstream_origin.as_ref() {
            self.upstream.origin = Some(origin.clone());
        }
        if let Some(annotate) = overrides.annotate_responses {
            self.cache.annotate_responses = Some(annotate);
        }
        if let Some(single_flight) = overrides.single_flight {
            self.cache.single_flight = Some(single_flight);
        }
    }

    fn apply_cache_overrides(&mut self, overrides: &CacheOverrides) {
        if let Some(directory) = overrides.cache_directory.as_ref() {
            self.cache.directory = Some(directory.clone());
        }
        if let Some(path) = overrides.manifest_path.as_ref() {
            self.manifest.path = Some(path.clone());
        }
    }

    fn apply_preload_overrides(&mut self, overrides: &PreloadArgs) {
        if let Some(url) = overrides.public_base_url.as_ref() {
            self.preload.public_base_url = Some(url.clone());
        }
        if let Some(seconds) = overrides.timeout_seconds {
            self.preload.timeout_seconds = Some(seconds);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
            upstream,
            manifest,
            operator,
            preload,
        } = raw;

        let server = build_server_settings(server)?;
        let public_addr = server.public_addr;

        Ok(Self {
            server,
            logging: build_logging_settings(logging)?,
            cache: build_cache_settings(cache)?,
            upstream: build_upstream_settings(upstream)?,
            manifest: build_manifest_settings(manifest)?,
            operator: build_operator_settings(operator)?,
            preload: build_preload_settings(preload, public_addr)?,
        })
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::from(&self.cache)
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
    if public_addr == admin_addr {
        return Err(LoadError::invalid(
            "server.admin_port",
            "admin listener must not share the public address",
        ));
    }

    Ok(ServerSettings {
        public_addr,
        admin_addr,
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
    let defaults = CacheConfig::default();

    let directory = cache.directory.unwrap_or(defaults.directory);
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "cache.directory",
            "path must not be empty",
        ));
    }

    let log_file = cache.log_file.unwrap_or(defaults.log_file);
    if log_file.is_empty() || log_file.contains(['/', '\\']) {
        return Err(LoadError::invalid(
            "cache.log_file",
            "must be a plain file name inside the cache directory",
        ));
    }

    let lock_marker = cache.lock_marker.unwrap_or(defaults.lock_marker);
    if lock_marker.trim().is_empty() {
        return Err(LoadError::invalid(
            "cache.lock_marker",
            "marker must not be empty",
        ));
    }

    let signature = cache.signature.unwrap_or(defaults.signature);
    // The signature ends up inside an HTML comment.
    if signature.is_empty() || signature.contains("--") || signature.contains('>') {
        return Err(LoadError::invalid(
            "cache.signature",
            "must be non-empty and must not contain `--` or `>`",
        ));
    }

    let max_capture_bytes = non_zero_usize(
        cache.max_capture_bytes.unwrap_or(defaults.max_capture_bytes as u64),
        "cache.max_capture_bytes",
    )?;

    Ok(CacheSettings {
        directory,
        log_file,
        lock_marker,
        signature,
        annotate_responses: cache
            .annotate_responses
            .unwrap_or(defaults.annotate_responses),
        single_flight: cache.single_flight.unwrap_or(defaults.single_flight),
        max_capture_bytes,
    })
}

fn build_upstream_settings(upstream: RawUpstreamSettings) -> Result<UpstreamSettings, LoadError> {
    let raw = upstream
        .origin
        .unwrap_or_else(|| DEFAULT_UPSTREAM_ORIGIN.to_string());
    let origin = parse_http_url(&raw, "upstream.origin")?;
    Ok(UpstreamSettings { origin })
}

fn build_manifest_settings(manifest: RawManifestSettings) -> Result<ManifestSettings, LoadError> {
    let path = manifest
        .path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_MANIFEST_PATH));
    if path.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "manifest.path",
            "path must not be empty",
        ));
    }
    Ok(ManifestSettings { path })
}

fn build_operator_settings(operator: RawOperatorSettings) -> Result<OperatorSettings, LoadError> {
    let token_digest = match non_blank(operator.token_digest) {
        Some(digest) => {
            let digest = digest.to_ascii_lowercase();
            if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(LoadError::invalid(
                    "operator.token_digest",
                    "expected 64 hex characters (SHA-256)",
                ));
            }
            Some(digest)
        }
        None => None,
    };

    Ok(OperatorSettings {
        token_digest,
        form_secret: non_blank(operator.form_secret),
    })
}

fn build_preload_settings(
    preload: RawPreloadSettings,
    public_addr: SocketAddr,
) -> Result<PreloadSettings, LoadError> {
    let public_base_url = match non_blank(preload.public_base_url) {
        Some(raw) => parse_http_url(&raw, "preload.public_base_url")?,
        None => parse_http_url(&format!("http://{public_addr}"), "preload.public_base_url")?,
    };

    let timeout = match preload.timeout_seconds {
        Some(0) => {
            return Err(LoadError::invalid(
                "preload.timeout_seconds",
                "must be greater than zero when set",
            ));
        }
        Some(seconds) => Some(Duration::from_secs(seconds)),
        None => None,
    };

    Ok(PreloadSettings {
        public_base_url,
        cookie: non_blank(preload.cookie),
        timeout,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    admin_host: Option<String>,
    public_port: Option<u16>,
    admin_port: Option<u16>,
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
    directory: Option<PathBuf>,
    log_file: Option<String>,
    lock_marker: Option<String>,
    signature: Option<String>,
    annotate_responses: Option<bool>,
    single_flight: Option<bool>,
    max_capture_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawUpstreamSettings {
    origin: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawManifestSettings {
    path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawOperatorSettings {
    token_digest: Option<String>,
    form_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPreloadSettings {
    public_base_url: Option<String>,
    cookie: Option<String>,
    timeout_seconds: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn parse_http_url(raw: &str, key: &'static str) -> Result<Url, LoadError> {
    let url = Url::parse(raw.trim())
        .map_err(|err| LoadError::invalid(key, format!("invalid URL `{raw}`: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(LoadError::invalid(key, "scheme must be http or https"));
    }
    Ok(url)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
