use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the ppsc binary.
#[derive(Debug, Parser)]
#[command(
    name = "ppsc",
    version,
    about = "Gate-aware static page cache for password-protected content"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "PPSC_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub cache: CacheOverrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the public caching proxy and the admin listener.
    Serve(Box<ServeArgs>),
    /// Print cache coverage for every gated resource.
    Coverage(OutputArgs),
    /// Remove the cache entry of one resource.
    Clear(ClearArgs),
    /// Remove every cache entry.
    #[command(name = "clear-all")]
    ClearAll,
    /// Request every gated resource's public URL to warm the cache.
    Preload(PreloadArgs),
    /// Print the audit log, newest first.
    Log(LogArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

/// Overrides shared by every subcommand that touches the cache directory.
#[derive(Debug, Args, Default, Clone)]
pub struct CacheOverrides {
    /// Override the cache directory.
    #[arg(long = "cache-directory", value_name = "PATH", global = true)]
    pub cache_directory: Option<PathBuf>,

    /// Override the resource manifest path.
    #[arg(long = "manifest-path", value_name = "PATH", global = true)]
    pub manifest_path: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
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

    /// Override the upstream origin the proxy renders from.
    #[arg(long = "upstream-origin", value_name = "URL")]
    pub upstream_origin: Option<String>,

    /// Toggle the provenance comment prefixed to cached responses.
    #[arg(
        long = "cache-annotate-responses",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub annotate_responses: Option<bool>,

    /// Toggle per-resource single-flight rendering.
    #[arg(
        long = "cache-single-flight",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub single_flight: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct OutputArgs {
    /// Emit JSON instead of a plain table.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub json: bool,
}

#[derive(Debug, Args, Clone)]
pub struct ClearArgs {
    /// Resource identifier whose entry to remove.
    #[arg(long = "id", value_name = "ID")]
    pub id: crate::domain::types::ResourceId,
}

#[derive(Debug, Args, Default, Clone)]
pub struct PreloadArgs {
    /// Override the public base URL preload requests are sent to.
    #[arg(long = "public-base-url", value_name = "URL")]
    pub public_base_url: Option<String>,

    /// Override the per-request preload timeout.
    #[arg(long = "timeout-seconds", value_name = "SECONDS")]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct LogArgs {
    /// Print at most this many lines.
    #[arg(long, value_name = "COUNT")]
    pub limit: Option<usize>,
}
