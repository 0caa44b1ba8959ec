use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the rasterd binary.
#[derive(Debug, Parser)]
#[command(
    name = "rasterd",
    version,
    about = "Render PDF pages to JPEG through isolated worker processes"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "RASTERD_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the HTTP service.
    Serve(Box<ServeArgs>),
    /// Render a single page through a one-off worker pool and write the JPEG.
    Render(RenderArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct LoggingOverrides {
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
}

#[derive(Debug, Args, Default, Clone)]
pub struct PoolOverrides {
    /// Override the number of workers kept warm.
    #[arg(long = "pool-min-idle", value_name = "COUNT")]
    pub min_idle: Option<usize>,

    /// Override the idle worker ceiling.
    #[arg(long = "pool-max-idle", value_name = "COUNT")]
    pub max_idle: Option<usize>,

    /// Override the total worker ceiling.
    #[arg(long = "pool-max-total", value_name = "COUNT")]
    pub max_total: Option<usize>,

    /// Override the worker executable.
    #[arg(long = "worker-program", value_name = "PATH", value_hint = ValueHint::ExecutablePath)]
    pub worker_program: Option<PathBuf>,

    /// Path of the PDFium shared library handed to workers.
    #[arg(long = "pdfium-library", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub pdfium_library: Option<PathBuf>,

    /// Override how long a worker may hold a lease.
    #[arg(long = "pool-lease-timeout-seconds", value_name = "SECONDS")]
    pub lease_timeout_seconds: Option<u64>,

    /// Override how long a new worker may take to report ready.
    #[arg(long = "pool-startup-timeout-seconds", value_name = "SECONDS")]
    pub startup_timeout_seconds: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    #[command(flatten)]
    pub pool: PoolOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the highest accepted DPI.
    #[arg(long = "render-max-dpi", value_name = "DPI")]
    pub render_max_dpi: Option<u32>,

    /// Override the largest accepted document in bytes.
    #[arg(long = "render-max-document-bytes", value_name = "BYTES")]
    pub render_max_document_bytes: Option<u64>,

    /// Override how long a request waits for a free worker.
    #[arg(long = "render-acquire-timeout-seconds", value_name = "SECONDS")]
    pub render_acquire_timeout_seconds: Option<u64>,

    /// Override the per-call worker timeout.
    #[arg(long = "render-call-timeout-seconds", value_name = "SECONDS")]
    pub render_call_timeout_seconds: Option<u64>,

    /// Override the JPEG quality (1-100).
    #[arg(long = "render-jpeg-quality", value_name = "QUALITY")]
    pub render_jpeg_quality: Option<u8>,
}

#[derive(Debug, Args, Clone)]
pub struct RenderArgs {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    #[command(flatten)]
    pub pool: PoolOverrides,

    /// Document to render.
    #[arg(value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub file: PathBuf,

    /// 1-based page number; zero or negative selects the first page.
    #[arg(long, default_value_t = 1, allow_negative_numbers = true)]
    pub page: i64,

    /// Rendering resolution.
    #[arg(long, default_value_t = 150)]
    pub dpi: i64,

    /// Where to write the JPEG.
    #[arg(long, short = 'o', value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub output: PathBuf,
}
