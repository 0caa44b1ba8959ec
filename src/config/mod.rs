//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{
    env,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::{
    pool::PoolConfig,
    worker::WorkerCommand,
};

pub use cli::{
    CliArgs, Command, LoggingOverrides, PoolOverrides, RenderArgs, ServeArgs, ServeOverrides,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "rasterd";
const ENV_PREFIX: &str = "RASTERD";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8082;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 60;
const DEFAULT_POOL_MIN_IDLE: usize = 4;
const DEFAULT_POOL_MAX_IDLE: usize = 4;
const DEFAULT_POOL_MAX_TOTAL: usize = 4;
const DEFAULT_WORKER_PROGRAM: &str = "rasterd-worker";
const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_LEASE_TIMEOUT_SECS: u64 = 180;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30 * 60;
const DEFAULT_MAINTENANCE_INTERVAL_MS: u64 = 1_000;
const DEFAULT_MAX_WAITERS: usize = 64;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;
const DEFAULT_SPAWN_BACKOFF_INITIAL_MS: u64 = 500;
const DEFAULT_SPAWN_BACKOFF_MAX_MS: u64 = 30_000;
const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MAX_DPI: u32 = 1_200;
const DEFAULT_JPEG_QUALITY: u8 = 85;
const DEFAULT_MAX_DOCUMENT_BYTES: u64 = 64 * 1024 * 1024;

/// Environment variable through which workers learn where PDFium lives.
pub const PDFIUM_LIBRARY_ENV: &str = "RASTERD_PDFIUM_LIBRARY";

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub pool: PoolSettings,
    pub render: RenderSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
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
pub struct PoolSettings {
    pub min_idle: usize,
    pub max_idle: usize,
    pub max_total: usize,
    pub worker_program: PathBuf,
    pub worker_args: Vec<String>,
    pub pdfium_library: Option<PathBuf>,
    pub startup_timeout: Duration,
    pub lease_timeout: Duration,
    pub idle_timeout: Duration,
    pub maintenance_interval: Duration,
    pub max_waiters: usize,
    pub shutdown_grace: Duration,
    pub spawn_backoff_initial: Duration,
    pub spawn_backoff_max: Duration,
}

impl PoolSettings {
    pub fn worker_command(&self) -> WorkerCommand {
        let mut command = WorkerCommand::new(&self.worker_program);
        for arg in &self.worker_args {
            command = command.arg(arg);
        }
        if let Some(library) = &self.pdfium_library {
            command = command.env(PDFIUM_LIBRARY_ENV, library);
        }
        command
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            min_idle: self.min_idle,
            max_idle: self.max_idle,
            max_total: self.max_total,
            command: self.worker_command(),
            startup_timeout: self.startup_timeout,
            lease_timeout: self.lease_timeout,
            idle_timeout: self.idle_timeout,
            maintenance_interval: self.maintenance_interval,
            max_waiters: self.max_waiters,
            spawn_backoff_initial: self.spawn_backoff_initial,
            spawn_backoff_max: self.spawn_backoff_max,
        }
    }

    /// Pool configuration for a single command-line render: nothing is kept
    /// warm, but maintenance still runs so `lease_timeout` is enforced.
    pub fn one_off_pool_config(&self) -> PoolConfig {
        PoolConfig {
            min_idle: 0,
            ..self.pool_config()
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub acquire_timeout: Duration,
    pub call_timeout: Duration,
    pub max_dpi: u32,
    pub jpeg_quality: u8,
    pub max_document_bytes: usize,
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

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .list_separator(" ")
            .with_list_parse_key("pool.worker_args")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Render(args)) => {
            raw.apply_logging_overrides(&args.logging);
            raw.apply_pool_overrides(&args.pool);
        }
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
    pool: RawPoolSettings,
    render: RawRenderSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(max_dpi) = overrides.render_max_dpi {
            self.render.max_dpi = Some(max_dpi);
        }
        if let Some(bytes) = overrides.render_max_document_bytes {
            self.render.max_document_bytes = Some(bytes);
        }
        if let Some(seconds) = overrides.render_acquire_timeout_seconds {
            self.render.acquire_timeout_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.render_call_timeout_seconds {
            self.render.call_timeout_seconds = Some(seconds);
        }
        if let Some(quality) = overrides.render_jpeg_quality {
            self.render.jpeg_quality = Some(quality);
        }

        self.apply_logging_overrides(&overrides.logging);
        self.apply_pool_overrides(&overrides.pool);
    }

    fn apply_logging_overrides(&mut self, overrides: &LoggingOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }

    fn apply_pool_overrides(&mut self, overrides: &PoolOverrides) {
        if let Some(value) = overrides.min_idle {
            self.pool.min_idle = Some(value);
        }
        if let Some(value) = overrides.max_idle {
            self.pool.max_idle = Some(value);
        }
        if let Some(value) = overrides.max_total {
            self.pool.max_total = Some(value);
        }
        if let Some(program) = overrides.worker_program.as_ref() {
            self.pool.worker_program = Some(program.clone());
        }
        if let Some(library) = overrides.pdfium_library.as_ref() {
            self.pool.pdfium_library = Some(library.clone());
        }
        if let Some(seconds) = overrides.lease_timeout_seconds {
            self.pool.lease_timeout_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.startup_timeout_seconds {
            self.pool.startup_timeout_seconds = Some(seconds);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            pool,
            render,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let pool = build_pool_settings(pool)?;
        let render = build_render_settings(render)?;

        Ok(Self {
            server,
            logging,
            pool,
            render,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_shutdown = positive_duration(
        server
            .graceful_shutdown_seconds
            .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS),
        Duration::from_secs,
        "server.graceful_shutdown_seconds",
    )?;

    Ok(ServerSettings {
        addr,
        graceful_shutdown,
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

fn build_pool_settings(pool: RawPoolSettings) -> Result<PoolSettings, LoadError> {
    let min_idle = pool.min_idle.unwrap_or(DEFAULT_POOL_MIN_IDLE);
    let max_idle = pool.max_idle.unwrap_or(DEFAULT_POOL_MAX_IDLE);
    let max_total = pool.max_total.unwrap_or(DEFAULT_POOL_MAX_TOTAL);

    if min_idle > max_idle {
        return Err(LoadError::invalid(
            "pool.min_idle",
            format!("{min_idle} exceeds pool.max_idle ({max_idle})"),
        ));
    }
    if max_idle > max_total {
        return Err(LoadError::invalid(
            "pool.max_idle",
            format!("{max_idle} exceeds pool.max_total ({max_total})"),
        ));
    }

    let worker_program = pool
        .worker_program
        .unwrap_or_else(default_worker_program);
    if worker_program.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "pool.worker_program",
            "path must not be empty",
        ));
    }

    let pdfium_library = pool
        .pdfium_library
        .filter(|path| !path.as_os_str().is_empty());

    let spawn_backoff_initial = positive_duration(
        pool.spawn_backoff_initial_ms
            .unwrap_or(DEFAULT_SPAWN_BACKOFF_INITIAL_MS),
        Duration::from_millis,
        "pool.spawn_backoff_initial_ms",
    )?;
    let spawn_backoff_max = positive_duration(
        pool.spawn_backoff_max_ms
            .unwrap_or(DEFAULT_SPAWN_BACKOFF_MAX_MS),
        Duration::from_millis,
        "pool.spawn_backoff_max_ms",
    )?;
    if spawn_backoff_initial > spawn_backoff_max {
        return Err(LoadError::invalid(
            "pool.spawn_backoff_initial_ms",
            "must not exceed pool.spawn_backoff_max_ms",
        ));
    }

    Ok(PoolSettings {
        min_idle,
        max_idle,
        max_total,
        worker_program,
        worker_args: pool.worker_args.unwrap_or_default(),
        pdfium_library,
        startup_timeout: positive_duration(
            pool.startup_timeout_seconds
                .unwrap_or(DEFAULT_STARTUP_TIMEOUT_SECS),
            Duration::from_secs,
            "pool.startup_timeout_seconds",
        )?,
        lease_timeout: positive_duration(
            pool.lease_timeout_seconds
                .unwrap_or(DEFAULT_LEASE_TIMEOUT_SECS),
            Duration::from_secs,
            "pool.lease_timeout_seconds",
        )?,
        idle_timeout: positive_duration(
            pool.idle_timeout_seconds
                .unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS),
            Duration::from_secs,
            "pool.idle_timeout_seconds",
        )?,
        maintenance_interval: positive_duration(
            pool.maintenance_interval_ms
                .unwrap_or(DEFAULT_MAINTENANCE_INTERVAL_MS),
            Duration::from_millis,
            "pool.maintenance_interval_ms",
        )?,
        max_waiters: pool.max_waiters.unwrap_or(DEFAULT_MAX_WAITERS),
        shutdown_grace: Duration::from_secs(
            pool.shutdown_grace_seconds
                .unwrap_or(DEFAULT_SHUTDOWN_GRACE_SECS),
        ),
        spawn_backoff_initial,
        spawn_backoff_max,
    })
}

fn build_render_settings(render: RawRenderSettings) -> Result<RenderSettings, LoadError> {
    let max_dpi = render.max_dpi.unwrap_or(DEFAULT_MAX_DPI);
    if max_dpi == 0 {
        return Err(LoadError::invalid(
            "render.max_dpi",
            "must be greater than zero",
        ));
    }

    let jpeg_quality = render.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY);
    if !(1..=100).contains(&jpeg_quality) {
        return Err(LoadError::invalid(
            "render.jpeg_quality",
            "must be between 1 and 100",
        ));
    }

    let max_document_bytes_value = render
        .max_document_bytes
        .unwrap_or(DEFAULT_MAX_DOCUMENT_BYTES);
    if max_document_bytes_value == 0 {
        return Err(LoadError::invalid(
            "render.max_document_bytes",
            "must be greater than zero",
        ));
    }
    let max_document_bytes = usize::try_from(max_document_bytes_value).map_err(|_| {
        LoadError::invalid(
            "render.max_document_bytes",
            "value exceeds supported range for usize",
        )
    })?;

    Ok(RenderSettings {
        acquire_timeout: positive_duration(
            render
                .acquire_timeout_seconds
                .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            Duration::from_secs,
            "render.acquire_timeout_seconds",
        )?,
        call_timeout: positive_duration(
            render
                .call_timeout_seconds
                .unwrap_or(DEFAULT_CALL_TIMEOUT_SECS),
            Duration::from_secs,
            "render.call_timeout_seconds",
        )?,
        max_dpi,
        jpeg_quality,
        max_document_bytes,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
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
struct RawPoolSettings {
    min_idle: Option<usize>,
    max_idle: Option<usize>,
    max_total: Option<usize>,
    worker_program: Option<PathBuf>,
    worker_args: Option<Vec<String>>,
    pdfium_library: Option<PathBuf>,
    startup_timeout_seconds: Option<u64>,
    lease_timeout_seconds: Option<u64>,
    idle_timeout_seconds: Option<u64>,
    maintenance_interval_ms: Option<u64>,
    max_waiters: Option<usize>,
    shutdown_grace_seconds: Option<u64>,
    spawn_backoff_initial_ms: Option<u64>,
    spawn_backoff_max_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    acquire_timeout_seconds: Option<u64>,
    call_timeout_seconds: Option<u64>,
    max_dpi: Option<u32>,
    jpeg_quality: Option<u8>,
    max_document_bytes: Option<u64>,
}

/// `rasterd-worker` next to the running executable, else whatever `PATH` finds.
fn default_worker_program() -> PathBuf {
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(DEFAULT_WORKER_PROGRAM)))
        .filter(|candidate| is_file(candidate))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKER_PROGRAM))
}

fn is_file(path: &Path) -> bool {
    path.metadata().is_ok_and(|meta| meta.is_file())
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn positive_duration(
    value: u64,
    unit: fn(u64) -> Duration,
    key: &'static str,
) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(unit(value))
}
