//! Configuration module for arraybench.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::client::ClientConfig;
use crate::error::ConfigError;
use crate::protocol::DEFAULT_MAX_FRAME_LEN;
use crate::runtime::{ClientLimit, EngineKind, EngineSettings, DEFAULT_INITIAL_CAPACITY};
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "arraybench")]
#[command(version = "0.1.0")]
#[command(about = "Benchmark blocking, readiness and completion TCP servers", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate load against a running server
    Client(ClientArgs),
    /// Thread-per-connection server
    Blocking(ServerArgs),
    /// Readiness-based server (epoll/kqueue)
    Nonblocking(ServerArgs),
    /// Completion-based server (io_uring, Linux only)
    Async(AsyncArgs),
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Server host
    #[arg(long)]
    pub host: Option<String>,

    /// Server port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of integers per request
    #[arg(short = 's', long)]
    pub payload_size: Option<usize>,

    /// Delay between requests in milliseconds
    #[arg(short, long)]
    pub delay_ms: Option<u64>,

    /// Requests per connection
    #[arg(short, long)]
    pub requests: Option<usize>,

    /// Concurrent connections
    #[arg(long)]
    pub connections: Option<usize>,
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Address to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Serve this many clients, then exit (serves forever when absent)
    #[arg(short = 'n', long)]
    pub clients: Option<usize>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short, long)]
    pub workers: Option<usize>,
}

#[derive(Args, Debug)]
pub struct AsyncArgs {
    #[command(flatten)]
    pub server: ServerArgs,

    /// Number of io_uring dispatcher threads
    #[arg(long)]
    pub dispatchers: Option<usize>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub reactor: ReactorConfig,
    #[serde(default, rename = "async")]
    pub uring: AsyncConfig,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Clients to serve before exiting; absent means unbounded
    pub clients: Option<usize>,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Initial per-connection buffer size in bytes
    #[serde(default = "default_initial_buffer")]
    pub initial_buffer: usize,
    /// Largest accepted request payload in bytes
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_port(),
            clients: None,
            workers: None,
            initial_buffer: default_initial_buffer(),
            max_frame_len: default_max_frame_len(),
        }
    }
}

/// Readiness engine configuration
#[derive(Debug, Deserialize)]
pub struct ReactorConfig {
    /// Events fetched per poll
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            event_capacity: default_event_capacity(),
        }
    }
}

/// Completion engine configuration
#[derive(Debug, Deserialize)]
pub struct AsyncConfig {
    #[serde(default = "default_dispatchers")]
    pub dispatchers: usize,
    /// Submission queue entries per ring
    #[serde(default = "default_ring_entries")]
    pub ring_entries: u32,
}

impl Default for AsyncConfig {
    fn default() -> Self {
        Self {
            dispatchers: default_dispatchers(),
            ring_entries: default_ring_entries(),
        }
    }
}

/// Client configuration
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_client_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_payload_size")]
    pub payload_size: usize,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_requests")]
    pub requests: usize,
    #[serde(default = "default_connections")]
    pub connections: usize,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            host: default_client_host(),
            port: default_port(),
            payload_size: default_payload_size(),
            delay_ms: default_delay_ms(),
            requests: default_requests(),
            connections: default_connections(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

fn default_client_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4444
}

fn default_initial_buffer() -> usize {
    DEFAULT_INITIAL_CAPACITY
}

fn default_max_frame_len() -> usize {
    DEFAULT_MAX_FRAME_LEN
}

fn default_event_capacity() -> usize {
    1024
}

fn default_dispatchers() -> usize {
    1
}

fn default_ring_entries() -> u32 {
    256
}

fn default_payload_size() -> usize {
    4096
}

fn default_delay_ms() -> u64 {
    10
}

fn default_requests() -> usize {
    10
}

fn default_connections() -> usize {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

/// What the process runs.
#[derive(Debug, Clone)]
pub enum Mode {
    Client(ClientConfig),
    Server {
        kind: EngineKind,
        settings: EngineSettings,
        limit: ClientLimit,
    },
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over TOML values and validate the result.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let log_level = cli
            .log_level
            .unwrap_or_else(|| toml_config.logging.level.clone());

        let mode = match cli.command {
            Command::Client(args) => Mode::Client(client_config(args, toml_config.client)?),
            Command::Blocking(args) => server_mode(EngineKind::Blocking, args, None, &toml_config)?,
            Command::Nonblocking(args) => server_mode(EngineKind::Reactor, args, None, &toml_config)?,
            Command::Async(args) => {
                server_mode(EngineKind::Async, args.server, args.dispatchers, &toml_config)?
            }
        };

        Ok(Config { mode, log_level })
    }
}

fn client_config(args: ClientArgs, file: ClientSection) -> Result<ClientConfig, ConfigError> {
    let config = ClientConfig {
        host: args.host.unwrap_or(file.host),
        port: args.port.unwrap_or(file.port),
        payload_size: args.payload_size.unwrap_or(file.payload_size),
        delay: Duration::from_millis(args.delay_ms.unwrap_or(file.delay_ms)),
        requests: args.requests.unwrap_or(file.requests),
        connections: args.connections.unwrap_or(file.connections),
    };

    // An empty array encodes to a zero-length frame, which servers read as
    // the end of the session
    if config.payload_size == 0 {
        return Err(ConfigError::Invalid("payload size must be at least 1".into()));
    }
    if config.payload_size > i32::MAX as usize {
        return Err(ConfigError::Invalid(format!(
            "payload size {} exceeds {}",
            config.payload_size,
            i32::MAX
        )));
    }
    if config.connections == 0 {
        return Err(ConfigError::Invalid("connections must be at least 1".into()));
    }
    Ok(config)
}

fn server_mode(
    kind: EngineKind,
    args: ServerArgs,
    dispatchers: Option<usize>,
    file: &TomlConfig,
) -> Result<Mode, ConfigError> {
    let host = args.host.as_deref().unwrap_or(&file.server.host);
    let ip: IpAddr = host
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("invalid bind address '{host}'")))?;
    let port = args.port.unwrap_or(file.server.port);

    let mut settings = EngineSettings::new(SocketAddr::new(ip, port));
    if let Some(workers) = args.workers.or(file.server.workers) {
        if workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        settings.workers = workers;
    }
    settings.initial_buffer = file.server.initial_buffer;
    settings.max_frame_len = file.server.max_frame_len;
    settings.event_capacity = file.reactor.event_capacity;
    settings.dispatchers = dispatchers.unwrap_or(file.uring.dispatchers);
    settings.ring_entries = file.uring.ring_entries;

    if settings.initial_buffer == 0 {
        return Err(ConfigError::Invalid("initial_buffer must be at least 1".into()));
    }
    if settings.max_frame_len > i32::MAX as usize {
        return Err(ConfigError::Invalid(format!(
            "max_frame_len {} exceeds {}",
            settings.max_frame_len,
            i32::MAX
        )));
    }
    if settings.dispatchers == 0 {
        return Err(ConfigError::Invalid("dispatchers must be at least 1".into()));
    }

    Ok(Mode::Server {
        kind,
        settings,
        limit: args.clients.or(file.server.clients).into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("arraybench").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 4444);
        assert_eq!(config.server.clients, None);
        assert_eq!(config.server.initial_buffer, 1024);
        assert_eq!(config.uring.dispatchers, 1);
        assert_eq!(config.client.host, "127.0.0.1");
        assert_eq!(config.client.payload_size, 4096);
        assert_eq!(config.client.delay_ms, 10);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 5555
            clients = 8
            workers = 4
            max_frame_len = 1048576

            [reactor]
            event_capacity = 64

            [async]
            dispatchers = 2
            ring_entries = 512

            [client]
            payload_size = 128
            connections = 4

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 5555);
        assert_eq!(config.server.clients, Some(8));
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.server.max_frame_len, 1048576);
        assert_eq!(config.server.initial_buffer, 1024);
        assert_eq!(config.reactor.event_capacity, 64);
        assert_eq!(config.uring.dispatchers, 2);
        assert_eq!(config.uring.ring_entries, 512);
        assert_eq!(config.client.payload_size, 128);
        assert_eq!(config.client.connections, 4);
        assert_eq!(config.client.requests, 10);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let file: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 5555
            clients = 8
            workers = 4
            "#,
        )
        .unwrap();

        let config = Config::merge(parse(&["nonblocking", "-p", "6000", "-n", "2"]), file).unwrap();
        match config.mode {
            Mode::Server {
                kind,
                settings,
                limit,
            } => {
                assert_eq!(kind, EngineKind::Reactor);
                assert_eq!(settings.addr.port(), 6000);
                assert_eq!(settings.workers, 4);
                assert_eq!(limit, ClientLimit::Bounded(2));
            }
            other => panic!("unexpected mode {other:?}"),
        }
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_file_log_level_with_server_mode() {
        let file: TomlConfig = toml::from_str(
            r#"
            [server]
            workers = 3

            [logging]
            level = "warn"
            "#,
        )
        .unwrap();

        let config = Config::merge(parse(&["blocking"]), file).unwrap();
        assert_eq!(config.log_level, "warn");
        match config.mode {
            Mode::Server { settings, .. } => assert_eq!(settings.workers, 3),
            other => panic!("unexpected mode {other:?}"),
        }
    }

    #[test]
    fn test_unbounded_by_default() {
        let config = Config::merge(parse(&["blocking"]), TomlConfig::default()).unwrap();
        match config.mode {
            Mode::Server { kind, settings, limit } => {
                assert_eq!(kind, EngineKind::Blocking);
                assert_eq!(settings.addr, "0.0.0.0:4444".parse().unwrap());
                assert_eq!(limit, ClientLimit::Unbounded);
            }
            other => panic!("unexpected mode {other:?}"),
        }
    }

    #[test]
    fn test_async_dispatchers() {
        let config = Config::merge(
            parse(&["--log-level", "debug", "async", "--dispatchers", "3"]),
            TomlConfig::default(),
        )
        .unwrap();
        match config.mode {
            Mode::Server { kind, settings, .. } => {
                assert_eq!(kind, EngineKind::Async);
                assert_eq!(settings.dispatchers, 3);
            }
            other => panic!("unexpected mode {other:?}"),
        }
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_client_mode() {
        let config = Config::merge(
            parse(&["client", "-s", "16", "-d", "0", "-r", "5", "--connections", "2"]),
            TomlConfig::default(),
        )
        .unwrap();
        match config.mode {
            Mode::Client(client) => {
                assert_eq!(client.host, "127.0.0.1");
                assert_eq!(client.port, 4444);
                assert_eq!(client.payload_size, 16);
                assert_eq!(client.delay, Duration::ZERO);
                assert_eq!(client.requests, 5);
                assert_eq!(client.connections, 2);
            }
            other => panic!("unexpected mode {other:?}"),
        }
    }

    #[test]
    fn test_invalid_values() {
        let err = Config::merge(parse(&["client", "-s", "0"]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = Config::merge(parse(&["blocking", "--host", "not-an-ip"]), TomlConfig::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = Config::merge(parse(&["async", "--dispatchers", "0"]), TomlConfig::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
