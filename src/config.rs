use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Prefix for environment variables that override file configuration
const ENV_PREFIX: &str = "KERNELGATE_";

/// Host used to reach the kernel server when no `--ip` argument is configured
const DEFAULT_BACKEND_HOST: &str = "127.0.0.1";

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and connection pool settings
    #[serde(default)]
    pub server: ServerConfig,

    /// How the kernel server process is launched and reached
    #[serde(default)]
    pub backend: BackendConfig,

    /// Optional surfaces
    #[serde(default)]
    pub features: FeatureConfig,

    /// Terminal session settings
    #[serde(default)]
    pub terminal: TerminalConfig,

    /// Log destinations
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listening port (default: 8081)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Maximum idle connections per upstream host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Maximum time to wait for an upstream response (default: 300)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Configuration for the supervised kernel server process
///
/// # Security Warning
///
/// `command` and `args` are executed directly. Configuration files must be
/// protected with appropriate file permissions.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Executable to launch (default: jupyter)
    #[serde(default = "default_backend_command")]
    pub command: String,

    /// Fixed subcommand placed before the configured arguments (default: notebook)
    #[serde(default = "default_backend_subcommand")]
    pub subcommand: String,

    /// Extra launch arguments. An `--ip="<addr>"` entry also sets the address
    /// the gateway uses to reach the process.
    #[serde(default)]
    pub args: Vec<String>,

    /// Directory served as the notebook root
    #[serde(default = "default_content_root")]
    pub root_dir: String,

    /// Directory the file browser opens in, and the terminal working directory
    #[serde(default = "default_content_root")]
    pub content_dir: String,

    /// First port tried when picking a listening port for the process
    #[serde(default = "default_backend_port")]
    pub port: u16,

    /// How long to wait for the process to accept TCP connections (default: 15)
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Fixed host for kernel websocket sessions (overrides the backend address)
    pub kernel_manager_host: Option<String>,

    /// Fixed port for kernel websocket sessions (overrides the backend port)
    pub kernel_manager_port: Option<u16>,
}

impl BackendConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    /// Address the kernel server listens on, taken from an `--ip="<addr>"` argument
    pub fn bind_host(&self) -> String {
        self.args
            .iter()
            .filter_map(|arg| arg.strip_prefix("--ip="))
            .map(|value| value.trim_matches(|c| c == '"' || c == '\''))
            .find(|value| !value.is_empty())
            .map(String::from)
            .unwrap_or_else(|| DEFAULT_BACKEND_HOST.to_string())
    }

    /// Host and port kernel sessions connect to
    pub fn kernel_target(&self) -> (String, u16) {
        match (&self.kernel_manager_host, self.kernel_manager_port) {
            (Some(host), Some(port)) => (host.clone(), port),
            _ => (self.bind_host(), self.port),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: default_backend_command(),
            subcommand: default_backend_subcommand(),
            args: Vec::new(),
            root_dir: default_content_root(),
            content_dir: default_content_root(),
            port: default_backend_port(),
            startup_timeout_secs: default_startup_timeout(),
            kernel_manager_host: None,
            kernel_manager_port: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeatureConfig {
    /// Serve `/_proxy/<port>/...` requests from local services (default: true)
    #[serde(default = "default_true")]
    pub reverse_proxy: bool,

    /// Accept terminal sessions (default: true)
    #[serde(default = "default_true")]
    pub terminal: bool,

    /// Start a bare shell instead of a multiplexer session (default: false)
    #[serde(default)]
    pub plain_shell: bool,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            reverse_proxy: true,
            terminal: true,
            plain_shell: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TerminalConfig {
    /// Shell used when `plain_shell` is set (default: $SHELL or /bin/bash)
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Multiplexer executable (default: tmux)
    #[serde(default = "default_multiplexer")]
    pub multiplexer: String,

    /// Multiplexer session attached by every terminal connection
    #[serde(default = "default_session_name")]
    pub session_name: String,

    /// Initial terminal width
    #[serde(default = "default_cols")]
    pub cols: u16,

    /// Initial terminal height
    #[serde(default = "default_rows")]
    pub rows: u16,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            multiplexer: default_multiplexer(),
            session_name: default_session_name(),
            cols: default_cols(),
            rows: default_rows(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Filter directive used when RUST_LOG is not set
    #[serde(default = "default_log_filter")]
    pub filter: String,

    /// Also write logs to `<directory>/kernelgate.log`
    #[serde(default)]
    pub disk_log: bool,

    /// Directory for the disk log
    #[serde(default = "default_log_directory")]
    pub directory: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            disk_log: false,
            directory: default_log_directory(),
        }
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8081
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    300
}

fn default_backend_command() -> String {
    "jupyter".to_string()
}

fn default_backend_subcommand() -> String {
    "notebook".to_string()
}

fn default_content_root() -> String {
    "/content".to_string()
}

fn default_backend_port() -> u16 {
    9000
}

fn default_startup_timeout() -> u64 {
    15
}

fn default_true() -> bool {
    true
}

fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string())
}

fn default_multiplexer() -> String {
    "tmux".to_string()
}

fn default_session_name() -> String {
    "kernelgate".to_string()
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

fn default_log_filter() -> String {
    "kernelgate=info,backend=info".to_string()
}

fn default_log_directory() -> String {
    "/var/log/kernelgate".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a config file
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Config::default();
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `KERNELGATE_*` overrides, reading variables through `lookup`
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(value) = var("PORT") {
            self.server.port = parse_override("PORT", &value)?;
        }
        if let Some(value) = var("BACKEND_PORT") {
            self.backend.port = parse_override("BACKEND_PORT", &value)?;
        }
        if let Some(value) = var("BACKEND_ARGS") {
            self.backend.args = shell_words::split(&value).map_err(|e| {
                anyhow::anyhow!("Invalid {}BACKEND_ARGS: {}", ENV_PREFIX, e)
            })?;
        }
        if let Some(value) = var("KERNEL_MANAGER_HOST") {
            self.backend.kernel_manager_host = Some(value);
        }
        if let Some(value) = var("KERNEL_MANAGER_PORT") {
            self.backend.kernel_manager_port = Some(parse_override("KERNEL_MANAGER_PORT", &value)?);
        }
        if let Some(value) = var("DISK_LOG") {
            self.logging.disk_log = parse_override("DISK_LOG", &value)?;
        }

        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server: 'port' must be greater than 0".to_string());
        }
        if self.backend.command.trim().is_empty() {
            errors.push("backend: 'command' must not be empty".to_string());
        }
        if self.backend.port == 0 {
            errors.push("backend: 'port' must be greater than 0".to_string());
        }
        if self.backend.kernel_manager_host.is_some() != self.backend.kernel_manager_port.is_some() {
            errors.push(
                "backend: 'kernel_manager_host' and 'kernel_manager_port' must be set together"
                    .to_string(),
            );
        }
        if self.terminal.cols == 0 || self.terminal.rows == 0 {
            errors.push("terminal: 'cols' and 'rows' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

fn parse_override<T: std::str::FromStr>(name: &str, value: &str) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid {}{}={:?}: {}", ENV_PREFIX, name, value, e))
}
