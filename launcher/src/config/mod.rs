//! Configuration module for the AppVM launcher
//!
//! Supports configuration via:
//! - YAML/TOML config files
//! - Environment variables (with APPVM_ prefix)
//! - Command line overrides in the CLI

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Main launcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional JSON log file, in addition to stderr
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Per-user session settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Container images per application family
    #[serde(default)]
    pub images: ImageConfig,

    /// Container runtime settings
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Message broker settings
    #[serde(default)]
    pub broker: BrokerConfig,
}

/// Settings applied to every user session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Unix user the application runs as inside the container
    #[serde(default = "default_unix_user")]
    pub unix_user: String,

    /// Root of the per-domain, per-user file trees on the host
    #[serde(default = "default_users_files_path")]
    pub users_files_path: PathBuf,

    /// Locale used when the request does not carry one
    #[serde(default = "default_lang")]
    pub default_lang: String,

    /// Display width used when the request does not carry one
    #[serde(default = "default_width")]
    pub default_width: u32,

    /// Display height used when the request does not carry one
    #[serde(default = "default_height")]
    pub default_height: u32,
}

/// Image references per application family
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Word processing, presentation and spreadsheet applications
    #[serde(default = "default_office_image")]
    pub office: String,

    /// Mail client
    #[serde(default = "default_mail_image")]
    pub mail: String,

    /// Image editor
    #[serde(default = "default_editor_image")]
    pub editor: String,
}

/// Container runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Generic runtime executable name
    #[serde(default = "default_runtime_binary")]
    pub binary: String,

    /// Version suffix of a pinned runtime executable (`docker-<version>`)
    #[serde(default)]
    pub version: Option<String>,

    /// Directory where versioned runtime executables are installed
    #[serde(default = "default_install_dir")]
    pub install_dir: PathBuf,

    /// Memory and memory+swap cap for every session container
    #[serde(default = "default_max_memory")]
    pub max_memory: String,

    /// Extra runtime arguments, as a JSON array encoded in a string
    #[serde(default = "default_extra_args")]
    pub extra_args: String,

    /// Label attached to every session container
    #[serde(default = "default_container_label")]
    pub container_label: String,

    /// Entry script executed inside the container
    #[serde(default = "default_entry_command")]
    pub entry_command: String,

    /// Launcher prefix prepended to the application command inside the container
    #[serde(default = "default_app_launcher")]
    pub app_launcher: Vec<String>,

    /// Maximum time for the container run command, in seconds
    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: u64,

    /// Maximum time for the port query command, in seconds
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
}

/// Message broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Externally-known bus address of this launcher
    #[serde(default = "default_broker_host")]
    pub host: String,

    /// AMQP port used to provision subscriptions
    #[serde(default = "default_amqp_port")]
    pub amqp_port: u16,

    /// AMQP login used when the request carries none
    #[serde(default = "default_broker_login")]
    pub login: String,

    /// AMQP password used when the request carries none
    #[serde(default = "default_broker_login")]
    pub password: String,

    /// STOMP port clients subscribe on
    #[serde(default = "default_stomp_port")]
    pub stomp_port: u16,

    /// Maximum time for each broker operation, in seconds
    #[serde(default = "default_broker_timeout")]
    pub timeout_secs: u64,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_unix_user() -> String {
    "user".to_string()
}

fn default_users_files_path() -> PathBuf {
    PathBuf::from("/mnt/rawFS/users/")
}

fn default_lang() -> String {
    "en_US.UTF-8".to_string()
}

fn default_width() -> u32 {
    1024
}

fn default_height() -> u32 {
    768
}

fn default_office_image() -> String {
    "eyeos/open365-office:latest".to_string()
}

fn default_mail_image() -> String {
    "eyeos/open365-mail:latest".to_string()
}

fn default_editor_image() -> String {
    "eyeos/open365-gimp:latest".to_string()
}

fn default_runtime_binary() -> String {
    "docker".to_string()
}

fn default_install_dir() -> PathBuf {
    PathBuf::from("/usr/local/bin")
}

fn default_max_memory() -> String {
    "600M".to_string()
}

fn default_extra_args() -> String {
    "[]".to_string()
}

fn default_container_label() -> String {
    "com.eyeos.container-type=user-application".to_string()
}

fn default_entry_command() -> String {
    "exec.sh".to_string()
}

fn default_app_launcher() -> Vec<String> {
    vec!["node".to_string(), "/root/start.js".to_string()]
}

fn default_run_timeout() -> u64 {
    120
}

fn default_query_timeout() -> u64 {
    30
}

fn default_broker_host() -> String {
    "127.0.0.1".to_string()
}

fn default_amqp_port() -> u16 {
    5672
}

fn default_broker_login() -> String {
    "guest".to_string()
}

fn default_stomp_port() -> u16 {
    61613
}

fn default_broker_timeout() -> u64 {
    10
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            unix_user: default_unix_user(),
            users_files_path: default_users_files_path(),
            default_lang: default_lang(),
            default_width: default_width(),
            default_height: default_height(),
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            office: default_office_image(),
            mail: default_mail_image(),
            editor: default_editor_image(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            binary: default_runtime_binary(),
            version: None,
            install_dir: default_install_dir(),
            max_memory: default_max_memory(),
            extra_args: default_extra_args(),
            container_label: default_container_label(),
            entry_command: default_entry_command(),
            app_launcher: default_app_launcher(),
            run_timeout_secs: default_run_timeout(),
            query_timeout_secs: default_query_timeout(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            amqp_port: default_amqp_port(),
            login: default_broker_login(),
            password: default_broker_login(),
            stomp_port: default_stomp_port(),
            timeout_secs: default_broker_timeout(),
        }
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_file: None,
            session: SessionConfig::default(),
            images: ImageConfig::default(),
            runtime: RuntimeConfig::default(),
            broker: BrokerConfig::default(),
        }
    }
}

impl LauncherConfig {
    /// Load configuration from file and environment variables
    pub fn load() -> Result<Self> {
        // Try to load .env file if present
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            // Start with defaults
            .add_source(config::Config::try_from(&LauncherConfig::default())?)
            .add_source(config::File::with_name("config/appvm").required(false))
            .add_source(config::File::with_name("/etc/appvm/config").required(false))
            // Override with environment variables (APPVM_ prefix)
            .add_source(
                config::Environment::with_prefix("APPVM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let launcher_config: LauncherConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        launcher_config.validate()?;

        Ok(launcher_config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.broker.host.trim().is_empty() {
            anyhow::bail!("Broker host cannot be empty");
        }

        if self.broker.stomp_port == 0 {
            anyhow::bail!("STOMP port cannot be 0");
        }

        if self.runtime.max_memory.trim().is_empty() {
            anyhow::bail!("Container memory limit cannot be empty");
        }

        if self.runtime.binary.trim().is_empty() {
            anyhow::bail!("Runtime binary name cannot be empty");
        }

        if self.broker.timeout_secs == 0
            || self.runtime.run_timeout_secs == 0
            || self.runtime.query_timeout_secs == 0
        {
            anyhow::bail!("Timeouts cannot be 0");
        }

        Ok(())
    }

    /// Extra runtime arguments, inserted verbatim before the image reference.
    ///
    /// A malformed value is logged and treated as an empty list.
    pub fn extra_runtime_args(&self) -> Vec<String> {
        match serde_json::from_str::<serde_json::Value>(&self.runtime.extra_args) {
            Ok(serde_json::Value::Array(items)) => {
                let args: Option<Vec<String>> = items
                    .into_iter()
                    .map(|item| match item {
                        serde_json::Value::String(s) => Some(s),
                        _ => None,
                    })
                    .collect();
                args.unwrap_or_else(|| {
                    warn!(
                        extra_args = %self.runtime.extra_args,
                        "Extra runtime arguments must all be strings, ignoring them"
                    );
                    Vec::new()
                })
            }
            Ok(_) => {
                warn!(
                    extra_args = %self.runtime.extra_args,
                    "Extra runtime arguments are valid JSON but not an array, ignoring them"
                );
                Vec::new()
            }
            Err(e) => {
                warn!(
                    extra_args = %self.runtime.extra_args,
                    error = %e,
                    "Extra runtime arguments are not a valid JSON array, ignoring them"
                );
                Vec::new()
            }
        }
    }
}
