//! Process configuration.
//!
//! Values come from command-line flags, then `BOOMBOX_*` environment
//! variables, then an optional TOML file, then built-in defaults. The
//! resolved [`Config`] is immutable for the life of the process.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cluster::pod_spec::PodTemplate;
use crate::session::SessionSettings;
use crate::teardown::TeardownPolicy;

const DEFAULT_LISTEN: &str = ":2828";
const DEFAULT_HOST_KEY_PATH: &str = ".ssh/boombox_ed25519";
const DEFAULT_NAMESPACE: &str = "default";
const DEFAULT_IMAGE: &str = "ubuntu";
const DEFAULT_INIT_IMAGE_REPOSITORY: &str = "ivan/boombox-init";
const DEFAULT_PVC_SIZE: &str = "10Gi";
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_SIDECAR_IMAGE: &str = "docker:dind";
const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 900;
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;
const DEFAULT_EXIT_GRACE_SECS: u64 = 5;

/// Command-line and environment settings. Every field is optional so the
/// configuration file can fill what neither source sets.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct Args {
    /// Address to accept SSH connections on; a bare `:port` binds all interfaces
    #[arg(long, env = "BOOMBOX_LISTEN")]
    pub listen: Option<String>,

    /// Path of the SSH host private key
    #[arg(long, env = "BOOMBOX_HOST_KEY_PATH")]
    pub host_key_path: Option<PathBuf>,

    /// Kubernetes namespace for user pods and volumes
    #[arg(long, env = "BOOMBOX_NAMESPACE")]
    pub namespace: Option<String>,

    /// Image (tag) of the user container
    #[arg(long, env = "BOOMBOX_CONTAINER_IMAGE")]
    pub container_image: Option<String>,

    /// Repository of the pre-baked first-boot image
    #[arg(long, env = "BOOMBOX_INIT_IMAGE_REPOSITORY")]
    pub init_image_repository: Option<String>,

    /// Size of new home volumes
    #[arg(long, env = "BOOMBOX_PVC_SIZE")]
    pub pvc_size: Option<String>,

    /// Log level when RUST_LOG is not set
    #[arg(long, env = "BOOMBOX_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Run a privileged container-runtime sidecar in each pod
    #[arg(long, env = "BOOMBOX_DOCKER_SIDECAR", action = clap::ArgAction::Set)]
    pub docker_sidecar: Option<bool>,

    /// Image of the container-runtime sidecar
    #[arg(long, env = "BOOMBOX_SIDECAR_IMAGE")]
    pub sidecar_image: Option<String>,

    /// Seconds to wait for a volume or pod to become ready
    #[arg(long, env = "BOOMBOX_WAIT_TIMEOUT_SECS")]
    pub wait_timeout_secs: Option<u64>,

    /// Seconds to wait for sessions to finish on shutdown
    #[arg(long, env = "BOOMBOX_SHUTDOWN_TIMEOUT_SECS")]
    pub shutdown_timeout_secs: Option<u64>,

    /// Seconds the completion screen stays up before disconnecting
    #[arg(long, env = "BOOMBOX_EXIT_GRACE_SECS")]
    pub exit_grace_secs: Option<u64>,

    /// TOML configuration file
    #[arg(long, env = "BOOMBOX_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Configuration file contents. Keys mirror the long flag names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FileConfig {
    pub listen: Option<String>,
    pub host_key_path: Option<PathBuf>,
    pub namespace: Option<String>,
    pub container_image: Option<String>,
    pub init_image_repository: Option<String>,
    pub pvc_size: Option<String>,
    pub log_level: Option<String>,
    pub docker_sidecar: Option<bool>,
    pub sidecar_image: Option<String>,
    pub wait_timeout_secs: Option<u64>,
    pub shutdown_timeout_secs: Option<u64>,
    pub exit_grace_secs: Option<u64>,
}

impl FileConfig {
    /// Load config from a TOML file path. Returns None if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents =
            std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
                path: path.to_path_buf(),
                source,
            })?;
        let config = toml::from_str(&contents).map_err(|source| ConfigError::ParseFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Some(config))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    ReadFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {source}", .path.display())]
    ParseFailed {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid listen address {0:?}")]
    InvalidListen(String),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Resolved, validated configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub listen: SocketAddr,
    pub host_key_path: PathBuf,
    pub namespace: String,
    pub container_image: String,
    pub init_image_repository: String,
    pub pvc_size: String,
    pub log_level: String,
    pub docker_sidecar: bool,
    pub sidecar_image: String,
    pub wait_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub exit_grace: Duration,
}

impl Config {
    /// Resolve flags and environment, reading the file named by `--config`
    /// if it exists. A missing file means defaults.
    pub fn load(args: Args) -> Result<Self, ConfigError> {
        let file = match &args.config {
            Some(path) => FileConfig::load(path)?.unwrap_or_default(),
            None => FileConfig::default(),
        };
        Self::resolve(args, file)
    }

    /// Merge `args` over `file` over defaults and validate the result.
    pub fn resolve(args: Args, file: FileConfig) -> Result<Self, ConfigError> {
        let listen = args
            .listen
            .or(file.listen)
            .unwrap_or_else(|| DEFAULT_LISTEN.to_string());
        let secs = |value: Option<u64>, fallback: Option<u64>, default: u64, field| {
            let secs = value.or(fallback).unwrap_or(default);
            if secs == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
            Ok(Duration::from_secs(secs))
        };

        let config = Self {
            listen: parse_listen(&listen)?,
            host_key_path: args
                .host_key_path
                .or(file.host_key_path)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_HOST_KEY_PATH)),
            namespace: args
                .namespace
                .or(file.namespace)
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            container_image: args
                .container_image
                .or(file.container_image)
                .unwrap_or_else(|| DEFAULT_IMAGE.to_string()),
            init_image_repository: args
                .init_image_repository
                .or(file.init_image_repository)
                .unwrap_or_else(|| DEFAULT_INIT_IMAGE_REPOSITORY.to_string()),
            pvc_size: args
                .pvc_size
                .or(file.pvc_size)
                .unwrap_or_else(|| DEFAULT_PVC_SIZE.to_string()),
            log_level: args
                .log_level
                .or(file.log_level)
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            docker_sidecar: args.docker_sidecar.or(file.docker_sidecar).unwrap_or(true),
            sidecar_image: args
                .sidecar_image
                .or(file.sidecar_image)
                .unwrap_or_else(|| DEFAULT_SIDECAR_IMAGE.to_string()),
            wait_timeout: secs(
                args.wait_timeout_secs,
                file.wait_timeout_secs,
                DEFAULT_WAIT_TIMEOUT_SECS,
                "wait timeout",
            )?,
            shutdown_timeout: secs(
                args.shutdown_timeout_secs,
                file.shutdown_timeout_secs,
                DEFAULT_SHUTDOWN_TIMEOUT_SECS,
                "shutdown timeout",
            )?,
            exit_grace: secs(
                args.exit_grace_secs,
                file.exit_grace_secs,
                DEFAULT_EXIT_GRACE_SECS,
                "exit grace period",
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("namespace", &self.namespace),
            ("container image", &self.container_image),
            ("volume size", &self.pvc_size),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            image: self.container_image.clone(),
            volume_size: self.pvc_size.clone(),
            wait_timeout: self.wait_timeout,
            exit_grace: self.exit_grace,
            teardown_timeout: self.shutdown_timeout,
            teardown: TeardownPolicy::default(),
        }
    }

    pub fn pod_template(&self) -> PodTemplate {
        PodTemplate {
            namespace: self.namespace.clone(),
            init_image_repository: self.init_image_repository.clone(),
            sidecar_image: self.docker_sidecar.then(|| self.sidecar_image.clone()),
        }
    }
}

/// Parse a listen address. `:port` means every interface.
pub fn parse_listen(listen: &str) -> Result<SocketAddr, ConfigError> {
    let normalized = match listen.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => listen.to_string(),
    };
    normalized
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ConfigError::InvalidListen(listen.to_string()))
}
