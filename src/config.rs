use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Social book-sharing backend.
#[derive(Parser, Debug, Clone)]
#[command(name = "book-network")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file.
    #[arg(short, long, env = "BOOK_NETWORK_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the server (default if no command given).
    Serve {
        /// Address to bind the server to.
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },

    /// User management commands.
    User {
        /// User subcommand action.
        #[command(subcommand)]
        action: UserCommand,
    },

    /// Initialize database and create default config.
    Init {
        /// Force overwrite existing config.
        #[arg(short, long)]
        force: bool,
    },
}

/// User management subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum UserCommand {
    /// Add a new, already activated user.
    Add {
        /// Email used to log in.
        email: String,
        /// First name.
        #[arg(long, default_value = "")]
        firstname: String,
        /// Last name.
        #[arg(long, default_value = "")]
        lastname: String,
        /// Password (will prompt if not provided).
        #[arg(short, long)]
        password: Option<String>,
        /// User role (admin or user).
        #[arg(short, long, default_value = "user")]
        role: String,
    },

    /// Delete a user.
    Del {
        /// Email of the user to delete.
        email: String,
    },

    /// List all users.
    List,

    /// Change user password.
    Passwd {
        /// Email of the user.
        email: String,
        /// New password (will prompt if not provided).
        #[arg(short, long)]
        password: Option<String>,
    },

    /// Activate an account without an activation code.
    Activate {
        /// Email of the user.
        email: String,
    },

    /// Lock an account; it can no longer log in and its sessions stop working.
    Lock {
        /// Email of the user.
        email: String,
    },

    /// Unlock a previously locked account.
    Unlock {
        /// Email of the user.
        email: String,
    },
}

/// Main configuration from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Authentication configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// File storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Outgoing mail configuration.
    #[serde(default)]
    pub mail: MailConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Network name shown on the index page.
    #[serde(default = "default_title")]
    pub title: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            title: default_title(),
        }
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::new(
        std::net::IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0)),
        8088,
    )
}

fn default_title() -> String {
    "Book Social Network".to_string()
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/book-network.db")
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Registration mode: "open", "disabled".
    #[serde(default = "default_registration")]
    pub registration: String,

    /// Session token duration in days.
    #[serde(default = "default_session_days")]
    pub session_days: u32,

    /// Activation code validity in minutes.
    #[serde(default = "default_activation_minutes")]
    pub activation_minutes: u32,

    /// Interval between expired-session purges in seconds (0 to disable).
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            registration: default_registration(),
            session_days: default_session_days(),
            activation_minutes: default_activation_minutes(),
            cleanup_interval_seconds: default_cleanup_interval(),
        }
    }
}

fn default_registration() -> String {
    "open".to_string()
}

fn default_session_days() -> u32 {
    1
}

fn default_activation_minutes() -> u32 {
    15
}

fn default_cleanup_interval() -> u64 {
    3600
}

impl AuthConfig {
    /// Check if registration is enabled.
    pub fn registration_enabled(&self) -> bool {
        self.registration == "open"
    }
}

/// File storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for uploaded covers.
    #[serde(default = "default_covers_dir")]
    pub covers_dir: PathBuf,

    /// Largest accepted cover upload in bytes.
    #[serde(default = "default_max_cover_bytes")]
    pub max_cover_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            covers_dir: default_covers_dir(),
            max_cover_bytes: default_max_cover_bytes(),
        }
    }
}

fn default_covers_dir() -> PathBuf {
    PathBuf::from("data/uploads")
}

fn default_max_cover_bytes() -> usize {
    5 * 1024 * 1024
}

/// Outgoing mail configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    /// Sender address.
    #[serde(default = "default_mail_from")]
    pub from: String,

    /// Link included in activation mails.
    #[serde(default = "default_activation_url")]
    pub activation_url: String,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            from: default_mail_from(),
            activation_url: default_activation_url(),
        }
    }
}

fn default_mail_from() -> String {
    "no-reply@book-network.local".to_string()
}

fn default_activation_url() -> String {
    "http://localhost:4200/activate-account".to_string()
}

impl Config {
    /// Load configuration from file.
    pub fn load(path: &PathBuf) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::error::AppError::Config(format!("Failed to read config file: {}", e))
        })?;

        toml::from_str(&content).map_err(|e| {
            crate::error::AppError::Config(format!("Failed to parse config file: {}", e))
        })
    }

    /// Find config file in default locations.
    pub fn find_config_file() -> Option<PathBuf> {
        let candidates = [
            PathBuf::from("config.toml"),
            PathBuf::from("book-network.toml"),
            dirs::config_dir()
                .map(|p| p.join("book-network").join("config.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/book-network/config.toml"),
        ];

        candidates.into_iter().find(|p| p.exists())
    }

    /// Generate default config file content.
    pub fn generate_default() -> String {
        r#"# book-network configuration

[server]
bind = "0.0.0.0:8088"
title = "Book Social Network"

[database]
# path = "/var/lib/book-network/book-network.db"

[auth]
# Registration mode: "open" or "disabled"
registration = "open"
# Session duration in days
session_days = 1
# Activation code validity in minutes
activation_minutes = 15
# Expired session purge interval in seconds (0 to disable)
cleanup_interval_seconds = 3600

[storage]
# covers_dir = "/var/lib/book-network/uploads"
max_cover_bytes = 5242880

[mail]
from = "no-reply@book-network.local"
activation_url = "http://localhost:4200/activate-account"
"#
        .to_string()
    }
}
