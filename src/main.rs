//! book-network server entry point.

use book_network::{
    auth::AuthService,
    config::{Cli, Command, Config, UserCommand},
    db::{Database, timestamp_to_datetime},
    mail::{LogMailer, Mailer},
    server,
};
use clap::Parser;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().or_else(Config::find_config_file);

    let config = if let Some(ref path) = config_path {
        Config::load(path)?
    } else {
        Config::default()
    };

    match cli.command {
        Some(Command::Init { force }) => cmd_init(force).await,
        Some(Command::User { action }) => cmd_user(action, &config).await,
        Some(Command::Serve { bind }) => cmd_serve(config, bind).await,
        None => cmd_serve(config, None).await,
    }
}

/// Write a default config and create the database.
async fn cmd_init(force: bool) -> anyhow::Result<()> {
    let config_path = PathBuf::from("config.toml");

    if config_path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    std::fs::write(&config_path, Config::generate_default())?;
    println!("Created config file: {}", config_path.display());

    let config = Config::default();
    open_database(&config)?;
    println!("Initialized database: {}", config.database.path.display());

    std::fs::create_dir_all(&config.storage.covers_dir)?;
    println!("Created upload directory: {}", config.storage.covers_dir.display());

    println!("\nCreate an administrator with:");
    println!("  book-network user add <email> --firstname <name> --role admin");

    Ok(())
}

/// Account management commands.
async fn cmd_user(action: UserCommand, config: &Config) -> anyhow::Result<()> {
    let db = open_database(config)?;
    let auth = AuthService::new(db, &config.auth, &config.mail, mailer(config));

    match action {
        UserCommand::Add {
            email,
            firstname,
            lastname,
            password,
            role,
        } => {
            let password = match password {
                Some(p) => p,
                None => prompt_password("Password: ")?,
            };

            let user = auth.create_user(&email, &firstname, &lastname, &password, &role)?;
            println!(
                "Created user: {} (roles: {}, id: {})",
                user.email,
                user.roles.join(","),
                user.id
            );
        }

        UserCommand::Del { email } => {
            if auth.delete_user(&email)? {
                println!("Deleted user: {}", email);
            } else {
                println!("User not found: {}", email);
            }
        }

        UserCommand::List => {
            let users = auth.list_users()?;
            if users.is_empty() {
                println!("No users found.");
            } else {
                println!(
                    "{:<32} {:<12} {:<8} {:<36} LAST LOGIN",
                    "EMAIL", "ROLES", "STATUS", "ID"
                );
                println!("{}", "-".repeat(100));
                for user in users {
                    let last_login = user
                        .last_login
                        .map(|ts| timestamp_to_datetime(ts).format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "never".to_string());
                    let status = if user.account_locked {
                        "locked"
                    } else if user.enabled {
                        "active"
                    } else {
                        "pending"
                    };
                    println!(
                        "{:<32} {:<12} {:<8} {:<36} {}",
                        user.email,
                        user.roles.join(","),
                        status,
                        user.id,
                        last_login
                    );
                }
            }
        }

        UserCommand::Passwd { email, password } => {
            let password = match password {
                Some(p) => p,
                None => prompt_password("New password: ")?,
            };

            if auth.change_password(&email, &password)? {
                println!("Password changed for: {}", email);
            } else {
                println!("User not found: {}", email);
            }
        }

        UserCommand::Lock { email } => {
            if auth.set_account_locked(&email, true)? {
                println!("Locked: {}", email);
            } else {
                println!("User not found: {}", email);
            }
        }

        UserCommand::Unlock { email } => {
            if auth.set_account_locked(&email, false)? {
                println!("Unlocked: {}", email);
            } else {
                println!("User not found: {}", email);
            }
        }

        UserCommand::Activate { email } => {
            if auth.force_activate(&email)? {
                println!("Activated: {}", email);
            } else {
                println!("User not found: {}", email);
            }
        }
    }

    Ok(())
}

/// Start the server.
async fn cmd_serve(mut config: Config, bind: Option<std::net::SocketAddr>) -> anyhow::Result<()> {
    if let Some(addr) = bind {
        config.server.bind = addr;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "book_network=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let db = open_database(&config)?;
    let auth = AuthService::new(db.clone(), &config.auth, &config.mail, mailer(&config));

    tracing::info!(
        bind = %config.server.bind,
        database = %config.database.path.display(),
        covers = %config.storage.covers_dir.display(),
        registration = config.auth.registration_enabled(),
        "Starting book-network server"
    );

    let bind = config.server.bind;
    let state = server::AppState::new_with_db(config, db, auth);
    state.start_session_cleanup();

    let app = server::create_router(state);

    let listener = TcpListener::bind(bind).await?;
    tracing::info!(address = %bind, "Server listening");

    axum::serve(listener, app).await?;

    Ok(())
}

fn open_database(config: &Config) -> anyhow::Result<Database> {
    if let Some(parent) = config.database.path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(Database::open(&config.database.path)?)
}

fn mailer(config: &Config) -> Arc<dyn Mailer> {
    Arc::new(LogMailer::new(&config.mail))
}

/// Prompt for password input.
fn prompt_password(prompt: &str) -> anyhow::Result<String> {
    print!("{}", prompt);
    io::stdout().flush()?;

    let mut password = String::new();
    io::stdin().read_line(&mut password)?;

    Ok(password.trim().to_string())
}
