use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::redirect::Policy;
use secrecy::SecretString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use postwatch::commands::{read_account_list, Commands, DEFAULT_HISTORY_LIMIT};
use postwatch::config::Config;
use postwatch::engine::{Engine, Scheduler};
use postwatch::feed::HttpFeedSource;
use postwatch::notify::{LogSink, NotificationSink, WebhookSink};
use postwatch::storage::{Database, PersistenceError};

/// Get the config directory path (~/.config/postwatch/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("postwatch"))
}

fn create_redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() >= 3 {
            return attempt.error("Too many redirects (max 3)");
        }

        let url = attempt.url();
        for prev in attempt.previous() {
            if prev.as_str() == url.as_str() {
                return attempt.error("Redirect loop detected");
            }
        }

        tracing::debug!(
            from = %attempt.previous().last().map(|u| u.as_str()).unwrap_or("initial"),
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following redirect"
        );

        attempt.follow()
    })
}

#[derive(Parser, Debug)]
#[command(
    name = "postwatch",
    about = "Watch accounts for new posts and forward each one exactly once"
)]
struct Args {
    /// Config file (default: ~/.config/postwatch/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Reset database (delete and recreate)
    #[arg(long, global = true)]
    reset_db: bool,

    /// Log notifications instead of sending them to the webhook
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll every watched account until interrupted
    Watch,
    /// Start watching one or more accounts
    Add {
        names: Vec<String>,

        /// Read a JSON array of account names from FILE
        #[arg(long, value_name = "FILE")]
        from_file: Option<PathBuf>,

        /// Existing posts to deliver for each new account
        #[arg(long)]
        backfill: Option<usize>,
    },
    /// Stop watching an account
    Remove { name: String },
    /// List watched accounts
    List,
    /// Show the most recently handled posts of an account
    History {
        name: String,

        /// Number of posts to show
        #[arg(long, default_value_t = DEFAULT_HISTORY_LIMIT)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) =
            std::fs::set_permissions(&config_dir, std::fs::Permissions::from_mode(0o700))
        {
            tracing::warn!(
                path = %config_dir.display(),
                error = %e,
                "Failed to set config directory permissions to 0700"
            );
        }
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let mut config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config: {}", config_path.display()))?;
    config.apply_env();
    config.validate().context("Invalid configuration")?;
    tracing::debug!(?config, "Configuration loaded");

    let db_path = config
        .database_path
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| config_dir.join("postwatch.db"));

    if args.reset_db && db_path.exists() {
        std::fs::remove_file(&db_path).context("Failed to delete database")?;
        println!("Database reset.");
    }

    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(PersistenceError::InstanceLocked) => {
            eprintln!(
                "Error: Another instance of postwatch appears to be running. Please close it and try again."
            );
            std::process::exit(1);
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open database: {}", e)),
    };

    let request_timeout = config.request_timeout();
    let http_client = reqwest::Client::builder()
        .redirect(create_redirect_policy())
        .pool_max_idle_per_host(4)
        .pool_idle_timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(60))
        .timeout(request_timeout)
        .build()
        .context("Failed to build HTTP client")?;

    let feed_template = config.feed_url_template()?.to_string();
    let profile_template = config
        .source
        .profile_url_template
        .clone()
        .unwrap_or_else(|| feed_template.clone());
    let source = HttpFeedSource::new(
        http_client.clone(),
        feed_template,
        profile_template,
        request_timeout,
    );

    let sink: Arc<dyn NotificationSink> = match (&config.sink.webhook_url, args.dry_run) {
        (Some(url), false) => Arc::new(WebhookSink::new(
            http_client,
            SecretString::from(url.clone()),
        )),
        (None, false) => {
            tracing::warn!(
                env = Config::WEBHOOK_ENV,
                "No webhook configured, notifications go to the log"
            );
            Arc::new(LogSink)
        }
        (_, true) => Arc::new(LogSink),
    };

    let engine = Engine::new(db.clone(), Arc::new(source), sink, config.engine());

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown requested");
                cancel.cancel();
            }
        });
    }

    let result = run(args.command, engine, cancel, &config).await;
    db.close().await;
    result
}

async fn run(command: Command, engine: Engine, cancel: CancellationToken, config: &Config) -> Result<()> {
    match command {
        Command::Watch => {
            Scheduler::new(engine, cancel).run().await;
        }
        Command::Add {
            mut names,
            from_file,
            backfill,
        } => {
            if let Some(path) = from_file {
                names.extend(read_account_list(&path)?);
            }
            if names.is_empty() {
                anyhow::bail!("No account names given");
            }

            let commands = Commands::new(engine, cancel)
                .with_backfill(backfill.unwrap_or(config.initial_backfill));
            let failed = commands
                .add_many(&names)
                .await
                .iter()
                .filter(|r| r.is_err())
                .count();
            if failed > 0 {
                anyhow::bail!("{} of {} accounts could not be added", failed, names.len());
            }
        }
        Command::Remove { name } => {
            Commands::new(engine, cancel)
                .remove(&name)
                .await
                .context("Failed to remove account")?;
        }
        Command::List => {
            let accounts = Commands::new(engine, cancel)
                .list()
                .await
                .context("Failed to list accounts")?;
            for account in accounts {
                println!("{}\t{}", account.name, account.profile_url);
            }
        }
        Command::History { name, limit } => {
            let entries = Commands::new(engine, cancel)
                .history(&name, limit)
                .await
                .context("Failed to read history")?;
            let Some(entries) = entries else {
                anyhow::bail!("Not watching \"{}\"", name);
            };
            for entry in entries {
                let handled_at = chrono::DateTime::<chrono::Utc>::from_timestamp(entry.handled_at, 0)
                    .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                println!(
                    "{}\t{}\t{}\t{}",
                    handled_at,
                    entry.disposition,
                    entry.title,
                    entry.url.as_deref().unwrap_or("")
                );
            }
        }
    }
    Ok(())
}
