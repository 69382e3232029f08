use std::collections::HashMap;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod app;
mod config;
mod db;
mod error;
mod media;
mod models;
mod poller;
mod render;
mod vendor;

use app::App;
use config::Config;
use error::{AppError, Result};
use models::{FeedId, Header, Subscription};
use vendor::SubscribeOptions;

/// Polls feeds and relays new items into chat destinations
#[derive(Parser)]
struct Args {
    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll every active subscription until interrupted
    Run,
    /// Subscribe a destination to a feed
    Subscribe {
        #[arg(allow_negative_numbers = true)]
        feed_id: FeedId,
        reference: String,
        /// Create the subscription suspended
        #[arg(long)]
        deadborn: bool,
        /// Vendor option as key=value, e.g. backfill=3
        #[arg(short, long = "option", value_parser = parse_option)]
        options: Vec<(String, String)>,
    },
    /// Stop polling a subscription
    Suspend {
        #[command(flatten)]
        header: HeaderArgs,
        /// Reason shown when listing
        #[arg(short, long)]
        reason: Option<String>,
    },
    /// Poll a suspended subscription again
    Resume {
        #[command(flatten)]
        header: HeaderArgs,
    },
    /// Remove a subscription
    Delete {
        #[command(flatten)]
        header: HeaderArgs,
    },
    /// Remove suspended subscriptions whose reason matches a LIKE pattern
    Clear {
        #[arg(allow_negative_numbers = true)]
        feed_id: FeedId,
        #[arg(default_value = "%")]
        pattern: String,
    },
    /// List subscriptions
    List {
        #[arg(short, long, allow_negative_numbers = true)]
        feed_id: Option<FeedId>,
    },
    /// Subscription counts per destination
    Stats,
}

#[derive(clap::Args)]
struct HeaderArgs {
    #[arg(allow_negative_numbers = true)]
    feed_id: FeedId,
    vendor: String,
    sub_id: String,
}

impl From<HeaderArgs> for Header {
    fn from(args: HeaderArgs) -> Self {
        Header::new(args.feed_id, args.vendor, args.sub_id)
    }
}

fn parse_option(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| format!("expected key=value, got {raw}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // INFO while serving, only warnings and errors for one-shot commands
    let level = match args.command {
        Command::Run => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    // one-shot commands edit storage only; `run` owns the poll tasks
    let serve = matches!(args.command, Command::Run);
    let app = App::new(&config, serve).await?;

    let result = execute(&app, args.command).await;
    app.shutdown().await;

    if let Err(e) = result {
        match e {
            AppError::NotFound => eprintln!("Error: no such subscription in the expected state"),
            e => eprintln!("Error: {}", e),
        }
        std::process::exit(1);
    }
    Ok(())
}

async fn execute(app: &App, command: Command) -> Result<()> {
    match command {
        Command::Run => app.run().await?,
        Command::Subscribe {
            feed_id,
            reference,
            deadborn,
            options,
        } => {
            let options = SubscribeOptions {
                deadborn,
                extra: options.into_iter().collect::<HashMap<_, _>>(),
            };
            let sub = app.subscribe(feed_id, &reference, &options).await?;
            print_subscription(&sub);
        }
        Command::Suspend { header, reason } => {
            let sub = app.suspend(&header.into(), reason.as_deref()).await?;
            print_subscription(&sub);
        }
        Command::Resume { header } => {
            let sub = app.resume(&header.into()).await?;
            print_subscription(&sub);
        }
        Command::Delete { header } => {
            let sub = app.delete(&header.into()).await?;
            println!("Deleted {}", sub.header);
        }
        Command::Clear { feed_id, pattern } => {
            let count = app.clear(feed_id, &pattern).await?;
            println!("Deleted {count} subscriptions");
        }
        Command::List { feed_id } => {
            for sub in app.list(feed_id).await? {
                print_subscription(&sub);
            }
        }
        Command::Stats => {
            for (feed_id, stats) in app.stats().await? {
                println!(
                    "{feed_id}: {} active, {} suspended",
                    stats.active, stats.suspended
                );
            }
        }
    }
    Ok(())
}

fn print_subscription(sub: &Subscription) {
    let updated = sub
        .updated_at
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "never".to_string());
    match &sub.error {
        None => println!("{}  {}  (updated {updated})", sub.header, sub.name),
        Some(reason) => println!("{}  {}  [suspended: {reason}]", sub.header, sub.name),
    }
}
