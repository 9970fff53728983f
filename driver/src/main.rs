//! RideSync Driver Console
//!
//! Headless driver client: keeps a session open against the backend, prints
//! offers and ride updates, and takes line commands on stdin.

mod config;
mod console;

use anyhow::Context;
use clap::{Parser, Subcommand};
use console::Command;
use ridesync_core::{
    ChatStream, DriverSession, Identity, LocalStorage, SessionNotice, StaticLocation,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::AppConfig;

#[derive(Parser)]
#[command(name = "ridesync-driver")]
#[command(about = "Headless driver console for RideSync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Data directory (config and session store)
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a token for later runs
    Login {
        #[arg(long)]
        token: String,

        #[arg(long)]
        driver_id: String,

        /// Name shown in the console
        #[arg(long)]
        name: Option<String>,
    },

    /// Forget the stored token
    Logout,

    /// Write the current configuration to config.json
    InitConfig,

    /// Run the console (default)
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "ridesync_driver=info,ridesync_core=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ridesync")
    });
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating {}", data_dir.display()))?;
    tracing::info!("Data directory: {:?}", data_dir);

    let config = AppConfig::load(&data_dir).context("loading config.json")?;
    let storage = LocalStorage::new(&data_dir)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Login {
            token,
            driver_id,
            name,
        } => {
            let mut identity = Identity::new(token, driver_id);
            identity.display_name = name;
            storage.save_session(&identity)?;
            println!("Signed in as {}", identity.driver_id);
        }
        Commands::Logout => {
            storage.clear_session()?;
            println!("Signed out");
        }
        Commands::InitConfig => {
            config.save(&data_dir)?;
            println!("Wrote {}", data_dir.join("config.json").display());
        }
        Commands::Run => run(config, storage).await?,
    }

    Ok(())
}

async fn run(config: AppConfig, storage: LocalStorage) -> anyhow::Result<()> {
    let identity = storage
        .load_session()?
        .context("no stored session, run `ridesync-driver login` first")?;
    tracing::info!(
        "Starting RideSync driver v{} for {}",
        env!("CARGO_PKG_VERSION"),
        identity.display_name.as_deref().unwrap_or(&identity.driver_id)
    );

    let location = Arc::new(StaticLocation(config.fallback_location()));
    let session = DriverSession::open(identity, &config.client_config(), location)?;
    let mut notices = session
        .take_notices()
        .context("notice stream already taken")?;

    if let Err(e) = session.refresh().await {
        tracing::warn!("Initial status refresh failed: {}", e);
    }
    println!("{}", console::HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut chat: Option<ChatStream> = None;

    loop {
        tokio::select! {
            notice = notices.recv() => {
                let Some(notice) = notice else { break };
                println!("{}", console::describe_notice(&notice));
                if notice == SessionNotice::ReauthRequired {
                    session.logout(Some(&storage)).await?;
                    break;
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match console::parse(&line) {
                    Ok(Command::Quit) => break,
                    Ok(command) => {
                        if let Err(e) = execute(&session, &mut chat, command).await {
                            println!("error: {}", e);
                        }
                    }
                    Err(e) => println!("{}", e),
                }
            }
        }
    }

    session.connection().disconnect().await;
    tracing::info!("Driver console stopped");
    Ok(())
}

async fn execute(
    session: &DriverSession,
    chat: &mut Option<ChatStream>,
    command: Command,
) -> ridesync_core::Result<()> {
    match command {
        Command::Online => {
            let at = session.go_online().await?;
            println!("Online at {:.5}, {:.5}", at.latitude, at.longitude);
        }
        Command::Offline => {
            session.go_offline().await?;
            println!("Offline");
        }
        Command::Accept => {
            let ride = session.accept_offer().await?;
            println!("Accepted ride {}", ride.ride_id);
        }
        Command::Decline => {
            session.decline_offer().await?;
            println!("Declined");
        }
        Command::Advance => {
            let status = session.advance_ride().await?;
            println!("Ride is now {}", status);
        }
        Command::Refresh => {
            session.refresh().await?;
            print_status(session);
        }
        Command::Status => print_status(session),
        Command::Chat(channel) => {
            let stream = session.open_chat(channel);
            for message in stream.load_history().await? {
                println!("{}", console::describe_message(&message));
            }
            println!("Chatting on {}", stream.channel());
            *chat = Some(stream);
        }
        Command::Say(text) => match chat.as_ref() {
            Some(stream) => {
                let sent = stream.send(&text).await?;
                println!("{}", console::describe_message(&sent));
            }
            None => println!("Open a chat first"),
        },
        Command::Help => println!("{}", console::HELP),
        Command::Quit => {}
    }
    Ok(())
}

fn print_status(session: &DriverSession) {
    println!("Connection: {:?}", session.connection().state());
    println!(
        "Presence: {}",
        if session.presence().online { "online" } else { "offline" }
    );
    match session.offer() {
        Some(offer) => println!("Offer: {}", console::describe_offer(&offer)),
        None => println!("Offer: none"),
    }
    match session.active_ride() {
        Some(ride) => println!("Ride: {} ({})", ride.ride_id, ride.status),
        None => println!("Ride: none"),
    }
}
