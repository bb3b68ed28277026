// draftwire entry point: follow one draft from the terminal.
//
// Startup sequence:
// 1. Parse arguments
// 2. Initialize tracing (log to file, not terminal)
// 3. Load config, apply command-line overrides
// 4. Start the draft sync manager and subscribe to the draft
// 5. Optionally start the active-turn poller
// 6. Print connection changes until Ctrl+C
// 7. Disconnect and shut down

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use draftwire_core::config::{self, Config};
use draftwire_core::connection::{ConnectionStatus, DraftSync, Endpoint};
use draftwire_core::poller::{self, HttpActiveTurnSource, Identity};
use draftwire_core::{DraftEvent, DraftId, Subscriber};

#[derive(Debug, Parser)]
#[command(name = "draftwire", version, about = "Follow a live draft over its event socket")]
struct Args {
    /// Draft to follow.
    draft_id: u64,

    /// Follow a hero draft instead of a team draft.
    #[arg(long)]
    hero: bool,

    /// Config file to use instead of the usual search path.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Site origin, overrides `server.origin`.
    #[arg(long)]
    origin: Option<String>,

    /// `sessionid` cookie for the active-turn poller.
    #[arg(long, env = "DRAFTWIRE_SESSION", hide_env_values = true)]
    session: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Parse arguments
    let args = Args::parse();

    // 2. Initialize tracing
    init_tracing()?;
    info!("draftwire starting up");

    // 3. Load config
    let mut config = match &args.config {
        Some(path) => config::load_config_file(path),
        None => config::load_config(),
    }
    .context("failed to load configuration")?;
    if let Some(origin) = &args.origin {
        config.server.origin = origin.clone();
    }
    if args.session.is_some() {
        config.server.session = args.session.clone();
    }
    info!(
        "Config loaded: origin={}, backfill order {:?}",
        config.server.origin, config.events.backfill_order
    );

    // 4. Sync manager
    let endpoint = if args.hero {
        Endpoint::hero_draft(&config.server.origin)
    } else {
        Endpoint::team_draft(&config.server.origin)
    }
    .context("invalid server origin")?;

    let draft_id = DraftId(args.draft_id);
    let sync = DraftSync::with_tungstenite(endpoint, config.sync_options());
    let _subscription = sync.subscribe(draft_id, printing_subscriber());
    sync.connect(draft_id);

    // 5. Active-turn poller
    let (_identity_tx, identity_rx) = watch::channel(poll_identity(&config));
    let poller = if config.poller.enabled {
        let source = HttpActiveTurnSource::new(&config.server.origin)
            .context("failed to build active-turn poller")?;
        info!("Polling {} every {:?}", source.url(), config.poller.interval());
        Some(poller::spawn_poller(
            Arc::new(source),
            config.poller.interval(),
            identity_rx,
        ))
    } else {
        None
    };
    let mut turn_rx = poller.as_ref().map(|p| p.watch());

    // 6. Report until Ctrl+C
    let mut connection_rx = sync.watch_connection();
    println!("Following draft {draft_id} at {}", config.server.origin);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down");
                break;
            }
            changed = connection_rx.changed() => {
                if changed.is_err() {
                    warn!("Draft sync stopped unexpectedly");
                    break;
                }
                let state = connection_rx.borrow_and_update().clone();
                match (&state.status, &state.error) {
                    (ConnectionStatus::Reconnecting, _) => println!(
                        "[{}] reconnecting (attempt {})",
                        timestamp(),
                        state.reconnect_attempts
                    ),
                    (status, Some(error)) => println!("[{}] {status}: {error}", timestamp()),
                    (status, None) => println!("[{}] {status}", timestamp()),
                }
            }
            Some(turn) = next_turn(&mut turn_rx) => {
                if turn.has_active_turn {
                    match turn.draft_id {
                        Some(id) => println!("[{}] It's your turn in draft {id}", timestamp()),
                        None => println!("[{}] It's your turn", timestamp()),
                    }
                }
            }
        }
    }

    // 7. Cleanup
    sync.disconnect(draft_id, "client exit");
    drop(poller);
    sync.shutdown().await;
    info!("draftwire shut down cleanly");

    Ok(())
}

fn printing_subscriber() -> Subscriber {
    Subscriber::new()
        .on_event(|event: &DraftEvent| {
            let who = event
                .actor
                .as_ref()
                .map(|a| a.display_name().to_string())
                .unwrap_or_else(|| "server".into());
            println!(
                "[{}] #{} {} by {who}",
                event.created_at.format("%H:%M:%S"),
                event.id,
                event.event_type()
            );
        })
        .on_notification(|text| println!("  >> {text}"))
        .on_snapshot(|snapshot| {
            println!("  {} players left in the pool", snapshot.users_remaining_count());
        })
        .on_refresh_needed(|event| {
            info!(event_id = %event.id, "Draft state is stale; a full refresh is needed");
        })
}

fn poll_identity(config: &Config) -> Option<Identity> {
    config.poller.user_id.map(|user_id| Identity {
        user_id,
        session_cookie: config.server.session.clone(),
    })
}

/// Resolve with the next active-turn change, or never when polling is off.
async fn next_turn(
    rx: &mut Option<watch::Receiver<poller::ActiveTurn>>,
) -> Option<poller::ActiveTurn> {
    match rx {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(rx.borrow_and_update().clone()),
            Err(_) => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = std::env::current_dir()?.join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let log_file = std::fs::File::create(log_dir.join("draftwire.log"))?;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("draftwire=info,draftwire_core=info,warn")),
        )
        .with_writer(log_file)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
