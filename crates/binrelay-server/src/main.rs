//! binrelay Hub Server
//!
//! Relays bin and AR terminals onto one realtime AI session.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use binrelay_core::HubConfig;
use binrelay_core::tracing_init::init_tracing;

use binrelay_server::actuator::{ActuatorChannel, SubprocessBridge};
use binrelay_server::audio::{LocalPlayer, PlaybackSink};
use binrelay_server::hub::{HubDeps, RelayHub};
use binrelay_server::image::ImageIntake;
use binrelay_server::server::{self, AppState};
use binrelay_server::storage::{JudgmentDatabase, JudgmentStore};
use binrelay_server::upstream::{UpstreamConnector, WsConnector};

#[derive(Parser, Debug)]
#[command(name = "binrelay-server")]
#[command(
    version,
    about = "binrelay hub - relays bin and AR terminals onto a realtime AI session"
)]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "BINRELAY_ADDR", default_value = "0.0.0.0:8000")]
    addr: SocketAddr,

    /// Path to the judgment database.
    #[arg(long, env = "BINRELAY_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Directory for captured images and audio.
    #[arg(long, env = "BINRELAY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Image of the empty bin sent alongside each capture.
    #[arg(long, env = "BINRELAY_REFERENCE_IMAGE", default_value = "empty_bin_reference.jpg")]
    reference_image: PathBuf,

    /// Actuator bridge script run with `node`.
    #[arg(long, env = "BINRELAY_BRIDGE_SCRIPT", default_value = "obniz_bridge.js")]
    bridge_script: PathBuf,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing("binrelay_server=info", args.log_json);

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("A rustls crypto provider was already installed");
    }

    let config = HubConfig::from_env()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %args.addr,
        model = %config.upstream.model,
        audio_endpoint = %config.audio_endpoint,
        "Starting binrelay-server"
    );
    if config.auth_token_generated {
        warn!(
            token = %config.masked_token(),
            "WS_AUTH_TOKEN not set, generated a terminal token (see /config)"
        );
    }

    let data_dir = match &args.data_dir {
        Some(dir) => dir.clone(),
        None => default_data_dir()?,
    };
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| data_dir.join("judgments.db"));

    let store: Option<Arc<dyn JudgmentStore>> = match JudgmentDatabase::open(&db_path).await {
        Ok(db) => {
            info!(path = %db_path.display(), "Opened judgment database");
            Some(Arc::new(db))
        }
        Err(e) => {
            warn!(path = %db_path.display(), error = %e, "Judgment database unavailable, records disabled");
            None
        }
    };

    let reference_image = load_reference(&args.reference_image).await;

    let bridge = spawn_bridge(&config, &args.bridge_script).map(Arc::new);
    let actuator = bridge
        .clone()
        .map(|b| b as Arc<dyn ActuatorChannel>);

    let player = if config.local_speaker {
        match LocalPlayer::spawn(&config.local_player_cmd) {
            Ok(player) => {
                info!(command = %config.local_player_cmd, "Local audio player started");
                Some(Arc::new(player))
            }
            Err(e) => {
                warn!(error = %e, "Local audio player failed to start, unicasting audio instead");
                None
            }
        }
    } else {
        None
    };

    let connector: Arc<dyn UpstreamConnector> = Arc::new(WsConnector::new(
        config.upstream.url(),
        config.upstream.api_key.clone(),
    ));
    let hub = RelayHub::new(
        &config,
        HubDeps {
            connector,
            store,
            actuator,
            player: player.clone().map(|p| p as Arc<dyn PlaybackSink>),
            image_dir: data_dir.join("images"),
            audio_dir: data_dir.join("audio"),
            reference_image,
        },
    );

    let state = AppState {
        hub: Arc::clone(&hub),
        config: Arc::new(config),
    };
    let listener = tokio::net::TcpListener::bind(args.addr).await?;
    info!(addr = %args.addr, "Hub listening");

    server::serve(listener, state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for shutdown signal");
        }
        info!("Received shutdown signal");
    })
    .await?;

    hub.shutdown().await;
    if let Some(bridge) = &bridge {
        bridge.terminate().await;
    }
    if let Some(player) = &player {
        player.stop().await;
    }

    info!("Hub stopped");
    Ok(())
}

async fn load_reference(path: &Path) -> Option<String> {
    match ImageIntake::load_reference(path).await {
        Ok(url) => Some(url),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Reference image unavailable");
            None
        }
    }
}

fn spawn_bridge(config: &HubConfig, script: &Path) -> Option<SubprocessBridge> {
    let Some(device_id) = &config.actuator_device_id else {
        info!("OBNIZ_ID not set, actuator disabled");
        return None;
    };
    match SubprocessBridge::spawn("node", script, device_id) {
        Ok(bridge) => {
            info!(script = %script.display(), "Actuator bridge started");
            Some(bridge)
        }
        Err(e) => {
            warn!(error = %e, "Actuator bridge failed to start, actuator disabled");
            None
        }
    }
}

fn default_data_dir() -> anyhow::Result<PathBuf> {
    let base = dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .ok_or_else(|| anyhow::anyhow!("Cannot determine data directory"))?;
    Ok(base.join("binrelay"))
}
