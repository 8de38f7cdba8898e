//! Cinecast CLI: publish or watch a named stream through a relay.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use cinecast_common::SignalingConfig;
use cinecast_signal::rtc::{IvfFileCapture, WebRtcEngine};
use cinecast_signal::ws::WebSocketTransport;
use cinecast_signal::{
    decode_payload, ControllerEvent, Role, SessionConfig, SessionController, SourceConfig,
    WireFormat,
};
use clap::{Parser, Subcommand};
use tokio::sync::Notify;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "cinecast")]
#[command(about = "Publish and watch live streams over a signaling relay")]
struct Args {
    /// Relay WebSocket URL (overrides CINECAST_RELAY_URL)
    #[arg(long, global = true)]
    relay: Option<String>,

    /// STUN/TURN server URL; repeat for several (overrides CINECAST_ICE_SERVERS)
    #[arg(long = "ice-server", global = true)]
    ice_servers: Vec<String>,

    /// Log at debug level unless RUST_LOG is set
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Broadcast a stream
    Publish {
        /// Stream name viewers join with
        #[arg(short, long)]
        name: Option<String>,

        /// VP8 or VP9 IVF file to publish instead of the camera
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Watch a stream
    Subscribe {
        /// Stream name to join
        #[arg(short, long)]
        name: Option<String>,

        /// Request video only
        #[arg(long)]
        no_audio: bool,
    },

    /// Decode a signaling payload and print the session description
    Decode {
        /// Base64 payload as carried by the relay
        wire: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<()> {
    let args = Args::parse();
    if args.debug {
        cinecast_common::init_tracing_with_default("debug");
    } else {
        cinecast_common::init_tracing();
    }

    match args.command {
        Command::Publish { ref name, ref file } => {
            let config = load_config(&args)?;
            let name = config.stream_name_or_default(name.as_deref());
            let source = match file {
                Some(path) => SourceConfig::File(path.clone()),
                None => SourceConfig::Camera,
            };
            run(config, Role::Publisher, name, source, true)?;
        }
        Command::Subscribe { ref name, no_audio } => {
            let config = load_config(&args)?;
            let name = config.stream_name_or_default(name.as_deref());
            run(config, Role::Subscriber, name, SourceConfig::Camera, !no_audio)?;
        }
        Command::Decode { ref wire } => {
            let payload = decode_payload(wire)?;
            match payload.format {
                WireFormat::Flat => println!("Format: flat"),
                WireFormat::Enveloped { action, name } => {
                    println!("Format: enveloped");
                    if let Some(action) = action {
                        println!("Action: {}", action);
                    }
                    if let Some(name) = name {
                        println!("Name:   {}", name);
                    }
                }
            }
            println!("{}", serde_json::to_string_pretty(&payload.description)?);
        }
        Command::Version => {
            println!("cinecast {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

fn load_config(args: &Args) -> Result<SignalingConfig> {
    let mut config = SignalingConfig::from_env()?;
    if let Some(relay) = &args.relay {
        config = config.with_relay_url(relay.clone());
    }
    if !args.ice_servers.is_empty() {
        config = config.with_ice_servers(args.ice_servers.clone());
    }
    config.validate().context("invalid signaling configuration")?;
    Ok(config)
}

fn run(
    config: SignalingConfig,
    role: Role,
    name: String,
    source: SourceConfig,
    receive_audio: bool,
) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async move {
        let engine = Arc::new(WebRtcEngine::new()?);
        let mut session_config = SessionConfig::from(&config);
        session_config.receive_audio = receive_audio;

        let controller = SessionController::new(
            config,
            engine,
            Arc::new(IvfFileCapture::new()),
            Arc::new(WebSocketTransport::new()),
        );
        controller.set_session_config(session_config);

        let ended = Arc::new(Notify::new());
        let notify = ended.clone();
        controller.on_event(move |event| {
            println!("{}", event);
            if event == ControllerEvent::Stopped {
                notify.notify_one();
            }
        });

        controller.start(role, &name, source).await?;

        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res?;
                info!("Interrupted; shutting down");
            }
            _ = ended.notified() => {}
        }
        controller.stop().await;
        Ok::<(), anyhow::Error>(())
    })
}
