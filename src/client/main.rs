//! Voice Room Client - Main Entry Point
//!
//! Interactive terminal client: joins a room, captures the microphone and
//! plays every other member's audio.

use anyhow::Result;
use clap::Parser;
use log::{info, warn};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use voice_room::audio::{CpalCapture, Playback};
use voice_room::media::SharedVoice;
use voice_room::rtc::{RtcPeerFactory, TrackSink};
use voice_room::session::SessionOptions;
use voice_room::transport::{Connector, SignalingClient};
use voice_room::{ClientConfig, Orchestrator, Session, SessionCommand, SessionEvent};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "voice-room-client")]
#[command(about = "Voice Room Client - peer-to-peer voice rooms")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/client.toml")]
    config: PathBuf,

    /// Relay host
    #[arg(long)]
    host: Option<String>,

    /// Relay port
    #[arg(short, long)]
    port: Option<u16>,

    /// Display name shown to other members
    #[arg(short, long)]
    name: Option<String>,

    /// Room to join on startup
    #[arg(short, long)]
    room: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn prompt() {
    print!("> ");
    let _ = io::stdout().flush();
}

fn print_help() {
    println!();
    println!("Commands:");
    println!("  join <room>   - Join (or switch to) a room");
    println!("  leave         - Leave the current room");
    println!("  mute | unmute - Toggle the microphone");
    println!("  volume <0-100>- Set playback volume");
    println!("  devices       - List input devices");
    println!("  device <id>   - Switch input device");
    println!("  status        - Show voice and link state");
    println!("  quit          - Exit client");
    println!();
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Joined { room, member } => {
            println!("Joined room {} as {} ({})", room.id, member.display_name, member.id);
            for m in room.members.iter().filter(|m| m.id != member.id) {
                let status = if m.muted { "muted" } else { "live" };
                println!("  {} ({}) [{}]", m.display_name, m.id, status);
            }
        }
        SessionEvent::MemberJoined(member) => {
            println!("{} joined ({})", member.display_name, member.id)
        }
        SessionEvent::MemberLeft(id) => println!("{} left", id),
        SessionEvent::MemberUpdated(member) => {
            let mut flags = Vec::new();
            if member.muted {
                flags.push("muted");
            }
            if member.speaking {
                flags.push("speaking");
            }
            if !member.connected {
                flags.push("offline");
            }
            println!("{} is now [{}]", member.display_name, flags.join(", "));
        }
        SessionEvent::LinkChanged { remote, phase } => println!("Link to {}: {}", remote, phase),
        SessionEvent::RemoteAudio(remote) => println!("Receiving audio from {}", remote),
        // Level updates arrive several times a second.
        SessionEvent::Voice(_) => return,
        SessionEvent::CaptureFailed(reason) => {
            println!("Microphone unavailable: {}. Run 'join' again to retry.", reason)
        }
        SessionEvent::DeviceSwitchFailed(reason) => println!("Device switch failed: {}", reason),
        SessionEvent::Error { message, code } => match code {
            Some(code) => println!("Error ({:?}): {}", code, message),
            None => println!("Error: {}", message),
        },
        SessionEvent::Disconnected => println!("Relay connection lost, reconnecting..."),
        SessionEvent::Reconnected => println!("Reconnected to relay"),
        SessionEvent::Left => println!("Left room"),
        SessionEvent::Ended => println!("Session ended"),
    }
    prompt();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    let mut config = if args.config.exists() {
        ClientConfig::from_file(&args.config.to_string_lossy())?
    } else {
        info!("Config file not found, using defaults");
        ClientConfig::default()
    };
    if let Some(host) = args.host {
        config.server_host = host;
    }
    if let Some(port) = args.port {
        config.server_port = port;
    }
    if let Some(name) = args.name {
        config.display_name = name;
    }

    let voice = SharedVoice::default();
    let sink: Option<Arc<dyn TrackSink>> = match Playback::start(voice.clone()).await {
        Ok(playback) => Some(Arc::new(playback)),
        Err(e) => {
            warn!("Audio playback unavailable: {}", e);
            None
        }
    };
    let factory = RtcPeerFactory::new(&config.ice_servers, sink)?;

    let (peer_tx, peer_rx) = mpsc::unbounded_channel();
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(CpalCapture::new()),
        Arc::new(factory),
        peer_tx,
        voice,
    ));
    orchestrator.set_volume(config.audio.volume);

    let connector = Connector::from_config(&config)?;
    info!(
        "Connecting to {}:{}{}",
        config.server_host,
        config.server_port,
        if config.tls { " (TLS)" } else { "" }
    );
    let (client, client_events) = SignalingClient::spawn(
        connector,
        config.reconnect.clone(),
        config.max_frame_len,
    );

    let session = Session::new(orchestrator.clone(), client.sender(), SessionOptions::from(&config));
    let mut subscription = session.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            print_event(&event);
        }
    });

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    if let Some(room) = args.room {
        let _ = cmd_tx.send(SessionCommand::Join(room));
    }
    let mut session_task = tokio::spawn(session.run(cmd_rx, client_events, peer_rx));

    println!("Voice Room client: {}", config.display_name);
    print_help();
    prompt();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = &mut session_task => {
                println!("Session finished");
                break;
            }
        };
        let Some(line) = line else {
            let _ = cmd_tx.send(SessionCommand::End);
            break;
        };

        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(first) = parts.first() else {
            prompt();
            continue;
        };

        let command = match first.to_lowercase().as_str() {
            "join" => match parts.get(1) {
                Some(room) => Some(SessionCommand::Join(room.to_string())),
                None => {
                    println!("Usage: join <room>");
                    None
                }
            },
            "leave" => Some(SessionCommand::Leave),
            "mute" => Some(SessionCommand::SetMuted(true)),
            "unmute" => Some(SessionCommand::SetMuted(false)),
            "volume" => match parts.get(1).and_then(|v| v.parse::<u8>().ok()) {
                Some(volume) => Some(SessionCommand::SetVolume(volume)),
                None => {
                    println!("Usage: volume <0-100>");
                    None
                }
            },
            "devices" => {
                match orchestrator.list_input_devices() {
                    Ok(devices) if devices.is_empty() => println!("No input devices found"),
                    Ok(devices) => {
                        for device in devices {
                            println!("  {}", device.label);
                        }
                    }
                    Err(e) => println!("Failed to list devices: {}", e),
                }
                None
            }
            "device" => {
                if parts.len() < 2 {
                    println!("Usage: device <id>");
                    None
                } else {
                    Some(SessionCommand::SwitchDevice(parts[1..].join(" ")))
                }
            }
            "status" => {
                let voice = orchestrator.voice_state();
                println!(
                    "Mic: {} | level {} | volume {} | capturing: {}",
                    if voice.muted { "muted" } else { "live" },
                    voice.audio_level,
                    voice.volume,
                    voice.capturing
                );
                let links = orchestrator.link_states().await;
                if links.is_empty() {
                    println!("No peer links");
                }
                for (remote, phase) in links {
                    println!("  {} -> {}", remote, phase);
                }
                None
            }
            "help" => {
                print_help();
                None
            }
            "quit" | "exit" => {
                let _ = cmd_tx.send(SessionCommand::End);
                break;
            }
            other => {
                println!("Unknown command: {}. Type 'help' for available commands.", other);
                None
            }
        };

        if let Some(command) = command {
            if cmd_tx.send(command).is_err() {
                break;
            }
        }
        prompt();
    }

    if !session_task.is_finished() {
        let _ = session_task.await;
    }
    client.shutdown();
    printer.abort();
    println!("Goodbye!");
    Ok(())
}
