//! Terminal client: pairs through the signaling server and negotiates a
//! WebRTC session with the partner.
//!
//! Commands on stdin:
//! - `find` start searching
//! - `stop` stop searching
//! - `leave` leave the current chat
//! - `say <text>` send a chat line
//! - `quit`

use anyhow::Context;
use clap::Parser;
use pairchat::config::{default_ice_servers, VideoConstraints};
use pairchat::{
    ClientConfig, EngineEvent, MediaConstraints, NegotiationEngine, SignalChannel, UserCommand,
    WebRtcMedia,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};

#[derive(Parser, Debug)]
#[command(name = "pairchat-client", version, about = "Anonymous 1:1 chat client")]
struct Args {
    /// Signaling server WebSocket URL
    #[arg(long, env = "PAIRCHAT_URL", default_value = "ws://127.0.0.1:5000")]
    url: String,

    /// STUN/TURN server URLs, comma separated
    #[arg(long = "stun", env = "PAIRCHAT_ICE_SERVERS", value_delimiter = ',')]
    ice_servers: Vec<String>,

    /// TURN relay URL, used on top of the STUN servers
    #[arg(long, env = "PAIRCHAT_TURN_URL", requires_all = ["turn_username", "turn_credential"])]
    turn_url: Option<String>,

    #[arg(long, env = "PAIRCHAT_TURN_USERNAME")]
    turn_username: Option<String>,

    #[arg(long, env = "PAIRCHAT_TURN_CREDENTIAL", hide_env_values = true)]
    turn_credential: Option<String>,

    /// Send audio only
    #[arg(long)]
    no_video: bool,

    /// Give up searching after this many seconds
    #[arg(long, value_name = "SECS")]
    search_timeout: Option<u64>,

    /// Upper bound for one negotiation step, in seconds
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    negotiation_timeout: u64,
}

/// TURN URL plus credentials
struct TurnServer {
    url: String,
    username: String,
    credential: String,
}

impl Args {
    fn turn_server(&self) -> Option<TurnServer> {
        Some(TurnServer {
            url: self.turn_url.clone()?,
            username: self.turn_username.clone().unwrap_or_default(),
            credential: self.turn_credential.clone().unwrap_or_default(),
        })
    }

    fn into_config(self) -> ClientConfig {
        let ice_servers = if self.ice_servers.is_empty() {
            default_ice_servers()
        } else {
            self.ice_servers
        };
        let video = (!self.no_video).then_some(VideoConstraints {
            width: 720,
            height: 480,
        });

        ClientConfig {
            signaling_url: self.url,
            ice_servers,
            constraints: MediaConstraints { audio: true, video },
            search_timeout: self.search_timeout.map(Duration::from_secs),
            negotiation_timeout: Duration::from_secs(self.negotiation_timeout),
        }
    }
}

enum Input {
    Command(UserCommand),
    Quit,
}

fn parse_input(line: &str) -> Option<Input> {
    let line = line.trim();
    let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
    match word {
        "find" => Some(Input::Command(UserCommand::FindPartner)),
        "stop" => Some(Input::Command(UserCommand::StopSearch)),
        "leave" => Some(Input::Command(UserCommand::Leave)),
        "say" => Some(Input::Command(UserCommand::SendChat(rest.to_string()))),
        "quit" | "exit" => Some(Input::Quit),
        _ => None,
    }
}

fn print_event(event: EngineEvent) {
    match event {
        EngineEvent::StateChanged(state) => tracing::debug!("state: {}", state),
        EngineEvent::Status {
            message,
            is_error: true,
        } => eprintln!("! {}", message),
        EngineEvent::Status { message, .. } => println!("* {}", message),
        EngineEvent::Chat {
            message,
            from_self: true,
        } => println!("You: {}", message),
        EngineEvent::Chat { message, .. } => println!("Partner: {}", message),
        EngineEvent::RemoteTrack(track) => {
            println!("* Receiving {:?} from partner ({})", track.kind, track.id)
        }
        EngineEvent::UserCount(count) => println!("* Users online: {}", count),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let turn = args.turn_server();
    let config = args.into_config();
    pairchat::init_tracing(&["pairchat=debug", "webrtc=warn"]);
    config.validate().context("invalid configuration")?;

    let (channel, inbound) = SignalChannel::connect(&config.signaling_url)
        .await
        .context("could not reach signaling server")?;
    let mut media = WebRtcMedia::new(config.ice_servers.clone());
    if let Some(turn) = turn {
        tracing::info!("Using TURN relay {}", turn.url);
        media = media.with_turn_server(turn.url, turn.username, turn.credential);
    }
    let media = Arc::new(media);
    let engine = NegotiationEngine::new(config, media, channel.sender());

    let mut events = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Skipped {} engine events", n)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let engine_task = tokio::spawn(engine.run(commands_rx, inbound));

    println!("Commands: find | stop | leave | say <text> | quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_input(&line) {
            Some(Input::Command(command)) => {
                if commands_tx.send(command).is_err() {
                    break;
                }
            }
            Some(Input::Quit) => break,
            None if line.trim().is_empty() => {}
            None => println!("Unknown command: {}", line.trim()),
        }
    }

    drop(commands_tx);
    engine_task.await.context("engine task panicked")?;
    Ok(())
}
