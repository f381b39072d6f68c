//! Demo client: connect to a game server, print the narrated session and
//! drive it from stdin.
//!
//! Commands: `start <script_id>`, `script <script_id>`, `next`, `reset`,
//! `say <instruction>`, `voice on|off`, `mute`, `unmute`,
//! `volume <0..1>`, `quit`.

use std::io::Write;

use anyhow::Result;
use noirlive::{ClientConfig, GameSession, SessionEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "noirlive=info".into()),
        )
        .init();

    let mut config = ClientConfig::default();
    if let Ok(url) = std::env::var("NOIRLIVE_WS_URL") {
        config.ws_url = url;
    }
    if let Ok(url) = std::env::var("NOIRLIVE_API_URL") {
        config.api_url = url;
    }
    config.tts_enabled = std::env::var("NOIRLIVE_TTS")
        .map(|v| v != "0" && v != "off")
        .unwrap_or(false);

    info!("Connecting to {}", config.ws_url);
    let session = GameSession::new(config.clone());
    let mut events = session.subscribe();
    session.connect().await;

    if config.tts_enabled {
        // A terminal run counts as a user gesture; on failure the game
        // continues without narration
        if let Err(e) = session.initialize_audio().await {
            warn!("Continuing without audio: {}", e);
        }
    }

    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::Status(status) => println!("[connection: {:?}]", status),
                SessionEvent::State(Some(state)) => {
                    println!("[phase: {:?}]", state.current_phase)
                }
                SessionEvent::State(None) => println!("[session reset]"),
                SessionEvent::Narrative(line) => println!("{}: {}", line.speaker, line.content),
                SessionEvent::Notice(notice) => println!("[server: {}]", notice),
                SessionEvent::GameStarted => println!("[game started]"),
            }
        }
    });

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    print!("> ");
    std::io::stdout().flush()?;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line.split_once(' ') {
            Some(("start", script_id)) => session.start_game(script_id.trim()).await,
            Some(("script", script_id)) => match session.scripts().fetch_script(script_id.trim()).await {
                Ok(script) => println!("{}: {}", script.id, script.title),
                Err(e) => println!("[script lookup failed: {}]", e),
            },
            Some(("say", instruction)) => session.send_edit_instruction(instruction.trim()).await,
            Some(("voice", "on")) => session.set_voice_enabled(true),
            Some(("voice", "off")) => session.set_voice_enabled(false),
            Some(("volume", value)) => match value.trim().parse::<f32>() {
                Ok(volume) => session.set_volume(volume),
                Err(_) => println!("volume takes a number between 0 and 1"),
            },
            None if line == "next" => session.advance_phase().await,
            None if line == "reset" => session.reset_game().await,
            None if line == "mute" => session.set_muted(true),
            None if line == "unmute" => session.set_muted(false),
            None if line == "quit" => break,
            None if line.is_empty() => {}
            _ => println!("commands: start <id> | script <id> | next | reset | say <text> | voice on|off | mute | unmute | volume <v> | quit"),
        }
        print!("> ");
        std::io::stdout().flush()?;
    }

    session.shutdown().await;
    printer.abort();
    info!("noirlive client stopped");
    Ok(())
}
