//! Voice conversation entry point.
//!
//! Wires the cpal microphone and speaker to a [`VoiceClient`] and drives it
//! from the terminal until the user quits or the channel gives up.

use crate::audio::capture::{CpalAudioSource, suppress_audio_warnings};
use crate::audio::output::{AudioOutput, CpalOutput};
use crate::audio::pipeline::SourceFactory;
use crate::audio::recorder::{AudioSource, AudioSourceConfig, CaptureConstraints};
use crate::channel::{Connector, WebSocketConnector};
use crate::cli::TalkArgs;
use crate::config::Config;
use crate::error::{Result, VoiceLinkError};
use crate::session::{ConnectParams, VoiceClient, VoiceState};
use owo_colors::OwoColorize;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// Keyboard commands accepted while talking, one per line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyCommand {
    EndTurn,
    ToggleMute,
    Interrupt,
    Quit,
}

fn parse_key_command(line: &str) -> Option<KeyCommand> {
    match line.trim().to_lowercase().as_str() {
        "" | "e" | "end" => Some(KeyCommand::EndTurn),
        "m" | "mute" => Some(KeyCommand::ToggleMute),
        "i" | "interrupt" => Some(KeyCommand::Interrupt),
        "q" | "quit" | "exit" => Some(KeyCommand::Quit),
        _ => None,
    }
}

/// Apply command-line overrides on top of the loaded configuration.
fn apply_overrides(config: &mut Config, args: &TalkArgs) {
    if let Some(origin) = &args.origin {
        config.server.origin = origin.clone();
    }
    if let Some(device) = &args.device {
        config.audio.device = Some(device.clone());
    }
    if let Some(device) = &args.output_device {
        config.playback.device = Some(device.clone());
    }
    if let Some(voice) = &args.voice {
        config.voice.voice = voice.clone();
    }
    if let Some(language) = &args.language {
        config.voice.language = language.clone();
    }
    if args.manual_turns {
        config.audio.auto_end_turn = false;
    }
}

fn connect_params(config: &Config, args: &TalkArgs) -> Result<ConnectParams> {
    let bot_id = args
        .bot
        .clone()
        .or_else(|| config.server.bot_id.clone())
        .ok_or_else(|| VoiceLinkError::ConfigInvalidValue {
            key: "server.bot_id".to_string(),
            message: "no bot given; pass --bot or set server.bot_id".to_string(),
        })?;

    Ok(ConnectParams {
        bot_id,
        chat_id: args.chat.clone(),
        system_prompt: args.system_prompt.clone(),
        capabilities: (!args.capabilities.is_empty()).then(|| args.capabilities.clone()),
        voice_settings: config.voice.clone(),
        ..ConnectParams::default()
    })
}

/// Start the conversation.
///
/// A failed first handshake is retried in the background like any other
/// unintentional close, so only fatal errors end the conversation here.
async fn open_conversation(client: &VoiceClient, params: ConnectParams) -> Result<()> {
    match client.connect(params).await {
        Ok(()) => Ok(()),
        Err(error) if error.is_fatal() => Err(error),
        Err(error) => {
            tracing::warn!("Initial connection failed, retrying: {}", error);
            Ok(())
        }
    }
}

fn microphone_factory(config: &Config) -> SourceFactory {
    let sample_rate = config.audio.sample_rate;
    let device = config.audio.device.clone();
    Arc::new(move |constraints: &CaptureConstraints| {
        let source = CpalAudioSource::new(&AudioSourceConfig {
            sample_rate,
            device: device.clone(),
            constraints: *constraints,
        })?;
        Ok(Box::new(source) as Box<dyn AudioSource>)
    })
}

/// Run the talk command: open the channel, stream the microphone, play replies.
///
/// # Arguments
/// * `config` - Base configuration (overridden by `args`)
/// * `args` - Command-line options for this conversation
/// * `quiet` - Suppress status messages and transcripts
///
/// # Returns
/// Ok(()) when the user quits, or an error if the session cannot start
pub async fn run_talk_command(mut config: Config, args: TalkArgs, quiet: bool) -> Result<()> {
    // Suppress noisy JACK/ALSA warnings before audio init
    suppress_audio_warnings();

    apply_overrides(&mut config, &args);
    config.validate()?;
    let params = connect_params(&config, &args)?;

    let output: Arc<dyn AudioOutput> = Arc::new(CpalOutput::new(config.playback.device.as_deref())?);
    let connector: Arc<dyn Connector> = Arc::new(WebSocketConnector);
    let client = VoiceClient::new(
        config.client_config(),
        connector,
        Arc::new(config.credentials()),
        microphone_factory(&config),
        output,
    );

    let (ended_tx, mut ended_rx) = mpsc::unbounded_channel::<String>();
    client.on_disconnect(move |info| {
        if !info.will_reconnect {
            ended_tx.send(info.reason.clone()).ok();
        }
    });
    client.on_error(|error| eprintln!("{} {}", "Error:".red(), error));
    if !quiet {
        client.on_state_change(|state| match state {
            VoiceState::Connecting => eprintln!("{}", "Connecting...".dimmed()),
            VoiceState::Idle => eprintln!("{}", "Ready. Speak, or press Enter to end your turn.".dimmed()),
            VoiceState::Error => {}
            other => eprintln!("{}", format!("[{}]", other).dimmed()),
        });
        client.on_transcript(|transcript| match transcript.role.as_deref() {
            Some("assistant") | Some("bot") => println!("{} {}", "Bot:".green(), transcript.text),
            _ => println!("{} {}", "You:".cyan(), transcript.text),
        });
    }

    if !quiet {
        eprintln!(
            "Connecting to bot '{}' at {}...",
            params.bot_id, config.server.origin
        );
    }
    open_conversation(&client, params).await?;
    if args.muted {
        client.set_muted(true);
    }
    client.start_mic()?;
    if !quiet {
        eprintln!(
            "{}",
            "Commands: Enter = end turn, m = mute, i = interrupt, q = quit".dimmed()
        );
    }

    let deadline = async {
        match args.max_duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) | Err(_) => {
                        stdin_open = false;
                        continue;
                    }
                };
                match parse_key_command(&line) {
                    Some(KeyCommand::EndTurn) => {
                        client.send_end_turn();
                    }
                    Some(KeyCommand::ToggleMute) => {
                        let muted = !client.is_muted();
                        client.set_muted(muted);
                        if !quiet {
                            let label = if muted { "Muted" } else { "Unmuted" };
                            eprintln!("{}", label.yellow());
                        }
                    }
                    Some(KeyCommand::Interrupt) => {
                        client.send_interrupt();
                    }
                    Some(KeyCommand::Quit) => break,
                    None => eprintln!("Unknown command: {}", line.trim()),
                }
            }
            reason = ended_rx.recv() => {
                if !quiet {
                    eprintln!("Conversation ended: {}", reason.unwrap_or_default());
                }
                break;
            }
            _ = &mut deadline => {
                if !quiet {
                    eprintln!("Maximum duration reached");
                }
                break;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.disconnect();
    if !quiet {
        let stats = client.capture_stats();
        eprintln!(
            "{}",
            format!("Sent {} frames ({} dropped)", stats.sent(), stats.dropped()).dimmed()
        );
    }
    Ok(())
}
