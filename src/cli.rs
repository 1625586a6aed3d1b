//! Command-line interface for voicelink
//!
//! Provides argument parsing using clap derive macros.

use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use std::time::Duration;

/// Talk to a conversational bot over a real-time voice channel
#[derive(Parser, Debug)]
#[command(name = "voicelink", version, about = "Talk to a conversational bot over a real-time voice channel")]
pub struct Cli {
    /// Subcommand to execute (default: talk)
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Suppress status output (quiet mode)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose output (-v: debug logs, -vv: trace logs)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a voice conversation with a bot
    Talk(TalkArgs),

    /// List audio input and output devices
    Devices,

    /// View and create the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

/// Options for a conversation
#[derive(Args, Debug, Clone, Default, PartialEq)]
pub struct TalkArgs {
    /// Bot to talk to (default: server.bot_id from the config)
    #[arg(long, short = 'b', value_name = "BOT")]
    pub bot: Option<String>,

    /// Continue an existing conversation
    #[arg(long, value_name = "CHAT")]
    pub chat: Option<String>,

    /// Override the bot's system prompt for this session
    #[arg(long, value_name = "TEXT")]
    pub system_prompt: Option<String>,

    /// Enable a bot capability (repeatable, e.g. --capability web_search)
    #[arg(long = "capability", value_name = "NAME")]
    pub capabilities: Vec<String>,

    /// Server origin (e.g., https://bots.example.com)
    #[arg(long, value_name = "URL")]
    pub origin: Option<String>,

    /// Audio input device (e.g., hw:0)
    #[arg(long, value_name = "DEVICE")]
    pub device: Option<String>,

    /// Audio output device
    #[arg(long, value_name = "DEVICE")]
    pub output_device: Option<String>,

    /// Voice the bot speaks with (e.g., alloy, nova)
    #[arg(long, value_name = "VOICE")]
    pub voice: Option<String>,

    /// Conversation language code (e.g., en, de, fr)
    #[arg(long, value_name = "LANG")]
    pub language: Option<String>,

    /// Start with the microphone muted
    #[arg(long)]
    pub muted: bool,

    /// Only end turns from the keyboard, never on detected silence
    #[arg(long)]
    pub manual_turns: bool,

    /// End the conversation after this long (e.g., 90s, 5m, 1h30m)
    #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
    pub max_duration: Option<Duration>,
}

/// Parse a duration string.
///
/// Supports any duration format accepted by `humantime`: bare numbers (seconds),
/// single-unit (`30s`, `5m`, `2h`), and compound (`1h30m`, `2m30s`).
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    // Bare number → seconds
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// Configuration management actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration (file, defaults and env overrides)
    Show,
    /// Print the configuration file path
    Path,
    /// Write a configuration file with default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}
