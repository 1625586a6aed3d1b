use anyhow::Result;
use clap::{CommandFactory, Parser};
use owo_colors::OwoColorize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use voicelink::app::run_talk_command;
use voicelink::audio::capture::{DeviceKind, list_devices, suppress_audio_warnings};
use voicelink::cli::{Cli, Commands, ConfigAction, TalkArgs};
use voicelink::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    tracing::debug!(version = %voicelink::version_string(), "voicelink starting");

    match cli.command {
        None => {
            let config = load_config(cli.config.as_deref())?;
            run_talk_command(config, TalkArgs::default(), cli.quiet).await?;
        }
        Some(Commands::Talk(args)) => {
            let config = load_config(cli.config.as_deref())?;
            run_talk_command(config, args, cli.quiet).await?;
        }
        Some(Commands::Devices) => {
            list_audio_devices()?;
        }
        Some(Commands::Config { action }) => {
            handle_config_command(action, cli.config.as_deref())?;
        }
        Some(Commands::Completions { shell }) => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "voicelink",
                &mut std::io::stdout(),
            );
        }
    }

    Ok(())
}

/// Log to stderr. `RUST_LOG` wins over `-v`/`-vv`.
fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "voicelink=warn",
        1 => "voicelink=debug",
        _ => "voicelink=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Priority order:
/// 1. Custom config path from CLI (--config)
/// 2. Default config path (~/.config/voicelink/config.toml)
/// 3. Built-in defaults with environment variable overrides
fn load_config(custom_path: Option<&Path>) -> Result<Config> {
    let config = if let Some(path) = custom_path {
        // Load from custom path
        Config::load(path)?
    } else {
        // Try default path, fall back to defaults
        let default_path = Config::default_path()?;
        Config::load_or_default(&default_path)?
    };

    // Apply environment variable overrides
    Ok(config.with_env_overrides())
}

fn config_path(custom_path: Option<&Path>) -> Result<PathBuf> {
    match custom_path {
        Some(path) => Ok(path.to_path_buf()),
        None => Config::default_path(),
    }
}

/// List available audio input and output devices.
fn list_audio_devices() -> Result<()> {
    suppress_audio_warnings();

    for (label, kind) in [("input", DeviceKind::Input), ("output", DeviceKind::Output)] {
        let devices = list_devices(kind)?;
        if devices.is_empty() {
            eprintln!("No audio {} devices found", label);
            continue;
        }

        println!("Available audio {} devices:", label);
        for (idx, device) in devices.iter().enumerate() {
            println!("  [{}] {}", idx, device);
        }
    }

    Ok(())
}

/// Handle configuration commands.
fn handle_config_command(action: ConfigAction, custom_path: Option<&Path>) -> Result<()> {
    let path = config_path(custom_path)?;

    match action {
        ConfigAction::Show => {
            let config = Config::load_or_default(&path)?.with_env_overrides();
            print!("{}", config.to_toml()?);
        }
        ConfigAction::Path => {
            println!("{}", path.display());
        }
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, Config::default().to_toml()?)?;
            println!("{} {}", "Wrote".green(), path.display());
        }
    }

    Ok(())
}
