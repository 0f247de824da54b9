use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use saysh::cli::{Cli, Commands, ConfigAction, ListenInput, log_filter};
use saysh::config::Config;
use saysh::hooks::{ChildCommandChannel, QueryHandler, QueryRouter, WakeupHook};
use saysh::speaker::Speaker;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();
    init_logging(cli.quiet, cli.verbose);

    match cli.command.take() {
        Some(Commands::Completions { shell }) => {
            clap_complete::generate(shell, &mut Cli::command(), "saysh", &mut std::io::stdout());
        }
        Some(Commands::Config { action }) => {
            handle_config_command(action, &cli)?;
        }
        Some(Commands::Say { text, timeout }) => {
            let mut config = load_config(&cli)?;
            if let Some(timeout) = timeout {
                config.timeouts.complete_ms = timeout.as_millis() as u64;
            }
            run_say(config, text.join(" ")).await?;
        }
        Some(Commands::Listen {
            wakeup_cmd,
            wakeup_arg,
        }) => {
            let config = load_config(&cli)?;
            run_listen(config, wakeup_cmd, wakeup_arg).await?;
        }
        None => {
            let config = load_config(&cli)?;
            run_listen(config, None, Vec::new()).await?;
        }
    }

    Ok(())
}

fn init_logging(quiet: bool, verbose: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_filter(quiet, verbose)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Load config from file, environment and command-line flags, in that order.
fn load_config(cli: &Cli) -> Result<Config> {
    let config = if let Some(path) = &cli.config {
        Config::load(path).with_context(|| format!("Failed to load {}", path.display()))?
    } else {
        match Config::default_path() {
            Some(path) => Config::load_or_default(&path)?,
            None => Config::default(),
        }
    };

    let mut config = config.with_env_overrides();
    if let Some(voice) = &cli.voice {
        config.synthesis.voice = voice.clone();
    }
    if let Some(model) = &cli.model {
        config.service.model = model.clone();
    }
    if let Some(dir) = &cli.save_audio {
        config.output.save_audio = true;
        config.output.audio_dir = dir.clone();
    }
    if cli.no_playback {
        config.playback.enabled = false;
    }
    config.validate()?;
    Ok(config)
}

fn handle_config_command(action: ConfigAction, cli: &Cli) -> Result<()> {
    match action {
        ConfigAction::Path => match cli.config.clone().or_else(Config::default_path) {
            Some(path) => println!("{}", path.display()),
            None => anyhow::bail!("No configuration directory on this system"),
        },
        ConfigAction::Show => {
            let mut config = load_config(cli)?;
            if config.service.api_key.is_some() {
                config.service.api_key = Some("<redacted>".to_string());
            }
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }
    Ok(())
}

async fn run_say(config: Config, text: String) -> Result<()> {
    let speaker = Arc::new(Speaker::from_config(&config)?);
    let worker = Arc::clone(&speaker);
    let played = tokio::task::spawn_blocking(move || {
        let result = worker.tts(&text);
        worker.close();
        result
    })
    .await??;

    if !played {
        anyhow::bail!("Speaker busy");
    }
    let metrics = speaker.metrics();
    tracing::info!(%metrics, "done");
    Ok(())
}

async fn run_listen(
    config: Config,
    wakeup_cmd: Option<String>,
    wakeup_arg: Vec<String>,
) -> Result<()> {
    let speaker = Arc::new(Speaker::from_config(&config)?);
    speaker.start_queue();

    let channel = match wakeup_cmd {
        Some(program) => Some(Arc::new(ChildCommandChannel::spawn(&program, &wakeup_arg)?)),
        None => None,
    };
    if let Some(channel) = &channel {
        speaker.set_post_play_hook(Some(Arc::new(WakeupHook::new(Arc::clone(channel)))));
    }

    let router = QueryRouter::new(tokio::runtime::Handle::current(), Arc::clone(&speaker));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut drain = true;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match ListenInput::parse(&line) {
                    ListenInput::Speak(text) => router.on_query(&text),
                    ListenInput::Stop => println!("{}", speaker.interrupt()),
                    ListenInput::Volume(delta) => println!("{}", speaker.volume_change(delta)),
                    ListenInput::Skip => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                drain = false;
                break;
            }
        }
    }

    // On end of input let the last utterance finish.
    if drain {
        tokio::time::sleep(Duration::from_millis(200)).await;
        while !speaker.is_idle() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    let closing = Arc::clone(&speaker);
    tokio::task::spawn_blocking(move || closing.close()).await?;
    if let Some(channel) = channel {
        channel.stop();
    }
    Ok(())
}
