//! Command-line interface for saysh
//!
//! Provides argument parsing using clap derive macros.

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use std::time::Duration;

/// Speak streamed text through a remote synthesis service
#[derive(Parser, Debug)]
#[command(
    name = "saysh",
    version,
    about = "Speak streamed text through a remote synthesis service"
)]
pub struct Cli {
    /// Subcommand to execute (default: listen)
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose output (-v: info, -vv: debug, -vvv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Synthesis voice (e.g., longhua_v2)
    #[arg(long, global = true, value_name = "VOICE")]
    pub voice: Option<String>,

    /// Synthesis model (e.g., cosyvoice-v2)
    #[arg(long, global = true, value_name = "MODEL")]
    pub model: Option<String>,

    /// Save each utterance as a WAV file in DIR
    #[arg(long, global = true, value_name = "DIR")]
    pub save_audio: Option<PathBuf>,

    /// Synthesize without playing audio
    #[arg(long, global = true)]
    pub no_playback: bool,
}

/// Parse a duration string.
///
/// Supports bare numbers (seconds) and anything `humantime` accepts
/// (`30s`, `5m`, `1m30s`).
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Speak TEXT once and exit
    Say {
        /// Text to speak (joined with spaces)
        #[arg(required = true, value_name = "TEXT")]
        text: Vec<String>,

        /// Longest wait for synthesis to finish (e.g., 30s, 2m)
        #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
        timeout: Option<Duration>,
    },

    /// Read queries from stdin, one per line, and speak each
    ///
    /// `/stop` interrupts the current utterance, `/volume <delta>` adjusts
    /// the system volume.
    Listen {
        /// Program to notify with `wakeup` after each utterance
        #[arg(long, value_name = "PROGRAM")]
        wakeup_cmd: Option<String>,

        /// Arguments for the wakeup program
        #[arg(long, value_name = "ARG", requires = "wakeup_cmd", allow_hyphen_values = true)]
        wakeup_arg: Vec<String>,
    },

    /// View configuration
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

/// Configuration actions
#[derive(Subcommand, Debug, PartialEq)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Print the configuration file path
    Path,
}

/// A line typed into `listen`.
#[derive(Debug, PartialEq)]
pub enum ListenInput {
    Speak(String),
    Stop,
    Volume(i32),
    Skip,
}

impl ListenInput {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return ListenInput::Skip;
        }
        if line == "/stop" {
            return ListenInput::Stop;
        }
        if let Some(rest) = line.strip_prefix("/volume") {
            return match rest.trim().parse::<i32>() {
                Ok(delta) => ListenInput::Volume(delta),
                Err(_) => ListenInput::Skip,
            };
        }
        ListenInput::Speak(line.to_string())
    }
}

/// Log filter for the given flags; `RUST_LOG` takes precedence in `main`.
pub fn log_filter(quiet: bool, verbose: u8) -> &'static str {
    if quiet {
        return "error";
    }
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_default_command() {
        let cli = Cli::try_parse_from(["saysh"]).unwrap();
        assert!(cli.command.is_none());
        assert!(!cli.quiet);
        assert_eq!(cli.verbose, 0);
        assert!(!cli.no_playback);
    }

    #[test]
    fn test_parse_verbose_double() {
        let cli = Cli::try_parse_from(["saysh", "-vv"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_parse_say_joins_words() {
        let cli = Cli::try_parse_from(["saysh", "say", "hello", "there", "--timeout", "30s"])
            .unwrap();
        match cli.command {
            Some(Commands::Say { text, timeout }) => {
                assert_eq!(text, vec!["hello", "there"]);
                assert_eq!(timeout, Some(Duration::from_secs(30)));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_say_requires_text() {
        assert!(Cli::try_parse_from(["saysh", "say"]).is_err());
    }

    #[test]
    fn test_parse_duration_formats() {
        assert_eq!(parse_duration("5").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_global_options_after_command() {
        let cli = Cli::try_parse_from([
            "saysh",
            "listen",
            "--voice",
            "longxiaochun",
            "--no-playback",
            "--save-audio",
            "/tmp/out",
        ])
        .unwrap();
        assert_eq!(cli.voice.as_deref(), Some("longxiaochun"));
        assert!(cli.no_playback);
        assert_eq!(cli.save_audio, Some(PathBuf::from("/tmp/out")));
    }

    #[test]
    fn test_parse_listen_with_wakeup() {
        let cli = Cli::try_parse_from([
            "saysh",
            "listen",
            "--wakeup-cmd",
            "kws",
            "--wakeup-arg",
            "--model=hey",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Listen {
                wakeup_cmd,
                wakeup_arg,
            }) => {
                assert_eq!(wakeup_cmd.as_deref(), Some("kws"));
                assert_eq!(wakeup_arg, vec!["--model=hey"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_config_path() {
        let cli = Cli::try_parse_from(["saysh", "config", "path"]).unwrap();
        match cli.command {
            Some(Commands::Config { action }) => assert_eq!(action, ConfigAction::Path),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_listen_input_commands() {
        assert_eq!(ListenInput::parse("  /stop "), ListenInput::Stop);
        assert_eq!(ListenInput::parse("/volume -10"), ListenInput::Volume(-10));
        assert_eq!(ListenInput::parse("/volume loud"), ListenInput::Skip);
        assert_eq!(ListenInput::parse(""), ListenInput::Skip);
        assert_eq!(
            ListenInput::parse("what time is it"),
            ListenInput::Speak("what time is it".to_string())
        );
    }

    #[test]
    fn test_log_filter_levels() {
        assert_eq!(log_filter(false, 0), "warn");
        assert_eq!(log_filter(false, 1), "info");
        assert_eq!(log_filter(false, 5), "trace");
        assert_eq!(log_filter(true, 3), "error");
    }
}
