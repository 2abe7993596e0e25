//! Command-line interface for jamlink
//!
//! Handles argument parsing and logging configuration.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::LevelFilter;

/// jamlink - step sequencer and live voice-agent jam session
#[derive(Parser, Debug)]
#[command(name = "jamlink")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Increase logging verbosity
    /// -v = info, -vv = debug, -vvv = trace, -vvvv = all deps
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Settings file (defaults to the platform config directory)
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Play the demo pattern on the default output device
    Play {
        /// Tempo in BPM (overrides settings)
        #[arg(long)]
        bpm: Option<f64>,

        /// Stop after this many seconds; runs until Ctrl-C when omitted
        #[arg(long)]
        seconds: Option<f64>,
    },

    /// Render the demo pattern to a WAV file
    Render {
        /// Output WAV path
        out: PathBuf,

        /// Tempo in BPM (overrides settings)
        #[arg(long)]
        bpm: Option<f64>,

        /// Length of the render
        #[arg(long, default_value_t = 8.0)]
        seconds: f64,

        /// Sample rate of the WAV file
        #[arg(long, default_value_t = 44100)]
        sample_rate: u32,
    },

    /// Talk to the live agent while the sequencer plays
    Live {
        /// Also run the demo pattern during the session
        #[arg(long)]
        with_pattern: bool,
    },
}

impl Args {
    /// Get the log level filter based on verbosity flags
    pub fn log_level(&self) -> LevelFilter {
        if self.quiet {
            LevelFilter::Error
        } else {
            match self.verbose {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }
}

/// Initialize the logging system based on CLI arguments
pub fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::new();

    // Base level for all modules - keep at warn to suppress noisy deps
    builder.filter_level(LevelFilter::Warn);

    builder.filter_module("jamlink", args.log_level());

    // Websocket and TLS internals only at -vvvv
    if args.verbose >= 4 {
        builder.filter_module("tungstenite", args.log_level());
        builder.filter_module("tokio_tungstenite", args.log_level());
        builder.filter_module("rustls", args.log_level());
    }

    builder.format_timestamp_millis().init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_levels() {
        let args = Args::parse_from(["jamlink", "render", "out.wav"]);
        assert_eq!(args.log_level(), LevelFilter::Warn);

        let args = Args::parse_from(["jamlink", "-vv", "render", "out.wav"]);
        assert_eq!(args.log_level(), LevelFilter::Debug);

        let args = Args::parse_from(["jamlink", "play", "-q", "-vvv"]);
        assert_eq!(args.log_level(), LevelFilter::Error);
    }

    #[test]
    fn test_render_defaults() {
        let args = Args::parse_from(["jamlink", "render", "beat.wav", "--bpm", "90"]);
        assert_eq!(
            args.command,
            Command::Render {
                out: PathBuf::from("beat.wav"),
                bpm: Some(90.0),
                seconds: 8.0,
                sample_rate: 44100,
            }
        );
    }

    #[test]
    fn test_live_flag() {
        let args = Args::parse_from(["jamlink", "live", "--with-pattern"]);
        assert_eq!(args.command, Command::Live { with_pattern: true });
    }
}
