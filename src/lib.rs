pub mod audio;
pub mod cli;
pub mod clock;
pub mod sequencer;
pub mod session;
pub mod settings;
pub mod streaming;

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;

use audio::{CpalCapture, CpalOutput, OutputBus};
use cli::{Args, Command};
use sequencer::offline::{demo_pattern, render_pattern};
use sequencer::{Sequencer, StepGrid, Tempo, ToneGenerator};
use session::{DuplexSession, SessionState};
use settings::AppSettings;
use streaming::{LiveClient, TranscriptEntry};

type AppResult<T> = Result<T, Box<dyn Error>>;

// ============================================================================
// Application entry point
// ============================================================================

pub fn run() -> AppResult<()> {
    let args = Args::parse();
    cli::init_logging(&args);

    let settings = load_app_settings(&args);
    log::info!("Starting jamlink ({:?})", args.command);

    match args.command {
        Command::Render {
            out,
            bpm,
            seconds,
            sample_rate,
        } => {
            let tempo = Tempo::new(bpm.unwrap_or(settings.bpm))?;
            let frames = render_pattern(&demo_pattern(), tempo, seconds, sample_rate, &out)?;
            println!(
                "Wrote {} frames ({:.1}s at {} BPM) to {}",
                frames,
                seconds,
                tempo.bpm(),
                out.display()
            );
            Ok(())
        }
        Command::Play { bpm, seconds } => {
            let runtime = build_runtime()?;
            runtime.block_on(play(&settings, bpm, seconds))
        }
        Command::Live { with_pattern } => {
            let runtime = build_runtime()?;
            runtime.block_on(live(&settings, with_pattern))
        }
    }
}

fn load_app_settings(args: &Args) -> AppSettings {
    let path = match &args.settings {
        Some(path) => path.clone(),
        None => match settings::default_settings_path() {
            Ok(path) => path,
            Err(e) => {
                log::warn!("{}; using default settings", e);
                return AppSettings::default();
            }
        },
    };
    log::debug!("Loading settings from {:?}", path);
    settings::load_settings(&path)
}

fn build_runtime() -> AppResult<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("jamlink-rt")
        .build()?)
}

/// Build a sequencer on `bus` and load `pattern` into it.
fn pattern_sequencer(
    settings: &AppSettings,
    bpm: Option<f64>,
    bus: &Arc<OutputBus>,
    pattern: &StepGrid,
) -> AppResult<Sequencer> {
    let tempo = Tempo::new(bpm.unwrap_or(settings.bpm))?;
    let tones = ToneGenerator::new(bus.clone(), bus.sample_rate());
    let sequencer = Sequencer::new(
        settings.sequencer_config(),
        tempo,
        bus.clone(),
        Arc::new(tones),
    );

    for (pitch, steps) in pattern.snapshot() {
        for (step, active) in steps.into_iter().enumerate() {
            if !active {
                continue;
            }
            if let Err(e) = sequencer.set_step(pitch, step, true) {
                log::debug!("Pattern note {} at step {} skipped: {}", pitch, step, e);
            }
        }
    }
    Ok(sequencer)
}

async fn play(settings: &AppSettings, bpm: Option<f64>, seconds: Option<f64>) -> AppResult<()> {
    let mut output = CpalOutput::start()?;
    let sequencer = pattern_sequencer(settings, bpm, &output.bus(), &demo_pattern())?;
    sequencer.start()?;
    println!("Playing at {} BPM, Ctrl-C to stop", sequencer.tempo());

    match seconds {
        Some(seconds) if seconds.is_finite() && seconds > 0.0 => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs_f64(seconds)) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        _ => {
            tokio::signal::ctrl_c().await?;
        }
    }

    sequencer.stop();
    // Let scheduled notes ring out
    tokio::time::sleep(Duration::from_millis(500)).await;
    output.stop();
    Ok(())
}

async fn live(settings: &AppSettings, with_pattern: bool) -> AppResult<()> {
    let client = LiveClient::from_env()?;
    let mut output = CpalOutput::start()?;
    let bus = output.bus();

    let sequencer = if with_pattern {
        let sequencer = pattern_sequencer(settings, None, &bus, &demo_pattern())?;
        sequencer.start()?;
        Some(sequencer)
    } else {
        None
    };

    let session = DuplexSession::new(client, bus.clone(), bus.clone(), settings.session_config());
    let capture = CpalCapture::new(settings.capture_rate, settings.capture_frame_size);

    let mut state_rx = session.subscribe_state();
    let mut transcript_rx = session.subscribe_transcript();

    let connected = tokio::select! {
        result = session.connect(Box::new(capture)) => result,
        _ = tokio::signal::ctrl_c() => {
            session.disconnect();
            Ok(())
        }
    };

    if let Err(e) = connected {
        if let Some(sequencer) = &sequencer {
            sequencer.stop();
        }
        output.stop();
        return Err(e.into());
    }

    if session.state() == SessionState::Connected {
        println!("Connected, start talking. Ctrl-C to end the session.");
        wait_for_session_end(&mut state_rx, &mut transcript_rx).await;
    }

    session.disconnect();
    if let Some(stats) = session.stats() {
        log::info!("Session stats: {}", serde_json::to_string(&stats)?);
    }
    if let Some(error) = session.last_error() {
        eprintln!("Session ended with error: {}", error);
    }

    if let Some(sequencer) = &sequencer {
        sequencer.stop();
    }
    output.stop();
    Ok(())
}

/// Print transcript lines until Ctrl-C or the session closes by itself.
async fn wait_for_session_end(
    state_rx: &mut watch::Receiver<SessionState>,
    transcript_rx: &mut watch::Receiver<Vec<TranscriptEntry>>,
) {
    let mut printed = 0;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = state_rx.changed() => {
                if changed.is_err() || *state_rx.borrow() == SessionState::Disconnected {
                    break;
                }
            }
            changed = transcript_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let entries = transcript_rx.borrow_and_update().clone();
                for entry in entries.iter().skip(printed) {
                    println!("[{}] {}", entry.source.as_str(), entry.text);
                }
                printed = entries.len();
            }
        }
    }
}
