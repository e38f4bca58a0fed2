//! midiplay - Play Standard MIDI Files from the terminal.
//!
//! Events are scheduled on a software sequencer and delivered to a
//! SoundFont synthesizer and/or the system's MIDI output ports.
//!
//! # Usage
//!
//! ```bash
//! midiplay song.mid -s font.sf2         # Play once through the synthesizer
//! midiplay song.mid -l -1 --allow-pause # Repeat forever, space pauses
//! midiplay --list-ports                 # Show where events can go
//! ```
//!
//! While playing: space pauses/resumes, `+`/`-` change the volume and
//! `q`, Esc or Ctrl-C stop.

use anyhow::{bail, Context, Result};
use clap::Parser;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use midiplay::midi::MAX_DATA;
use midiplay::sequencer::{MidiSink, MidirSink, SynthSink};
use midiplay::{PlaybackState, PlayerConfig, Sequencer, SoftSequencer, Song};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

/// Volume change per key press.
const VOLUME_STEP: i32 = 8;

/// Command-line options.
#[derive(Debug, Parser)]
#[command(name = "midiplay", version, about = "Play MIDI files through a sequencer")]
struct Cli {
    /// Standard MIDI File to play
    #[arg(required_unless_present = "list_ports")]
    file: Option<PathBuf>,

    /// Extra repeats after the first pass (negative repeats forever)
    #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
    loops: i32,

    /// SoundFont (.sf2) for the built-in synthesizer
    #[arg(short, long)]
    soundfont: Option<PathBuf>,

    /// Output port (client:port, client or client name)
    #[arg(short, long)]
    port: Option<String>,

    /// Do not connect any port; only existing subscribers hear the song
    #[arg(long)]
    no_connect: bool,

    /// Use a real transport pause instead of ignoring pause requests
    #[arg(long)]
    allow_pause: bool,

    /// Initial master volume (0-127)
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=127))]
    volume: Option<u8>,

    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// List output ports and exit
    #[arg(long)]
    list_ports: bool,
}

impl Cli {
    /// Merges file, environment and command line, in rising priority.
    fn player_config(&self) -> Result<PlayerConfig> {
        let mut config = match &self.config {
            Some(path) => PlayerConfig::from_json_file(path)?,
            None => PlayerConfig::default(),
        };
        config.merge_env();

        if let Some(port) = &self.port {
            config.output_ports = Some(port.clone());
        }
        if self.no_connect {
            config.no_connect_ports = true;
        }
        if self.allow_pause {
            config.allow_pause = true;
        }
        Ok(config)
    }
}

/// Leaves raw mode when dropped, whatever ends playback.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Result<Self> {
        enable_raw_mode().context("Failed to enable raw mode")?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Main entry point.
fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = cli.player_config()?;
    let app_name = config.app_name();

    let mut sinks: Vec<Box<dyn MidiSink>> = Vec::new();
    if let Some(path) = &cli.soundfont {
        let synth = SynthSink::new(path).context("Failed to initialize synthesizer")?;
        sinks.push(Box::new(synth));
    }
    match MidirSink::list(&app_name) {
        Ok(ports) => sinks.extend(ports.into_iter().map(|p| Box::new(p) as Box<dyn MidiSink>)),
        Err(e) => tracing::warn!("MIDI ports unavailable: {}", e),
    }

    let seq = SoftSequencer::open(&app_name, sinks).context("Failed to open sequencer")?;

    if cli.list_ports {
        print_ports(&seq);
        return Ok(());
    }

    let Some(file) = &cli.file else {
        bail!("No MIDI file given");
    };
    let mut song = Song::load_file(file, &config, Box::new(seq))
        .with_context(|| format!("Failed to load {}", file.display()))?;

    match song.destination().connected {
        Some(addr) => eprintln!("Playing {} on {}", file.display(), addr),
        None => eprintln!("Playing {} to subscribers", file.display()),
    }

    song.start(cli.loops);
    let mut volume = cli.volume.map_or(MAX_DATA as i32, i32::from);
    if cli.volume.is_some() {
        while song.state() == PlaybackState::Starting {
            thread::sleep(Duration::from_millis(1));
        }
        song.set_volume(volume);
    }

    if std::io::stdin().is_terminal() {
        let _raw = RawModeGuard::enable()?;
        run_transport(&mut song, &mut volume, config.allow_pause)?;
    } else {
        while song.is_active() {
            thread::sleep(Duration::from_millis(100));
        }
    }

    song.stop();
    if let Some(e) = song.last_error() {
        bail!("Playback failed: {}", e);
    }
    song.free();
    Ok(())
}

/// Handles transport keys until the song ends or the user quits.
fn run_transport(song: &mut Song, volume: &mut i32, allow_pause: bool) -> Result<()> {
    while song.is_active() {
        if !event::poll(Duration::from_millis(100))? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }

        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => break,
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => break,
            KeyCode::Char(' ') => {
                if !allow_pause {
                    tracing::info!("Pause is disabled, use --allow-pause");
                } else if song.state() == PlaybackState::Paused {
                    song.resume();
                } else {
                    song.pause();
                }
            }
            KeyCode::Char('+') | KeyCode::Char('=') => {
                *volume = (*volume + VOLUME_STEP).min(MAX_DATA as i32);
                song.set_volume(*volume);
            }
            KeyCode::Char('-') => {
                *volume = (*volume - VOLUME_STEP).max(0);
                song.set_volume(*volume);
            }
            _ => {}
        }
    }
    Ok(())
}

fn print_ports(seq: &SoftSequencer) {
    println!(" Port    Client name                      Port name");
    for port in seq.ports() {
        if port.addr == seq.source() {
            continue;
        }
        println!(
            "{:>3}:{:<3}  {:<32} {}",
            port.addr.client, port.addr.port, port.client_name, port.name
        );
    }
}
