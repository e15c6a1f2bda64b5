use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use echo_engine::devices::{print_devices, CpalBackend, DeviceSelector};
use echo_engine::config::MAX_DELAY_LIMIT_SECONDS;
use echo_engine::{EffectParameters, EngineConfig, EngineController, ParamSnapshot};
use std::io::BufRead;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name="echo-fx", version, about="Live microphone echo")]
struct Cli {
    #[command(subcommand)]
    cmd: Command
}

#[derive(Subcommand)]
enum Command {
    /// List audio devices
    Devices,
    /// Run the echo on live input until `quit` (or --duration)
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Input device name (substring, case-insensitive)
    #[arg(long)]
    input: Option<String>,
    /// Output device name (substring, case-insensitive)
    #[arg(long)]
    output: Option<String>,
    /// Input device index from `devices`
    #[arg(long)]
    input_index: Option<usize>,
    /// Output device index from `devices`
    #[arg(long)]
    output_index: Option<usize>,
    /// Samples per block (default: device minimum)
    #[arg(long)]
    block_frames: Option<usize>,
    #[arg(long, default_value_t = 1.0)]
    volume: f32,
    /// Echo delay in seconds
    #[arg(long, default_value_t = 0.5)]
    delay: f32,
    /// Fraction of the echo fed back, 0 to just under 1
    #[arg(long, default_value_t = 0.4)]
    decay: f32,
    /// Longest delay the session can be set to, in seconds (at most 60)
    #[arg(long, default_value_t = 2.0)]
    max_delay: f32,
    /// Ask the platform for hardware echo cancellation
    #[arg(long)]
    aec: bool,
    /// Stop after this many seconds
    #[arg(long)]
    duration: Option<f64>,
}

/// Parameter edits typed on stdin while running.
#[derive(Debug, PartialEq)]
enum Control {
    Volume(f32),
    Delay(f32),
    Decay(f32),
    Status,
    Quit,
}

fn parse_control(line: &str) -> Result<Control> {
    let mut parts = line.split_whitespace();
    let cmd = parts.next().unwrap_or_default();
    let mut value = || -> Result<f32> {
        let raw = parts.next().context("missing value")?;
        raw.parse::<f32>().with_context(|| format!("not a number: {raw}"))
    };
    Ok(match cmd {
        "volume" | "v" => Control::Volume(value()?),
        "delay" | "d" => Control::Delay(value()?),
        "decay" | "k" => Control::Decay(value()?),
        "status" | "s" | "" => Control::Status,
        "quit" | "q" | "exit" => Control::Quit,
        other => bail!("unknown command: {other} (volume|delay|decay <x>, status, quit)"),
    })
}

/// The engine takes values as given; keep them in range here.
fn apply(params: &EffectParameters, ctl: &Control, max_delay: f32) {
    match *ctl {
        Control::Volume(v) => params.set_volume(v.max(0.0)),
        Control::Delay(s) => params.set_delay_seconds(s.clamp(0.001, max_delay)),
        Control::Decay(d) => params.set_decay(d.clamp(0.0, 0.99)),
        Control::Status | Control::Quit => {}
    }
}

fn engine_config(args: &RunArgs) -> EngineConfig {
    EngineConfig {
        block_frames: args.block_frames,
        // NaN collapses to the floor
        max_delay_seconds: args.max_delay.max(0.001).min(MAX_DELAY_LIMIT_SECONDS),
        hardware_echo_cancellation: args.aec,
        ..EngineConfig::default()
    }
}

fn run(args: RunArgs) -> Result<()> {
    let cfg = engine_config(&args);
    let backend = CpalBackend::new(
        DeviceSelector { name: args.input, index: args.input_index },
        DeviceSelector { name: args.output, index: args.output_index },
    );
    let engine = EngineController::new(backend, cfg);
    let max_delay = engine.config().max_delay_seconds;
    for ctl in [Control::Volume(args.volume), Control::Delay(args.delay), Control::Decay(args.decay)] {
        apply(engine.params(), &ctl, max_delay);
    }

    engine.start();

    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })
        .context("failed to spawn stdin reader")?;

    let deadline = args.duration.map(|s| Instant::now() + Duration::from_secs_f64(s.max(0.0)));
    println!("running; commands: volume|delay|decay <x>, status, quit");
    while engine.is_running() {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        let line = match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(line) => line,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            // stdin closed: keep running until the deadline or a device error
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                thread::sleep(Duration::from_millis(100));
                continue;
            }
        };
        match parse_control(&line) {
            Ok(Control::Quit) => break,
            Ok(Control::Status) => print_status(&engine),
            Ok(ctl) => apply(engine.params(), &ctl, max_delay),
            Err(e) => eprintln!("{e:#}"),
        }
    }

    engine.shutdown();
    tracing::info!(stats = ?engine.stats(), "session summary");
    match engine.last_exit() {
        Some(exit) if !exit.is_clean() => bail!("session ended: {exit}"),
        _ => Ok(()),
    }
}

fn print_status(engine: &EngineController) {
    let ParamSnapshot { volume, delay_seconds, decay } = engine.params().snapshot();
    let stats = engine.stats();
    println!(
        "state={:?} volume={volume:.2} delay={delay_seconds:.3}s decay={decay:.2} blocks={} transient_errors={} overruns={}",
        engine.state(),
        stats.blocks_processed,
        stats.transient_errors,
        stats.overruns,
    );
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Command::Devices => print_devices(),
        Command::Run(args) => run(args),
    }
}
