//! dpcsim - display pipeline simulator
//!
//! Brings up every display of a platform description on the simulated
//! command-queue engine, commits frames and prints what the hardware saw.
//! Usage: dpcsim [OPTIONS]

use std::process::ExitCode;
use std::sync::Arc;

use dpc::cmdq::SimEngine;
use dpc::{
    diag, logger, Collaborators, DisplayConfig, DisplayPipeline, DisplaySubsystem, DpcResult,
    FrameConfig, LayerConfig, PanelConfig, PlatformConfig, SocVariant,
};

struct Options {
    config: Option<String>,
    frames: usize,
    stall_at: Option<usize>,
    mode: Option<u32>,
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let mut opts = Options { config: None, frames: 8, stall_at: None, mode: None };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_usage();
                return ExitCode::SUCCESS;
            }
            "-V" | "--version" => {
                println!("dpcsim {}", dpc::VERSION);
                return ExitCode::SUCCESS;
            }
            "-c" | "--config" => {
                i += 1;
                match args.get(i) {
                    Some(path) => opts.config = Some(path.clone()),
                    None => return missing_value("--config"),
                }
            }
            "-n" | "--frames" => {
                i += 1;
                match args.get(i).and_then(|v| v.parse().ok()) {
                    Some(n) => opts.frames = n,
                    None => return missing_value("--frames"),
                }
            }
            "--stall-at" => {
                i += 1;
                match args.get(i).and_then(|v| v.parse().ok()) {
                    Some(n) => opts.stall_at = Some(n),
                    None => return missing_value("--stall-at"),
                }
            }
            "-m" | "--mode" => {
                i += 1;
                match args.get(i).and_then(|v| v.parse().ok()) {
                    Some(m) => opts.mode = Some(m),
                    None => return missing_value("--mode"),
                }
            }
            other => {
                eprintln!("Unknown option: {}", other);
                print_usage();
                return ExitCode::from(1);
            }
        }
        i += 1;
    }

    logger::init();
    match run(&opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("dpcsim: {}", e);
            ExitCode::from(1)
        }
    }
}

fn missing_value(flag: &str) -> ExitCode {
    eprintln!("Missing or invalid value for {}", flag);
    ExitCode::from(1)
}

fn run(opts: &Options) -> DpcResult<()> {
    let cfg = match &opts.config {
        Some(path) => PlatformConfig::load(path)?,
        None => PlatformConfig::with_displays(
            SocVariant::Mt6985,
            vec![DisplayConfig::new(0, PanelConfig::new(1080, 2400, 120))],
        ),
    };
    let engine = Arc::new(SimEngine::default());
    let subsystem = DisplaySubsystem::new(cfg, engine.clone())?;
    println!("platform: {}", subsystem.soc().variant);

    let mut displays: Vec<DisplayPipeline> = Vec::new();
    for index in subsystem.display_indices() {
        let disp = subsystem.create_display(index, Collaborators::default())?;
        if let Some(mode) = opts.mode {
            disp.request_mode(mode)?;
        }
        disp.enable()?;
        displays.push(disp);
    }

    for frame in 0..opts.frames {
        if opts.stall_at == Some(frame) {
            println!("frame {}: stalling display 0", frame);
            engine.set_stall(0, true);
        }
        if opts.stall_at.map(|at| frame == at + 3).unwrap_or(false) {
            println!("frame {}: display 0 released", frame);
            engine.set_stall(0, false);
        }
        for disp in &displays {
            let geo = disp.geometry();
            let layers = (0..2).map(|n| {
                let mut layer = LayerConfig::full_screen(n, geo.width, geo.height);
                layer.fence = frame as u32 + 1;
                layer
            });
            let mut commit = FrameConfig::new()
                .with_bandwidth(if frame % 4 == 0 { 800 } else { 400 })
                .with_present_fence(frame as u32 + 1);
            for layer in layers {
                commit = commit.with_layer(layer);
            }
            disp.commit(&commit)?;
        }
        engine.tick();
    }

    for disp in &displays {
        disp.wait_idle()?;
        report(disp, &engine);
    }
    let dumps = diag::history();
    if !dumps.is_empty() {
        println!("{} diagnostic dump(s); last:", dumps.len());
        if let Some(last) = dumps.last() {
            print!("{}", last);
        }
    }
    Ok(())
}

fn report(disp: &DisplayPipeline, engine: &SimEngine) {
    let geo = disp.geometry();
    let counters = disp.counters();
    let hw = engine.stats(disp.index());
    println!(
        "disp{}: {} {}x{}@{} {:?}{}",
        disp.index(),
        disp.mode(),
        geo.width,
        geo.height,
        geo.refresh,
        disp.drive_mode(),
        if disp.is_dual() { " dual" } else { "" }
    );
    println!("  path:    {:?}", disp.components(disp.mode()));
    println!("  mutex:   {} ({:?})", disp.mutex(), disp.sync_source());
    println!(
        "  frames:  submitted {} completed {} aborted {} timeouts {} recoveries {}",
        counters.submitted, counters.completed, counters.aborted, counters.timeouts, counters.recoveries
    );
    println!("  hw:      triggers {} frames {} te {}", hw.triggers, hw.frames, hw.te_edges);
    println!("  bw:      {}", disp.bandwidth());
}

fn print_usage() {
    println!("dpcsim - display pipeline controller simulator");
    println!();
    println!("USAGE:");
    println!("    dpcsim [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help             Show this help message");
    println!("    -V, --version          Show version information");
    println!("    -c, --config <FILE>    Platform description (TOML)");
    println!("    -n, --frames <N>       Frames to commit (default 8)");
    println!("    -m, --mode <N>         Initial display mode (0 none, 1 major, 2 minor)");
    println!("        --stall-at <N>     Stall display 0 for three frames from frame N");
    println!();
    println!("EXAMPLES:");
    println!("    dpcsim -c config/mt6985.toml -n 16");
    println!("    RUST_LOG=debug dpcsim --stall-at 4");
}
