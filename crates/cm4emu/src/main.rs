//! Command-line front end: load an image, run it, report the exit status.

use std::path::PathBuf;
use std::process;

use cm4emu::{CpuVariant, LogLevel, Machine, MachineConfig, Status};

struct CliArgs {
    image_path: Option<PathBuf>,
    loglevel: LogLevel,
    variant: CpuVariant,
    mem_size: usize,
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = CliArgs {
        image_path: None,
        loglevel: LogLevel::Error,
        variant: CpuVariant::CortexM4,
        mem_size: 32 * 1024,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-v" => cli.loglevel = LogLevel::Warn,
            "-vv" => cli.loglevel = LogLevel::Calls,
            "-vvv" => cli.loglevel = LogLevel::CallsSp,
            "-vvvv" => cli.loglevel = LogLevel::Instrs,
            "--base" => cli.variant = CpuVariant::Base,
            "--mem-size" => {
                i += 1;
                if let Some(s) = args.get(i) {
                    cli.mem_size = s.parse().unwrap_or(cli.mem_size);
                }
            }
            "--help" | "-h" => {
                eprintln!("Usage: cm4emu [-v|-vv|-vvv|-vvvv] [--base] [--mem-size N] <image.bin>");
                process::exit(0);
            }
            other => {
                cli.image_path = Some(PathBuf::from(other));
            }
        }
        i += 1;
    }

    cli
}

fn main() {
    let cli = parse_args();
    let Some(image_path) = cli.image_path else {
        eprintln!("error: no image file given");
        process::exit(2);
    };

    let data = match std::fs::read(&image_path) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("error: reading {}: {e}", image_path.display());
            process::exit(2);
        }
    };

    let config = MachineConfig {
        loglevel: cli.loglevel,
        variant: cli.variant,
        mem_size: cli.mem_size,
        image_size: data.len().max(MachineConfig::default().image_size),
        ..MachineConfig::default()
    };

    let mut machine = match Machine::create(config) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(2);
        }
    };
    // UART stdin/stdout wiring (raw-mode terminal handling) is left to a
    // future front end; this binary runs headless against NullConsole.
    if let Err(e) = machine.load(&data) {
        eprintln!("error: {e}");
        process::exit(2);
    }
    machine.reset();

    let status = machine.run();
    match status {
        Status::Exit => process::exit(0),
        other => {
            eprintln!("stopped: {other}");
            process::exit(1);
        }
    }
}
