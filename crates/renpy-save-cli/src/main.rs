//! Command-line converter for Ren'Py save files.
//!
//! # Usage
//!
//! ```bash
//! renpy-save decode 1-1-LT1.save -o save.json
//! renpy-save encode save.json 1-1-LT1.save 1-2-LT1.save
//! renpy-save inspect 1-1-LT1.save
//! ```

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use renpy_save::codec::disassemble;
use renpy_save::{SaveArchive, TextOptions};

/// Convert Ren'Py saves to editable JSON and back
#[derive(Parser, Debug)]
#[command(name = "renpy-save", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode the game state of a save into a JSON document
    Decode {
        /// Save archive to read
        save: PathBuf,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Write dicts with number/bool/None keys as plain objects (lossy)
        #[arg(long)]
        stringify_keys: bool,

        /// Write compact JSON instead of pretty-printed
        #[arg(long)]
        compact: bool,
    },

    /// Build a save from a JSON document, copying everything else from a template save
    Encode {
        /// JSON document to read
        json: PathBuf,

        /// Save archive to take the other entries from
        template: PathBuf,

        /// Save archive to write
        output: PathBuf,

        /// Pickle protocol to write (default: the document's)
        #[arg(short, long, value_parser = clap::value_parser!(u8).range(2..=5))]
        protocol: Option<u8>,
    },

    /// Print the opcode listing of a save's log stream
    Inspect {
        /// Save archive (or bare pickle stream with --raw)
        save: PathBuf,

        /// Treat the input as a bare pickle stream
        #[arg(long)]
        raw: bool,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("renpy_save=info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Decode {
            save,
            output,
            stringify_keys,
            compact,
        } => {
            let options = TextOptions { stringify_keys };
            let document = renpy_save::decode_save_file(&save, &options)
                .with_context(|| format!("failed to decode {}", save.display()))?;
            let bytes = renpy_save::write_document(&document, compact)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
                    info!("wrote {}", path.display());
                }
                None => std::io::stdout().lock().write_all(&bytes)?,
            }
        }
        Command::Encode {
            json,
            template,
            output,
            protocol,
        } => {
            renpy_save::encode_save_file(&json, &template, &output, protocol)
                .with_context(|| format!("failed to build {} from {}", output.display(), json.display()))?;
        }
        Command::Inspect { save, raw } => {
            let log = if raw {
                std::fs::read(&save).with_context(|| format!("failed to read {}", save.display()))?
            } else {
                SaveArchive::open(&save)
                    .and_then(|mut archive| archive.log_bytes())
                    .with_context(|| format!("failed to read the log of {}", save.display()))?
            };
            let listing = disassemble(&log).context("malformed pickle stream")?;
            let mut out = std::io::stdout().lock();
            for ins in &listing {
                writeln!(out, "{:>8}: {:<18} {}", ins.offset, ins.opcode.name(), ins.arg)?;
            }
        }
    }
    Ok(())
}
