//! TfSvn administration CLI
//!
//! Inspection tooling for the gateway's svndiff traffic: decode a captured
//! stream into its windows, apply one against a source file, or produce the
//! chunked base64 payload the gateway would transmit for a file.

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tfsvn_core::{EncodedPayload, apply_stream, decode_windows};

#[derive(Parser, Debug)]
#[command(name = "tfsvn")]
#[command(author = "TfSvn Contributors")]
#[command(version = "0.1.0")]
#[command(about = "TfSvn svndiff stream inspection tool")]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Decode an svndiff stream and print its windows
    Dump {
        /// Stream file ("-" for stdin)
        #[arg(short, long)]
        file: String,

        /// Treat the input as base64 text
        #[arg(long)]
        base64: bool,
    },

    /// Apply an svndiff stream and write the produced target
    Apply {
        /// Stream file ("-" for stdin)
        #[arg(short, long)]
        delta: String,

        /// Source file the stream's copy instructions read from
        #[arg(short, long)]
        source: Option<PathBuf>,

        /// Output path (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Treat the input as base64 text
        #[arg(long)]
        base64: bool,
    },

    /// Produce the chunked base64 payload and md5 for a file
    Encode {
        /// Input file
        #[arg(short, long)]
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::WARN.into())
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    match cli.command {
        Commands::Dump { file, base64 } => {
            let stream = read_stream(&file, base64)?;
            dump_stream(&stream)?;
        }

        Commands::Apply { delta, source, output, base64 } => {
            let stream = read_stream(&delta, base64)?;
            let source_bytes = match source {
                Some(path) => fs::read(&path)
                    .with_context(|| format!("Failed to read source file {:?}", path))?,
                None => Vec::new(),
            };
            let target = apply_stream(&stream, &source_bytes)?;
            debug!(bytes = target.len(), "stream applied");
            match output {
                Some(path) => fs::write(&path, &target)
                    .with_context(|| format!("Failed to write output to {:?}", path))?,
                None => {
                    use std::io::Write;
                    std::io::stdout().write_all(&target)?;
                }
            }
        }

        Commands::Encode { file } => {
            let raw = fs::read(&file)
                .with_context(|| format!("Failed to read input file {:?}", file))?;
            let payload = EncodedPayload::encode(&raw);
            println!("md5:     {}", payload.md5);
            println!("payload: {}", payload.base64);
        }
    }

    Ok(())
}

fn read_stream(path: &str, base64: bool) -> Result<Vec<u8>> {
    let raw = if path == "-" {
        use std::io::Read;
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf)?;
        buf
    } else {
        fs::read(path).with_context(|| format!("Failed to read stream from {:?}", path))?
    };

    if base64 {
        let filtered: Vec<u8> = raw
            .into_iter()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        Ok(BASE64
            .decode(&filtered)
            .context("Failed to decode base64 stream")?)
    } else {
        Ok(raw)
    }
}

fn dump_stream(stream: &[u8]) -> Result<()> {
    let windows = decode_windows(stream)?;
    println!("svndiff version 0, {} window(s), {} bytes", windows.len(), stream.len());
    for (index, window) in windows.iter().enumerate() {
        println!(
            "window {:>3}: source {}+{} target {} instructions {} data {}",
            index,
            window.source_offset,
            window.source_len,
            window.target_len,
            window.instructions.len(),
            window.new_data.len(),
        );
    }
    Ok(())
}
