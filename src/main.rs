use anyhow::Context;
use clap::{Parser, Subcommand};
use mongowire::config::{Config, OutputFormat};
use mongowire::framer::StreamDecoder;
use mongowire::protocol::Message;
use mongowire::{server, sink::TracingSink};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "mongowire", version, about = "Decode MongoDB wire protocol traffic")]
struct Cli {
    /// Config file; defaults to ./config.toml when present.
    #[arg(long, global = true, env = "MONGOWIRE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode captured streams, one TCP direction per file.
    Decode {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
        #[arg(long)]
        max_message_size: Option<usize>,
    },
    /// Accept connections and log every decoded message without replying.
    Listen {
        #[arg(long)]
        listen: Option<String>,
        #[arg(long)]
        max_message_size: Option<usize>,
    },
}

struct Decoded {
    file: PathBuf,
    messages: Vec<Message>,
    leftover: usize,
}

fn decode_file(file: PathBuf, max_message_size: usize) -> anyhow::Result<Decoded> {
    let bytes = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
    let mut decoder = StreamDecoder::new(max_message_size);
    let mut sink = TracingSink::new(file.display().to_string());
    decoder.push(&bytes);
    let messages = decoder.drain(&mut sink);
    let leftover = decoder.framer().buffered();
    Ok(Decoded {
        file,
        messages,
        leftover,
    })
}

fn print_decoded(decoded: &Decoded, format: OutputFormat) -> anyhow::Result<()> {
    let file = decoded.file.display().to_string();
    match format {
        OutputFormat::Text => {
            for msg in &decoded.messages {
                println!(
                    "{file}@{} [{}] {}",
                    msg.offset,
                    msg.header.request_id,
                    msg.summary()
                );
                for anomaly in &msg.anomalies {
                    println!("    {anomaly}");
                }
            }
            if decoded.leftover > 0 {
                println!("{file}: {} bytes of an incomplete message at end of stream", decoded.leftover);
            }
        }
        OutputFormat::Json => {
            for msg in &decoded.messages {
                let line = serde_json::json!({
                    "file": file,
                    "summary": msg.summary(),
                    "message": msg,
                });
                println!("{}", serde_json::to_string(&line)?);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging with env filter, e.g.: RUST_LOG=info,mongowire=debug
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();
    let mut cfg = match &cli.config {
        Some(path) => Config::load_from(path)?.with_env_overrides()?,
        None => Config::load().unwrap_or_default(),
    };

    match cli.command {
        Command::Decode {
            files,
            format,
            max_message_size,
        } => {
            let format = format.unwrap_or(cfg.format);
            let max_message_size = max_message_size.unwrap_or(cfg.max_message_size);
            tracing::debug!(files = files.len(), max_message_size, "decoding captures");

            let tasks: Vec<_> = files
                .into_iter()
                .map(|file| tokio::task::spawn_blocking(move || decode_file(file, max_message_size)))
                .collect();
            let mut failed = 0usize;
            for task in tasks {
                match task.await? {
                    Ok(decoded) => print_decoded(&decoded, format)?,
                    Err(e) => {
                        failed += 1;
                        tracing::error!(error = %format!("{e:?}"), "decode failed");
                    }
                }
            }
            if failed > 0 {
                anyhow::bail!("{failed} file(s) could not be read");
            }
        }
        Command::Listen {
            listen,
            max_message_size,
        } => {
            if let Some(addr) = listen {
                cfg.listen_addr = addr;
            }
            if let Some(max) = max_message_size {
                cfg.max_message_size = max;
            }
            tracing::info!(listen_addr = %cfg.listen_addr, "starting mongowire");
            if let Err(e) = server::run(cfg).await {
                tracing::error!(error = %format!("{e:?}"), "observer terminated with error");
            }
        }
    }

    Ok(())
}
