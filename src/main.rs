use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;

use mediascan::capability::CapabilityFlags;
use mediascan::engine::SystemMemoryProbe;
use mediascan::{
    logging, Config, EngineManager, FrameSampler, ResultStore, ScanOrchestrator,
};

enum Command {
    Scan { path: PathBuf, modules: Vec<String> },
    Batch { file: PathBuf, mime: Option<String> },
    Trending { limit: usize },
    Stats,
}

struct Args {
    config_path: Option<PathBuf>,
    command: Command,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;
    let mut command = None;
    let mut modules = Vec::new();
    let mut mime = None;
    let mut limit = 20usize;
    let mut positional: Vec<String> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("mediascan {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--modules" | "-m" => {
                if i + 1 < args.len() {
                    modules = args[i + 1]
                        .split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect();
                    i += 1;
                } else {
                    eprintln!("Error: --modules requires a comma-separated list");
                    std::process::exit(1);
                }
            }
            "--mime" => {
                if i + 1 < args.len() {
                    mime = Some(args[i + 1].clone());
                    i += 1;
                } else {
                    eprintln!("Error: --mime requires a value");
                    std::process::exit(1);
                }
            }
            "--limit" | "-n" => {
                if i + 1 < args.len() {
                    match args[i + 1].parse() {
                        Ok(n) => limit = n,
                        Err(_) => {
                            eprintln!("Error: --limit requires a number");
                            std::process::exit(1);
                        }
                    }
                    i += 1;
                } else {
                    eprintln!("Error: --limit requires a number");
                    std::process::exit(1);
                }
            }
            "scan" | "batch" | "trending" | "stats" if command.is_none() => {
                command = Some(args[i].clone());
            }
            other if !other.starts_with('-') && command.is_some() => {
                positional.push(other.to_string());
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    let command = match command.as_deref() {
        Some("scan") => {
            let Some(path) = positional.first() else {
                eprintln!("Error: scan requires a file path");
                std::process::exit(1);
            };
            Command::Scan {
                path: PathBuf::from(path),
                modules,
            }
        }
        Some("batch") => {
            let Some(file) = positional.first() else {
                eprintln!("Error: batch requires a file path");
                std::process::exit(1);
            };
            Command::Batch {
                file: PathBuf::from(file),
                mime,
            }
        }
        Some("trending") => Command::Trending { limit },
        Some("stats") => Command::Stats,
        _ => {
            print_help();
            std::process::exit(1);
        }
    };

    Args {
        config_path,
        command,
    }
}

fn print_help() {
    println!(
        r#"mediascan - content-addressed incremental media analysis

USAGE:
    mediascan [OPTIONS] <COMMAND>

COMMANDS:
    scan PATH           Analyze one media file, computing only what is
                        not already recorded for its content
    batch PATH          Sample frames from animated/video content and
                        report aggregate risk and tags
    trending            Show trending tags over the last week
    stats               Show legacy scan counters

OPTIONS:
    --modules, -m LIST  Capabilities for scan (basic,risk,tags,face,vector;
                        default basic)
    --mime TYPE         Media type hint for batch (default guessed from
                        the file extension)
    --limit, -n N       Number of trending entries (default 20)
    --config, -c PATH   Path to config file
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    MEDIASCAN_LOG       Log level (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/mediascan/config.toml"#
    );
}

/// Media type guess from the extension, for batch inputs without a hint.
fn guess_mime(path: &PathBuf) -> String {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "gif" => "image/gif".to_string(),
        "webp" => "image/webp".to_string(),
        "apng" | "png" => "image/apng".to_string(),
        "mp4" | "m4v" => "video/mp4".to_string(),
        "webm" => "video/webm".to_string(),
        "mkv" => "video/x-matroska".to_string(),
        "avi" => "video/x-msvideo".to_string(),
        "mov" => "video/quicktime".to_string(),
        _ => "application/octet-stream".to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    // Initialize logging (uses journald on Linux, file fallback otherwise)
    let _ = logging::init(None);

    let config = match args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let store = Arc::new(ResultStore::open(&config.storage.db_path)?);
    let engines = Arc::new(EngineManager::new(
        config.engines.clone(),
        Arc::new(SystemMemoryProbe),
    ));
    engines.spawn_idle_sweep();

    match args.command {
        Command::Scan { path, modules } => {
            let orchestrator =
                ScanOrchestrator::new(Arc::clone(&store), engines, &config.scanner);
            let requested = CapabilityFlags::from_names(&modules);
            let outcome = orchestrator.scan(&path, requested).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::Batch { file, mime } => {
            let mime = mime.unwrap_or_else(|| guess_mime(&file));
            let bytes = tokio::fs::read(&file).await?;
            let sampler = FrameSampler::new(engines, config.sampler.clone());
            let outcome = sampler.scan_batch(&bytes, &mime).await?;
            if let Err(e) = store.record_legacy_scan(&outcome.tags) {
                tracing::warn!(error = %e, "legacy counter update failed");
            }
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::Trending { limit } => {
            let trending = store.weighted_trending(limit)?;
            println!("{}", serde_json::to_string_pretty(&trending)?);
        }
        Command::Stats => {
            let stats = store.legacy_stats(10)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}
