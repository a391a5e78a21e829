use std::path::{Path, PathBuf};
use std::process;
use std::time::{SystemTime, UNIX_EPOCH};

use artpath::art::node::NodeKind;
use artpath::art::{Art, ArtStats};
use artpath::config::ArtConfig;
use artpath::error::ArtError;
use artpath::storage::file_manager::FileBlockManager;
use clap::{Parser, ValueEnum};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

const EXIT_OK: i32 = 0;
const EXIT_MALFORMED_DETECTED: i32 = 10;
const EXIT_FATAL_ERROR: i32 = 20;

#[derive(Clone, Debug, ValueEnum)]
enum OutputFormatArg {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "artpath-inspect", about = "Verify a checkpointed artpath index")]
struct Cli {
    /// Path to the block file
    db_path: PathBuf,

    /// Output format for inspection/reporting
    #[arg(long, value_enum, default_value = "text")]
    format: OutputFormatArg,
}

#[derive(Clone, Copy, Debug)]
enum InspectFatalKind {
    OpenFailed,
    LoadFailed,
}

impl InspectFatalKind {
    fn as_str(self) -> &'static str {
        match self {
            InspectFatalKind::OpenFailed => "OPEN_FAILED",
            InspectFatalKind::LoadFailed => "LOAD_FAILED",
        }
    }
}

/// Outcome of loading and verifying the index.
enum Inspection {
    Healthy(ArtStats),
    Malformed(String),
}

impl Inspection {
    fn exit_code(&self) -> i32 {
        match self {
            Inspection::Healthy(_) => EXIT_OK,
            Inspection::Malformed(_) => EXIT_MALFORMED_DETECTED,
        }
    }
}

fn inspect(path: &Path) -> Result<Inspection, (InspectFatalKind, String)> {
    let mut manager = match FileBlockManager::open(path) {
        Ok(manager) => manager,
        Err(e @ ArtError::Corruption(_)) => return Ok(Inspection::Malformed(e.to_string())),
        Err(e) => return Err((InspectFatalKind::OpenFailed, format!("Failed to open block file: {}", e))),
    };
    let art = match Art::load(&mut manager, ArtConfig::default()) {
        Ok(art) => art,
        Err(e @ ArtError::Corruption(_)) | Err(e @ ArtError::BlockNotFound(_)) => {
            return Ok(Inspection::Malformed(e.to_string()));
        }
        Err(e) => return Err((InspectFatalKind::LoadFailed, format!("Failed to load index: {}", e))),
    };
    match art.verify() {
        Ok(()) => Ok(Inspection::Healthy(art.stats())),
        Err(e) => Ok(Inspection::Malformed(e.to_string())),
    }
}

fn generated_at() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn stats_json(stats: &ArtStats) -> Value {
    let per_kind = |counts: &[usize]| -> Value {
        NodeKind::ALL
            .iter()
            .map(|kind| (format!("{:?}", kind), json!(counts[kind.index()])))
            .collect::<serde_json::Map<_, _>>()
            .into()
    };
    json!({
        "keys": stats.keys,
        "row_ids": stats.row_ids,
        "nodes": per_kind(&stats.nodes),
        "buffers": per_kind(&stats.buffers),
        "prefix_chains": stats.prefix_chains,
        "prefix_bytes": stats.prefix_bytes,
        "longest_chain": stats.longest_chain,
    })
}

fn build_inspect_json(path: &Path, inspection: &Inspection) -> Value {
    let (status, stats, malformed) = match inspection {
        Inspection::Healthy(stats) => ("ok", stats_json(stats), Value::Null),
        Inspection::Malformed(reason) => ("malformed", Value::Null, json!(reason)),
    };
    json!({
        "schema_version": 1,
        "db_path": path.display().to_string(),
        "generated_at": generated_at(),
        "status": status,
        "stats": stats,
        "malformed": malformed,
        "fatal_error": null,
        "fatal_error_code": null,
        "exit_code": inspection.exit_code(),
    })
}

fn build_inspect_json_fatal(path: &Path, kind: InspectFatalKind, msg: &str) -> Value {
    json!({
        "schema_version": 1,
        "db_path": path.display().to_string(),
        "generated_at": generated_at(),
        "status": "fatal",
        "stats": null,
        "malformed": null,
        "fatal_error": msg,
        "fatal_error_code": kind.as_str(),
        "exit_code": EXIT_FATAL_ERROR,
    })
}

fn print_text(inspection: &Inspection) {
    match inspection {
        Inspection::Healthy(stats) => {
            println!("Index inspection summary:");
            println!("  keys: {}", stats.keys);
            println!("  row ids: {}", stats.row_ids);
            for kind in NodeKind::ALL {
                println!(
                    "  {:?}: {} nodes in {} buffers",
                    kind,
                    stats.nodes[kind.index()],
                    stats.buffers[kind.index()]
                );
            }
            println!(
                "  prefix chains: {} ({} bytes, longest {} bytes)",
                stats.prefix_chains, stats.prefix_bytes, stats.longest_chain
            );
        }
        Inspection::Malformed(reason) => {
            println!("Index inspection found a malformed index:");
            println!("  {}", reason);
        }
    }
}

fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let inspection = match inspect(&cli.db_path) {
        Ok(inspection) => inspection,
        Err((kind, msg)) => {
            match cli.format {
                OutputFormatArg::Text => eprintln!("ERROR: {}", msg),
                OutputFormatArg::Json => {
                    println!("{}", build_inspect_json_fatal(&cli.db_path, kind, &msg))
                }
            }
            process::exit(EXIT_FATAL_ERROR);
        }
    };

    match cli.format {
        OutputFormatArg::Text => print_text(&inspection),
        OutputFormatArg::Json => println!("{}", build_inspect_json(&cli.db_path, &inspection)),
    }
    process::exit(inspection.exit_code());
}
