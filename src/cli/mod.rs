//! CLI commands implementation.
//!
//! This module contains the CLI parser and dispatches to the scan
//! pipeline and maintenance helpers.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use crate::config::Settings;
use crate::hashdb::{self, Partition};
use crate::host::{HostApi, StandaloneHost};
use crate::pipeline::{ImageOutcome, Scanner};
use crate::scanset::ScansetRegistry;
use crate::tool;

#[derive(Parser)]
#[command(name = "ocrsieve")]
#[command(about = "OCR-based spam scoring for email image and PDF attachments")]
#[command(version)]
pub struct Cli {
    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Score the attachments of an RFC822 message file
    Scan {
        /// Message file (.eml)
        message: PathBuf,

        /// Pre-existing score of the message
        #[arg(long, default_value_t = 0.0)]
        score: f32,

        /// Emit the full report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Report availability of the configured external tools
    Check,

    /// Inspect or edit the hash cache
    Hashdb {
        #[command(subcommand)]
        command: HashdbCommands,
    },

    /// Show scansets in their adaptive order
    Scansets,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum PartitionArg {
    Spam,
    Good,
}

impl From<PartitionArg> for Partition {
    fn from(arg: PartitionArg) -> Self {
        match arg {
            PartitionArg::Spam => Partition::KnownSpam,
            PartitionArg::Good => Partition::KnownGood,
        }
    }
}

#[derive(Subcommand)]
enum HashdbCommands {
    /// List the records of a cache partition
    List {
        #[arg(value_enum, default_value = "spam")]
        partition: PartitionArg,
    },

    /// Remove a digest from a cache partition
    Forget {
        digest: String,

        #[arg(value_enum, default_value = "spam")]
        partition: PartitionArg,
    },
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Scan {
            message,
            score,
            json,
        } => scan_command(settings, &message, score, json).await,
        Commands::Check => {
            check_command(&settings);
            Ok(())
        }
        Commands::Hashdb { command } => hashdb_command(&settings, command),
        Commands::Scansets => {
            scansets_command(&settings);
            Ok(())
        }
    }
}

async fn scan_command(
    settings: Settings,
    message: &Path,
    score: f32,
    json: bool,
) -> anyhow::Result<()> {
    let raw = std::fs::read(message)
        .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", message.display()))?;

    let mut host = StandaloneHost::with_score(raw.clone(), score);
    let mut scanner = Scanner::new(settings);
    let report = scanner.scan(&raw, &mut host).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for image in &report.images {
        println!(
            "  {:30} {:6} {}",
            image.filename,
            image.format.as_deref().unwrap_or("-"),
            describe_outcome(&image.outcome)
        );
    }
    for fired in &host.reports {
        println!("  rule {:30} {:+.3} {}", fired.rule, fired.score, fired.description);
    }
    if report.global_timeout {
        println!("  global timeout exceeded, message abandoned");
    }
    if let Some(kept) = &report.kept_workspace {
        println!("  workspace kept at {}", kept.display());
    }
    println!("score: {:.3}", report.score);
    println!("message total: {:.3}", host.current_score());
    Ok(())
}

fn describe_outcome(outcome: &ImageOutcome) -> String {
    match outcome {
        ImageOutcome::Rejected { reason } => format!("rejected ({reason})"),
        ImageOutcome::KnownSpam { score } => format!("known spam ({score:.3})"),
        ImageOutcome::KnownGood => "known good, ocr skipped".to_string(),
        ImageOutcome::Scanned {
            matches,
            scanset,
            despaced,
            ..
        } => {
            let engine = scanset.as_deref().unwrap_or("-");
            let pass = if *despaced { ", despaced" } else { "" };
            format!("{matches} match(es) via {engine}{pass}")
        }
        ImageOutcome::Aborted { reason } => format!("aborted ({reason})"),
    }
}

fn check_command(settings: &Settings) {
    println!("External tool availability:");
    for (name, program) in settings.tools.all() {
        let status = if tool::tool_available(program) {
            "ok"
        } else {
            "MISSING"
        };
        println!("  {name:14} {program:12} {status}");
    }
    println!();
    println!("Scanset engines:");
    for scanset in &settings.scansets {
        let program = scanset.command.split_whitespace().next().unwrap_or("");
        let status = if tool::tool_available(program) {
            "ok"
        } else {
            "MISSING"
        };
        println!("  {:14} {program:12} {status}", scanset.label);
    }
    println!();
    println!("Missing tools can be installed from:");
    println!("  - giftext, giffix, gifasm, gifinter: giflib tools");
    println!("  - giftopnm, jpegtopnm, pngtopnm, bmptopnm, tifftopnm: netpbm package");
    println!("  - pdftops, pdfinfo: poppler-utils package");
    println!("  - gs: ghostscript package");
    println!("  - gocr, ocrad: OCR engine packages");
}

fn hashdb_command(settings: &Settings, command: HashdbCommands) -> anyhow::Result<()> {
    let Some(mut store) = hashdb::open_store(settings)? else {
        anyhow::bail!("hashing is disabled in the configuration");
    };

    match command {
        HashdbCommands::List { partition } => {
            let partition = Partition::from(partition);
            let records = store.list(partition)?;
            if records.is_empty() {
                println!("no {} records", partition.as_str());
                return Ok(());
            }
            for record in records {
                println!(
                    "  {}  {:6.3}  {:30} {}",
                    &record.digest[..16.min(record.digest.len())],
                    record.score,
                    record.meta.filename,
                    record.created
                );
            }
        }
        HashdbCommands::Forget { digest, partition } => {
            let partition = Partition::from(partition);
            let removed = store.remove(&digest, partition)?;
            if removed == 0 {
                println!("digest not found in {}", partition.as_str());
            } else {
                println!("removed {removed} record(s)");
            }
        }
    }
    Ok(())
}

fn scansets_command(settings: &Settings) {
    let registry = ScansetRegistry::from_config(
        &settings.scansets,
        settings.scan.autosort_buffer,
        Some(settings.scanset_state_path()),
    );
    println!("Scansets in iteration order:");
    for set in registry.ordered() {
        println!("  {:14} hits={:<3} {}", set.label, set.hits, set.command);
    }
}
