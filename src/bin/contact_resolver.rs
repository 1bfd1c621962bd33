//! contact-resolver CLI
//!
//! Resolves a JSONL file of contact records against a JSON snapshot of known
//! entities and prints one decision per line. Optionally runs a dedup scan
//! over the resulting entity set.
//!
//! A record with no usable signal at all prints as `rejected` rather than
//! `new_entity`; its `signal_issues` say why.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use contact_resolver::storage::InMemoryStores;
use contact_resolver::{
    CandidateEntity, EntityStore, IncomingRecord, Lane, MatchTier, ResolutionConfig, ResolutionRuntime,
    ResolutionRuntimeConfig, Resolver, SourceSystem,
};

/// CLI configuration
#[derive(Default)]
struct Config {
    /// JSON array of existing entities
    entities: Option<PathBuf>,
    /// JSONL of incoming records
    records: Option<PathBuf>,
    /// TOML or JSON resolution config
    config: Option<PathBuf>,
    /// Run a dedup scan after resolving
    scan: bool,
    /// Restrict the scan to one tier
    tier: Option<MatchTier>,
    /// Report scan results without writing candidates
    dry_run: bool,
}

fn usage() {
    println!("contact-resolver - contact identity resolution");
    println!();
    println!("USAGE:");
    println!("    contact-resolver [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -e, --entities <FILE>     JSON array of known entities");
    println!("    -r, --records <FILE>      JSONL of incoming records");
    println!("    -c, --config <FILE>       Resolution config (.toml or .json)");
    println!("        --scan                Run a dedup scan after resolving");
    println!("        --tier <N>            Only scan tier N (1-5)");
    println!("        --dry-run             Report the scan without writing candidates");
    println!("    -h, --help                Print help information");
    println!();
    println!("Records whose signals are all missing or malformed are reported as");
    println!("\"rejected\" and create no entity.");
}

fn value_of(args: &[String], i: usize, flag: &str) -> String {
    if let Some(value) = args.get(i + 1) {
        value.clone()
    } else {
        eprintln!("error: {flag} requires a value");
        std::process::exit(1);
    }
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--entities" | "-e" => {
                config.entities = Some(PathBuf::from(value_of(&args, i, "--entities")));
                i += 2;
            }
            "--records" | "-r" => {
                config.records = Some(PathBuf::from(value_of(&args, i, "--records")));
                i += 2;
            }
            "--config" | "-c" => {
                config.config = Some(PathBuf::from(value_of(&args, i, "--config")));
                i += 2;
            }
            "--tier" => {
                let raw = value_of(&args, i, "--tier");
                let tier = raw.parse::<u8>().ok().and_then(|n| MatchTier::try_from(n).ok());
                let Some(tier) = tier else {
                    eprintln!("error: invalid tier: {raw}");
                    std::process::exit(1);
                };
                config.tier = Some(tier);
                config.scan = true;
                i += 2;
            }
            "--scan" => {
                config.scan = true;
                i += 1;
            }
            "--dry-run" => {
                config.dry_run = true;
                i += 1;
            }
            "--help" | "-h" => {
                usage();
                std::process::exit(0);
            }
            arg => {
                eprintln!("error: unknown argument: {arg}");
                std::process::exit(1);
            }
        }
    }

    config
}

/// One input line. Ids and timestamps are assigned on ingest.
#[derive(Debug, Deserialize)]
struct RecordLine {
    source_system: SourceSystem,
    #[serde(default)]
    source_record_id: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    phone: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    address: Option<String>,
}

impl From<RecordLine> for IncomingRecord {
    fn from(line: RecordLine) -> Self {
        let mut builder = IncomingRecord::builder(line.source_system);
        if let Some(id) = line.source_record_id {
            builder = builder.source_record_id(id);
        }
        if let Some(email) = line.email {
            builder = builder.email(email);
        }
        if let Some(phone) = line.phone {
            builder = builder.phone(phone);
        }
        if let Some(name) = line.name {
            builder = builder.name(name);
        }
        if let Some(address) = line.address {
            builder = builder.address(address);
        }
        builder.build()
    }
}

fn read_records(path: &PathBuf) -> Result<Vec<IncomingRecord>, Box<dyn std::error::Error>> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed: RecordLine =
            serde_json::from_str(&line).map_err(|e| format!("{}:{}: {e}", path.display(), n + 1))?;
        records.push(parsed.into());
    }
    Ok(records)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(io::stderr)
        .init();

    let args = parse_args();
    let resolution_config = match &args.config {
        Some(path) => ResolutionConfig::load(path)?,
        None => ResolutionConfig::default(),
    };

    let stores = InMemoryStores::new();
    if let Some(path) = &args.entities {
        let entities: Vec<CandidateEntity> = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        let count = entities.len();
        for entity in entities {
            stores.entities.insert(entity)?;
        }
        tracing::info!(count, path = %path.display(), "loaded entities");
    }

    let resolver = Resolver::in_memory(resolution_config, &stores)?;
    let runtime_config = ResolutionRuntimeConfig::default();
    let runtime = ResolutionRuntime::start(resolver, &runtime_config)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();

    if let Some(path) = &args.records {
        let records = read_records(path)?;
        tracing::info!(count = records.len(), "resolving records");
        for chunk in records.chunks(runtime_config.queue_capacity) {
            let handles: Vec<_> = chunk
                .iter()
                .map(|r| runtime.submit(r.clone(), Lane::Sweep))
                .collect::<Result<_, _>>()?;
            for handle in handles {
                match handle.join() {
                    Ok(decision) => writeln!(out, "{}", serde_json::to_string(&decision)?)?,
                    Err(e) => tracing::error!(error = %e, "record failed"),
                }
            }
        }
    }

    if args.scan {
        let report = runtime
            .submit_scan(args.tier, args.dry_run)?
            .join_timeout(Duration::from_secs(600))?;
        writeln!(out, "{}", serde_json::to_string(&report)?)?;
    }

    out.flush()?;
    Ok(())
}
