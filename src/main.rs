use anyhow::{bail, Context, Result};
use ptrgraph::catalogue::SystemDescriptor;
use ptrgraph::config::RuntimeConfig;
use ptrgraph::interface::{EventSink, FindingSink, ScanStage, StageStatus};
use ptrgraph::types::{Address, Finding, PointerValue};
use ptrgraph::Orchestrator;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

struct Args {
    system_path: PathBuf,
    batch_paths: Vec<PathBuf>,
    targets_path: Option<PathBuf>,
}

fn usage() -> ! {
    eprintln!(
        "usage: ptrgraph-cli <system.json> <batch1.csv> [batch2.csv ...] [--targets targets.csv]"
    );
    std::process::exit(1);
}

fn parse_args() -> Args {
    let mut rest: Vec<String> = env::args().skip(1).collect();
    if rest.len() < 2 {
        usage();
    }

    let mut targets_path = None;
    if let Some(idx) = rest.iter().position(|a| a == "--targets") {
        rest.remove(idx);
        if idx >= rest.len() {
            usage();
        }
        targets_path = Some(PathBuf::from(rest.remove(idx)));
    }

    let system_path = PathBuf::from(rest.remove(0));
    if rest.is_empty() {
        usage();
    }
    let batch_paths = rest.into_iter().map(PathBuf::from).collect();

    Args {
        system_path,
        batch_paths,
        targets_path,
    }
}

/// A minimal stand-in for the external CSV parser (§6/§7): two
/// comma-separated hex or decimal columns per line, `#`-prefixed comments
/// and blank lines skipped. The core trusts whatever this produces.
fn read_address_value_csv(path: &Path) -> Result<(Vec<Address>, Vec<PointerValue>)> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut addresses = Vec::new();
    let mut values = Vec::new();

    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((a, v)) = line.split_once(',') else {
            bail!("{}:{}: expected `address,value`", path.display(), lineno + 1);
        };
        addresses.push(parse_number(a.trim())?);
        values.push(parse_number(v.trim())?);
    }

    Ok((addresses, values))
}

fn parse_number(s: &str) -> Result<u32> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).with_context(|| format!("invalid hex literal {s:?}"))
    } else {
        s.parse::<u32>().with_context(|| format!("invalid integer {s:?}"))
    }
}

fn read_targets_csv(path: &Path) -> Result<Vec<Address>> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(parse_number)
        .collect()
}

/// Prints each streamed batch of findings as one JSON-ish line, standing in
/// for the opaque achievement-logic encoder (§6/§7).
struct StdoutSink {
    total: usize,
}

impl FindingSink for StdoutSink {
    fn accept(&mut self, findings: &[Finding]) -> ptrgraph::Result<()> {
        for f in findings {
            self.total += 1;
            println!(
                "finding id={} kind={:?} root=0x{:08X} nodes={}",
                f.id, f.kind, f.root, f.node_count
            );
        }
        Ok(())
    }
}

/// Forwards stage transitions to `log` and renders the host-facing progress
/// percentage, the split described in SPEC_FULL §B.
struct CliEventSink;

impl EventSink for CliEventSink {
    fn progress(&mut self, percent: u8, status: &str) {
        log::debug!("progress {percent}% ({status})");
    }

    fn stage_transition(&mut self, stage: ScanStage, status: StageStatus) {
        log::info!("stage {stage:?} -> {status:?}");
    }

    fn finding_counts(&mut self, static_count: usize, dynamic_count: usize) {
        log::info!("findings so far: {static_count} static lists, {dynamic_count} dynamic lists");
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let args = parse_args();

    let system_json = fs::read_to_string(&args.system_path)
        .with_context(|| format!("read {}", args.system_path.display()))?;
    let system: SystemDescriptor =
        serde_json::from_str(&system_json).context("parse system descriptor JSON")?;

    let mut cfg = RuntimeConfig::default();
    cfg.show_progress_bar = true;

    let mut orchestrator = Orchestrator::new(system, cfg);

    for path in &args.batch_paths {
        let (addrs, values) = read_address_value_csv(path)?;
        log::info!("loaded batch {} ({} rows)", path.display(), addrs.len());
        orchestrator.add_batch(&addrs, &values)?;
    }

    if let Some(targets_path) = &args.targets_path {
        let targets = read_targets_csv(targets_path)?;
        log::info!("injecting {} target(s) from {}", targets.len(), targets_path.display());
        orchestrator.inject_targets(args.batch_paths.len(), &targets);
    }

    let mut sink = StdoutSink { total: 0 };
    let mut events = CliEventSink;
    let report = orchestrator.run(&mut sink, &mut events)?;

    eprintln!(
        "done: {} static lists, {} dynamic lists, {} entry points, {} target paths, {} base pointers scanned (cancelled={})",
        report.static_lists,
        report.dynamic_lists,
        report.entry_points,
        report.target_paths,
        report.base_pointers_scanned,
        report.cancelled
    );
    eprintln!("{} findings streamed", sink.total);

    Ok(())
}
