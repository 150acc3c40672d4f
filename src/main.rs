//! `doublelock --ir module.json [options]`
//! Options may also be passed through the env var `DOUBLELOCK_FLAGS`;
//! they are parsed before the command-line arguments.
//! Logging is controlled by `DOUBLELOCK_LOG`, e.g. `DOUBLELOCK_LOG=debug`.
use std::env;
use std::error::Error;
use std::fs;
use std::process;

use log::{error, info, warn};

use doublelock::analysis::alias::BasicAliasAnalysis;
use doublelock::analysis::ir::load_module;
use doublelock::detector::drop::ManualDropAuditor;
use doublelock::detector::lock::DoubleLockDetector;
use doublelock::detector::report::Report;
use doublelock::options::{DetectorKind, Options, OutputFormat};

fn collect_flags() -> Result<Vec<String>, Box<dyn Error>> {
    let mut flags = match env::var("DOUBLELOCK_FLAGS") {
        Ok(flags) => shellwords::split(&flags)?,
        Err(_) => Vec::new(),
    };
    flags.extend(env::args().skip(1));
    Ok(flags)
}

fn print_reports(reports: &[Report], format: OutputFormat) -> Result<(), Box<dyn Error>> {
    match format {
        OutputFormat::Text => {
            for report in reports {
                print!("{}", report);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(reports)?);
        }
    }
    Ok(())
}

fn run() -> Result<(), Box<dyn Error>> {
    let flags = collect_flags()?;
    let options = Options::parse_from_args(&flags)?;
    info!("options: {:?}", options);
    let module = load_module(&options.ir)?;
    let reports = match options.detector_kind {
        DetectorKind::DoubleLock => {
            let alias_analysis = BasicAliasAnalysis;
            let mut detector = DoubleLockDetector::new(&module, &alias_analysis, &options.config);
            if let Some(path) = &options.callgraph_dot {
                fs::write(path, detector.callgraph().dot(&module))?;
                info!("callgraph written to {}", path.display());
            }
            let reports = detector.detect();
            info!(
                "functions: {}, lock sites: {}, reports: {}",
                module.num_functions(),
                detector.lock_sites(),
                reports.len()
            );
            reports
        }
        DetectorKind::ManualDrop => {
            let reports = ManualDropAuditor::new(&module).audit();
            info!(
                "functions: {}, reports: {}",
                module.num_functions(),
                reports.len()
            );
            reports
        }
    };
    if reports.is_empty() {
        warn!("no bug is found");
    }
    print_reports(&reports, options.output_format)
}

fn main() {
    env_logger::Builder::from_env("DOUBLELOCK_LOG").init();
    if let Err(e) = run() {
        error!("{}", e);
        eprintln!("{}", e);
        process::exit(1);
    }
}
