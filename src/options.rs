//! Parsing Options.
//! `--detector-kind {kind}` or `-k`, `doublelock` (default) or `manual-drop`.
//! `--flavors [mutex,rwlock,lockapi]` or `-f`, lock flavors to analyze, all if not specified.
//! `--suppress [fn1,fn2]` or `-s`, extra function symbol prefixes to skip.
//! `--no-default-suppress`, do not skip the built-in list of functions.
//! `--output-format {text,json}` or `-o`.
//! `--ir {path}`, the JSON module to analyze.
//! `--callgraph-dot {path}`, also write the call graph in dot format.
use std::error::Error;
use std::path::PathBuf;

use clap::{Arg, Command};

use crate::config::{DetectorConfig, LockFlavors};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectorKind {
    DoubleLock,
    ManualDrop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

fn make_options_parser<'help>() -> Command<'help> {
    let parser = Command::new("DOUBLELOCK")
        .no_binary_name(true)
        .version("v0.1.0")
        .arg(
            Arg::new("kind")
                .short('k')
                .long("detector-kind")
                .possible_values(["doublelock", "manual-drop"])
                .default_values(&["doublelock"])
                .help("The detector kind"),
        )
        .arg(
            Arg::new("flavors")
                .short('f')
                .long("flavors")
                .takes_value(true)
                .help("The lock flavors seperated by ,: mutex, rwlock, lockapi"),
        )
        .arg(
            Arg::new("suppress")
                .short('s')
                .long("suppress")
                .takes_value(true)
                .help("Symbol prefixes of functions to skip, seperated by ,"),
        )
        .arg(
            Arg::new("no-default-suppress")
                .long("no-default-suppress")
                .takes_value(false)
                .help("Do not skip the built-in list of functions"),
        )
        .arg(
            Arg::new("format")
                .short('o')
                .long("output-format")
                .possible_values(["text", "json"])
                .default_values(&["text"])
                .help("How reports are printed"),
        )
        .arg(
            Arg::new("ir")
                .long("ir")
                .takes_value(true)
                .required(true)
                .help("The JSON module to analyze"),
        )
        .arg(
            Arg::new("callgraph-dot")
                .long("callgraph-dot")
                .takes_value(true)
                .help("Write the call graph in dot format to this file"),
        );
    parser
}

#[derive(Debug)]
pub struct Options {
    pub detector_kind: DetectorKind,
    pub output_format: OutputFormat,
    pub ir: PathBuf,
    pub callgraph_dot: Option<PathBuf>,
    pub config: DetectorConfig,
}

impl Options {
    pub fn parse_from_str(s: &str) -> Result<Self, Box<dyn Error>> {
        let flags = shellwords::split(s)?;
        Self::parse_from_args(&flags)
    }

    pub fn parse_from_args(flags: &[String]) -> Result<Self, Box<dyn Error>> {
        let app = make_options_parser();
        let matches = app.try_get_matches_from(flags.iter())?;
        let detector_kind = match matches.value_of("kind") {
            Some("doublelock") => DetectorKind::DoubleLock,
            Some("manual-drop") => DetectorKind::ManualDrop,
            _ => return Err("UnsupportedDetectorKind")?,
        };
        let output_format = match matches.value_of("format") {
            Some("text") => OutputFormat::Text,
            Some("json") => OutputFormat::Json,
            _ => return Err("UnsupportedOutputFormat")?,
        };
        let ir = matches
            .value_of("ir")
            .map(PathBuf::from)
            .ok_or("MissingIrPath")?;
        let callgraph_dot = matches.value_of("callgraph-dot").map(PathBuf::from);
        let mut config = DetectorConfig::default();
        if let Some(flavors) = matches.value_of("flavors") {
            config.flavors = LockFlavors::parse(flavors)?;
        }
        if matches.is_present("no-default-suppress") {
            config.suppressed.clear();
        }
        if let Some(suppress) = matches.value_of("suppress") {
            config.suppressed.extend(
                suppress
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_owned()),
            );
        }
        Ok(Options {
            detector_kind,
            output_format,
            ir,
            callgraph_dot,
            config,
        })
    }
}
