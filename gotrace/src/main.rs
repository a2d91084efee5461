use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use gotrace::{
    config::{AggregationMode, InterpretOptions, ResolveOptions, DEFAULT_MAX_STACK_DEPTH},
    events::{open_events, EventFormat},
    interpret::interpret,
    probes::{self, ProbeSites},
};
use log::{info, warn};
use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

#[derive(Parser, Debug)]
#[command(name = "gotrace")]
#[command(about = "Uprobe-based function tracer for Go binaries")]
struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve entry, return and stack-growth probe sites of a Go binary
    Probes {
        /// Go executable to inspect
        binary: PathBuf,

        /// Symbol prefix of the packages to trace (repeatable)
        #[arg(short, long = "prefix", default_value = "main.")]
        prefixes: Vec<String>,

        /// Write the probe-site manifest here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Rebuild call stacks from a recorded event file and aggregate timings
    Interpret(InterpretArgs),
}

#[derive(Args, Debug)]
struct InterpretArgs {
    /// Go executable the events were recorded from
    #[arg(long, conflicts_with = "sites", required_unless_present = "sites")]
    binary: Option<PathBuf>,

    /// Probe-site manifest written by `gotrace probes`
    #[arg(long)]
    sites: Option<PathBuf>,

    /// Symbol prefix used when resolving from --binary (repeatable)
    #[arg(short, long = "prefix", default_value = "main.")]
    prefixes: Vec<String>,

    /// Recorded event file
    #[arg(short, long)]
    events: PathBuf,

    /// Encoding of the event file
    #[arg(long, value_enum, default_value = "text")]
    format: Format,

    /// Keep every call sample, not only sums and extremes
    #[arg(long)]
    detailed: bool,

    /// Maximum stack depth per goroutine before its stack is discarded
    #[arg(long, default_value_t = DEFAULT_MAX_STACK_DEPTH, conflicts_with = "unbounded")]
    max_depth: usize,

    /// Never discard deep goroutine stacks
    #[arg(long)]
    unbounded: bool,

    /// Write the profile here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Format {
    Text,
    Binary,
}

impl From<Format> for EventFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Text => EventFormat::Text,
            Format::Binary => EventFormat::Binary,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    match cli.command {
        Command::Probes {
            binary,
            prefixes,
            output,
        } => run_probes(&binary, prefixes, output.as_deref()),
        Command::Interpret(args) => run_interpret(args),
    }
}

/// Stdout or a freshly created file
fn open_output(path: Option<&Path>) -> Result<Box<dyn Write>> {
    Ok(match path {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    })
}

fn resolve_binary(binary: &Path, prefixes: Vec<String>) -> Result<ProbeSites> {
    let options = ResolveOptions::with_prefixes(prefixes);
    let sites = probes::resolve(binary, &options)
        .with_context(|| format!("Failed to resolve probe sites in {}", binary.display()))?;

    for site in sites.without_exits() {
        warn!("{} has no return instructions, its exits cannot be traced", site.name);
    }
    Ok(sites)
}

fn run_probes(binary: &Path, prefixes: Vec<String>, output: Option<&Path>) -> Result<()> {
    let sites = resolve_binary(binary, prefixes)?;

    let mut writer = open_output(output)?;
    sites
        .write_manifest(&mut writer)
        .context("Failed to write probe-site manifest")?;
    writeln!(writer)?;
    writer.flush()?;

    info!("Wrote {} probe sites", sites.len());
    Ok(())
}

fn run_interpret(args: InterpretArgs) -> Result<()> {
    let sites = match (&args.binary, &args.sites) {
        (Some(binary), _) => resolve_binary(binary, args.prefixes)?,
        (None, Some(manifest)) => {
            let file = File::open(manifest)
                .with_context(|| format!("Failed to open manifest {}", manifest.display()))?;
            ProbeSites::read_manifest(io::BufReader::new(file))
                .with_context(|| format!("Failed to load manifest {}", manifest.display()))?
        }
        (None, None) => anyhow::bail!("Either --binary or --sites must be specified"),
    };

    let options = InterpretOptions {
        mode: if args.detailed {
            AggregationMode::Detailed
        } else {
            AggregationMode::Flat
        },
        max_stack_depth: (!args.unbounded).then_some(args.max_depth),
    };

    let events = open_events(&args.events, args.format.into())
        .with_context(|| format!("Failed to open event file {}", args.events.display()))?;

    let names = sites.index_to_name();
    let mut profile = interpret(events, &names, &options);
    profile.flag_functions_without_exits(&sites);

    let diagnostics = &profile.diagnostics;
    if diagnostics.mismatched_frames + diagnostics.unmatched_exits + diagnostics.malformed_records > 0 {
        warn!(
            "Event stream was inconsistent: {} mismatched frames, {} unmatched exits, {} malformed records",
            diagnostics.mismatched_frames, diagnostics.unmatched_exits, diagnostics.malformed_records
        );
    }

    let mut writer = open_output(args.output.as_deref())?;
    profile.write_json(&mut writer).context("Failed to write profile")?;
    writeln!(writer)?;
    writer.flush()?;

    Ok(())
}
