extern crate depwalk;

use anyhow::Context;
use clap::Parser;
use depwalk::common::path_to_string;
use depwalk::query::LookupQuery;
use depwalk::system::WindowsSystem;
use depwalk::view::{show, Format, Output, ViewOptions};
use depwalk::LookupPath;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Recursive import dependency walker for PE executables
#[derive(Parser, Debug)]
#[command(name = "depwalk", version, author)]
struct Args {
    /// Target file (.exe or .dll)
    image: PathBuf,

    /// Also list the functions imported from each library
    #[arg(short = 'f', long)]
    functions: bool,

    /// Also follow delay-load imports
    #[arg(short = 'd', long)]
    delayed: bool,

    /// Output format: ascii, json, dot or csv
    #[arg(short = 'F', long, default_value = "ascii")]
    format: String,

    /// Indentation width of the output
    #[arg(short = 'I', long, default_value_t = 2)]
    indent: usize,

    /// Write the output to this file instead of stdout
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Maximum recursion depth (default: unlimited)
    #[arg(long)]
    max_depth: Option<usize>,

    /// Windows partition to use for system DLLs lookup (if not specified, the partition where
    /// IMAGE lies will be tested and used if valid)
    #[arg(short = 'w', long)]
    windows_root: Option<PathBuf>,

    /// Working directory to be considered in the DLL lookup path (default: directory of IMAGE)
    #[arg(short = 'k', long)]
    workdir: Option<PathBuf>,

    /// Additional directories to search, separated by ';'
    #[arg(short = 'a', long)]
    userpath: Option<String>,

    /// Undecorate MSVC C++ function names
    #[arg(long)]
    demangle: bool,

    /// Log what the walk is doing on stderr
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("depwalk=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn build_query(args: &Args) -> anyhow::Result<LookupQuery> {
    let mut query = LookupQuery::deduce_from_executable_location(&args.image)?;
    query.parameters.delayed = args.delayed;
    query.parameters.max_depth = args.max_depth;

    // overrides
    if let Some(root) = &args.windows_root {
        query.system = WindowsSystem::from_root(root);
        if query.system.is_none() {
            warn!(
                "{} does not contain a Windows installation; system DLL imports will not be resolved",
                path_to_string(root)
            );
        }
    } else if let Some(system) = &query.system {
        info!(
            "Windows partition root not specified, assumed {}",
            path_to_string(&system.win_dir)
        );
    } else {
        info!("Windows partition root not specified, and executable doesn't lie in one; system DLL imports will not be resolved");
    }

    if let Some(workdir) = &args.workdir {
        query.target.working_dir = workdir.clone();
    }
    if let Some(userpath) = &args.userpath {
        for entry in userpath.split(';').filter(|s| !s.is_empty()) {
            let p = PathBuf::from(entry);
            if p.is_dir() {
                query.target.user_path.push(p);
            } else {
                warn!("Skipping non-existing path entry {}", entry);
            }
        }
    }
    Ok(query)
}

fn run(args: Args) -> anyhow::Result<()> {
    let format: Format = args.format.parse()?;
    if args.image.is_dir() {
        anyhow::bail!(
            "The specified path is a directory, not a PE executable file: {}",
            path_to_string(&args.image)
        );
    }

    let query = build_query(&args)?;
    let search_path: Vec<String> = LookupPath::deduce(&query)
        .search_path()
        .iter()
        .map(path_to_string)
        .collect();
    debug!("search path: {}", search_path.join(", "));

    let graph = depwalk::walk(&query)?;
    let root = graph
        .root()
        .context("the dependency graph is empty")?;

    let output = Output::new(args.output.clone());
    let mut out = output
        .open()
        .with_context(|| format!("couldn't open output {:?}", output))?;
    show(
        &graph,
        root,
        &mut out,
        &ViewOptions {
            format,
            functions: args.functions,
            indent: args.indent,
            demangle: args.demangle,
        },
    )?;
    Ok(())
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(e) = run(args) {
        eprintln!("[-] {:#}", e);
        std::process::exit(1);
    }
}
