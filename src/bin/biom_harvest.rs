use std::process::ExitCode;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use biom_harvester::config::ConfigLoader;
use biom_harvester::convert::SystemBiomTool;
use biom_harvester::domain::{BiomeClass, ClassSpec};
use biom_harvester::error::HarvestError;
use biom_harvester::harvest::{Harvester, HarvestSummary};
use biom_harvester::mgnify::{self, MgnifyClient, MgnifyHttpClient};
use biom_harvester::shutdown;
use biom_harvester::state;
use biom_harvester::store::OutputStore;

#[derive(Parser)]
#[command(name = "biom-harvest")]
#[command(about = "Bulk BIOM table harvester for the MGnify metagenomics catalog")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Download tables for the configured biome classes")]
    Harvest(HarvestArgs),
    #[command(about = "Show per-class progress from the local store, no network")]
    Status,
    #[command(about = "Resolve each configured lineage against the catalog")]
    Check,
}

#[derive(Args, Clone)]
struct HarvestArgs {
    class_specs: Vec<String>,

    #[arg(long)]
    out_dir: Option<String>,

    #[arg(long)]
    target: Option<usize>,

    #[arg(long)]
    time_limit_secs: Option<u64>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<HarvestError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &HarvestError) -> u8 {
    match error {
        HarvestError::MissingConfig
        | HarvestError::ConfigRead(_)
        | HarvestError::ConfigParse(_)
        | HarvestError::InvalidClassName(_)
        | HarvestError::InvalidLineage(_)
        | HarvestError::InvalidClassSpec(_) => 2,
        HarvestError::HttpClient(_)
        | HarvestError::ApiRequest { .. }
        | HarvestError::ApiStatus { .. }
        | HarvestError::DownloadFailed(_)
        | HarvestError::MissingTool(_)
        | HarvestError::Conversion(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Harvest(args)) => run_harvest(args, cli.config.as_deref()),
        Some(Commands::Status) => run_status(cli.config.as_deref()),
        Some(Commands::Check) => run_check(cli.config.as_deref()),
        None => run_harvest(
            HarvestArgs {
                class_specs: Vec::new(),
                out_dir: None,
                target: None,
                time_limit_secs: None,
            },
            cli.config.as_deref(),
        ),
    }
}

fn run_harvest(args: HarvestArgs, config: Option<&str>) -> miette::Result<()> {
    let mut resolved = ConfigLoader::resolve(config).into_diagnostic()?;
    if let Some(out_dir) = args.out_dir {
        resolved.out_dir = Utf8PathBuf::from(out_dir);
    }
    if let Some(limit) = args.time_limit_secs {
        resolved.limits.class_time_limit = (limit > 0).then(|| Duration::from_secs(limit));
    }

    let mut classes = if args.class_specs.is_empty() {
        std::mem::take(&mut resolved.classes)
    } else {
        args.class_specs
            .iter()
            .map(|raw| {
                raw.parse::<ClassSpec>().map(|spec| {
                    BiomeClass::new(spec.name, spec.lineage, resolved.target_per_class)
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .into_diagnostic()?
    };
    if let Some(target) = args.target {
        for class in &mut classes {
            class.target = target;
        }
    }
    if classes.is_empty() {
        return Err(miette::Report::msg(
            "no biome classes to harvest (configure `classes` or pass name=lineage specs)",
        ));
    }

    shutdown::install_handler();
    let out_dir = resolved.out_dir.clone();
    let store = OutputStore::new(resolved.out_dir);
    let client = MgnifyHttpClient::new(resolved.http).into_diagnostic()?;
    let tool = SystemBiomTool::new();
    let harvester = Harvester::new(store, client, tool, resolved.limits, resolved.base_url);

    let summary = harvester.run(&classes);
    print_summary(&summary, &out_dir);
    Ok(())
}

fn run_status(config: Option<&str>) -> miette::Result<()> {
    let resolved = ConfigLoader::resolve(config).into_diagnostic()?;
    if resolved.classes.is_empty() {
        return Err(miette::Report::msg("no biome classes configured"));
    }
    let store = OutputStore::new(resolved.out_dir);

    for class in &resolved.classes {
        let saved = store.saved_count(&class.name).into_diagnostic()?;
        let state = state::load_state(&store.class_dir(&class.name));
        println!(
            "{}: {saved}/{} tables, {} links seen, {} signatures",
            class.name,
            class.target,
            state.seen_links.len(),
            state.signature_to_name.len()
        );
    }
    Ok(())
}

fn run_check(config: Option<&str>) -> miette::Result<()> {
    let resolved = ConfigLoader::resolve(config).into_diagnostic()?;
    if resolved.classes.is_empty() {
        return Err(miette::Report::msg("no biome classes configured"));
    }
    let client = MgnifyHttpClient::new(resolved.http).into_diagnostic()?;

    let mut failures = 0usize;
    for class in &resolved.classes {
        let url = mgnify::biome_url(&resolved.base_url, &class.lineage);
        match client.fetch_page(&url, &[]) {
            Ok(page) => {
                let samples = page
                    .data
                    .first()
                    .and_then(|resource| resource.attributes.samples_count);
                match samples {
                    Some(samples) => {
                        println!("{}: ok, {samples} samples ({})", class.name, class.lineage)
                    }
                    None => println!("{}: ok ({})", class.name, class.lineage),
                }
            }
            Err(err) => {
                failures += 1;
                println!("{}: FAILED: {err}", class.name);
            }
        }
    }
    if failures > 0 {
        return Err(miette::Report::msg(format!(
            "{failures} lineage(s) did not resolve"
        )));
    }
    Ok(())
}

fn print_summary(summary: &HarvestSummary, out_dir: &Utf8PathBuf) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let reset = "\x1b[0m";

    println!("{cyan}harvest summary{reset}");
    for report in &summary.reports {
        let color = if report.hit_target { green } else { yellow };
        println!(
            "{color}  {}: {}/{} tables (+{} this run){reset}",
            report.class, report.saved, report.target, report.added
        );
    }
    if summary.interrupted {
        println!("{yellow}  interrupted before all classes finished{reset}");
    }
    println!("total: {} tables in {out_dir}", summary.total_saved());
}
