mod audit;
mod checkpoint;
mod config;
mod driver;
mod error;
mod extract;
mod fetcher;
mod input;

use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};

use checkpoint::CheckpointStore;
use config::Settings;
use driver::{BatchDriver, Pacer};
use extract::report::{self, ReportExtractor};
use extract::{Address, Extractor};

#[derive(Parser)]
#[command(name = "addr_scraper", about = "Resolve factory addresses from search-engine result pages")]
struct Cli {
    /// Settings file (default: ./addr_scraper.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Look up every unresolved entity in the input CSV
    Run {
        /// CSV file with an entity-name column
        #[arg(short, long)]
        input: PathBuf,
        /// Search engine profile (default from settings)
        #[arg(short, long)]
        engine: Option<String>,
        /// Max entities to look up this run
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// Checkpoint CSV (default from settings)
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },
    /// Run the live extractor over a saved result page
    Extract {
        #[arg(short, long)]
        file: PathBuf,
        #[arg(short, long)]
        engine: Option<String>,
    },
    /// Write the review report for the latest audited lookups
    Review {
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Re-resolve addresses from a (possibly edited) review report
    Reextract {
        #[arg(short, long)]
        report: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Count found / not found / error rows in a checkpoint
    Stats {
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    let result = match cli.command {
        Commands::Run {
            input,
            engine,
            limit,
            checkpoint,
        } => {
            let (engine_name, profile) = settings.engine(engine.as_deref())?;
            let extractor = Extractor::new(&settings.extract, profile.strategy)?;
            let entities = input::load_entities(&input, &settings.input.column)?;
            if entities.is_empty() {
                println!("No entities in {}.", input.display());
                return Ok(());
            }

            let store = CheckpointStore::new(checkpoint.unwrap_or_else(|| settings.checkpoint.path.clone()));
            println!(
                "Looking up {} entities via {} ({} rules) -> {}",
                entities.len(),
                engine_name,
                extractor.rule_tags().join(", "),
                store.path().display()
            );

            let conn = if settings.audit.enabled {
                let conn = audit::connect(&settings.audit.path)?;
                audit::init_schema(&conn)?;
                Some(conn)
            } else {
                None
            };

            let mut driver = BatchDriver::new(&extractor, fetcher::QueryBuilder::new(profile), store)
                .pacer(Pacer::new(&settings.pacing))
                .flush_every(settings.checkpoint.flush_every)
                .limit(limit);
            if let Some(conn) = &conn {
                let strategy = format!("{:?}", extractor.strategy()).to_lowercase();
                let run_id = audit::start_run(conn, engine_name, &strategy)?;
                driver = driver.audit(audit::RunLog::new(conn, run_id));
            }

            let mut fetcher = fetcher::connect(&settings.fetcher)?;
            let s = driver.run(fetcher.as_mut(), &entities).await?;
            println!(
                "{}: {} attempted ({} found, {} not found, {} errors), {} already resolved.",
                if s.halted { "Halted on fetch error" } else { "Done" },
                s.attempted,
                s.found,
                s.not_found,
                s.errors,
                s.skipped
            );
            Ok(())
        }
        Commands::Extract { file, engine } => {
            let (_, profile) = settings.engine(engine.as_deref())?;
            let extractor = Extractor::new(&settings.extract, profile.strategy)?;
            let html = fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let extraction = extractor.extract(&html);
            println!("Address: {}", extraction.address());
            for (i, c) in extraction.candidates.iter().enumerate() {
                println!("{:>3}. [tier {}] {:<20} {}", i + 1, c.tier, c.source, c.text);
            }
            Ok(())
        }
        Commands::Review { output } => {
            let conn = audit::connect(&settings.audit.path)?;
            audit::init_schema(&conn)?;
            let entries = audit::latest_entries(&conn)?;
            if entries.is_empty() {
                println!("No audited lookups. Run 'run' with audit enabled first.");
                return Ok(());
            }
            fs::write(&output, report::render(&settings.report.title, &entries))
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!("Wrote {} entries to {}", entries.len(), output.display());
            Ok(())
        }
        Commands::Reextract { report: path, output } => reextract(&settings, &path, &output),
        Commands::Stats { checkpoint } => {
            let store = CheckpointStore::new(checkpoint.unwrap_or_else(|| settings.checkpoint.path.clone()));
            let ledger = store.load()?;
            if ledger.is_empty() {
                println!("No rows in {}.", store.path().display());
                return Ok(());
            }
            let (mut found, mut not_found, mut errors) = (0, 0, 0);
            for r in ledger.records() {
                match r.address {
                    Address::Found(_) => found += 1,
                    Address::NotFound => not_found += 1,
                    Address::Error => errors += 1,
                }
            }
            println!("Checkpoint: {}", store.path().display());
            println!("Total:     {}", ledger.len());
            println!("Found:     {}", found);
            println!("Not found: {}", not_found);
            println!("Errors:    {}", errors);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn reextract(settings: &Settings, path: &std::path::Path, output: &std::path::Path) -> anyhow::Result<()> {
    use rayon::prelude::*;

    let text = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let sections = report::split_sections(&text);
    if sections.is_empty() {
        println!("No company sections in {}.", path.display());
        return Ok(());
    }
    let extractor = ReportExtractor::new(&settings.report, &settings.extract)?;

    let addresses: Vec<Address> = sections
        .par_iter()
        .map(|s| extractor.extract(s, &text).address())
        .collect();

    let mut writer = csv::Writer::from_path(output)
        .with_context(|| format!("Failed to create {}", output.display()))?;
    writer.write_record(checkpoint::HEADER)?;
    let mut found = 0;
    for (section, address) in sections.iter().zip(&addresses) {
        if matches!(address, Address::Found(_)) {
            found += 1;
        }
        writer.write_record([section.entity.as_str(), address.as_str()])?;
    }
    writer.flush()?;

    println!(
        "Resolved {}/{} sections -> {}",
        found,
        sections.len(),
        output.display()
    );
    Ok(())
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
