use anyhow::Context;
use clap::Parser;

use grid_dispatch_sim::executor::Executor;
use grid_dispatch_sim::files::FileRegistry;
use grid_dispatch_sim::{platform, Config, Registry};

#[derive(Debug, clap::Parser)]
#[command(long_about = None)]
struct Args {
    /// Path to the JSON run configuration
    #[arg(short = 'c', long = "config")]
    config: std::path::PathBuf,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();
    let cfg = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    log::info!("grid {} with policy {}", cfg.grid_name, cfg.policy_name());

    let sites = platform::load_sites(&cfg.sites_information, &cfg.sites)?;
    let connections =
        platform::load_connections(&cfg.sites_connection_information, &cfg.sites)?;
    anyhow::ensure!(!sites.is_empty(), "no sites left after filtering");

    let mut registry = FileRegistry::new();
    let grid = platform::build_grid(&cfg.grid_name, &sites, &connections, &mut registry)
        .context("building the platform")?;

    let dispatcher = Registry::with_builtins()
        .create(&cfg.policy_name(), &cfg)
        .context("creating the dispatch policy")?;

    let mut executor = Executor::new(grid, registry, dispatcher);
    let report = executor.run(cfg.num_of_jobs).context("simulation failed")?;

    report.write_csv(&cfg.output_db).with_context(|| {
        format!("writing the job report to {}", cfg.output_db.display())
    })?;
    report.log_summary();
    for (site, stats) in executor.stats().iter() {
        log::info!(
            "site {site}: {} finished, {} failed, {} still pending",
            stats.finished,
            stats.failed,
            stats.pending
        );
    }

    Ok(())
}
