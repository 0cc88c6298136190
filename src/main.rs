use anyhow::Context;
use colored::Colorize;
use fsbench::{
    campaign::{self, Campaign},
    clap_args::{self, Commands},
    config::Config,
    report,
};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = clap_args::parse();

    let default_level = if args.verbose { "fsbench=debug" } else { "fsbench=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match args.command {
        Commands::Init => init(),

        Commands::Run {
            config,
            filesystems,
            workloads,
        } => run(Path::new(&config), &filesystems, &workloads).await,

        Commands::Aggregate { config } => aggregate(Path::new(&config)),
    }
}

fn init() -> anyhow::Result<()> {
    match Config::write_example_to_file(Path::new("./fsbench.toml")) {
        Ok(_) => {
            println!("{}", "fsbench.toml created!".green());
            println!(
                "{}",
                "Edit the device and mountpoint before running a campaign — the device gets wiped."
                    .yellow()
            );
            Ok(())
        }
        Err(e) => {
            println!("{}\n{}", "Error creating config.".red(), e);
            Err(e)
        }
    }
}

async fn run(
    config_path: &Path,
    filesystem_names: &[String],
    workload_names: &[String],
) -> anyhow::Result<()> {
    let config = Config::try_from_path(config_path)?;
    let filesystems = config.filter_filesystems(filesystem_names)?;
    let workloads = config.filter_workloads(workload_names)?;

    // Ctrl-C propagates as a cancellation: running monitors and containers
    // are stopped and the device cleaned through the normal release paths
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("\n{}", "Abort requested, cleaning up...".yellow());
                cancel.cancel();
            }
        });
    }

    let campaign = Campaign::new(&config, filesystems, workloads, cancel);
    let outcome = campaign.run().await?;

    // the report is derived purely from the artifacts on disk
    let output_dir = config.output_dir();
    let meta = report::CampaignMeta::from_outcome(&outcome, &config);
    meta.write(&output_dir)?;

    let aggregated = report::aggregate(&config, &outcome.plan, &meta);
    let report_path = aggregated.write(&output_dir)?;
    report::snapshot_config(config_path, &output_dir)?;

    println!("\n{}", " Summary ".reversed().green());
    println!("{}", report::render_summary(&aggregated));
    println!("Report written to {}", report_path.display());

    for failure in outcome.failed_phases.iter() {
        println!(
            "{} {}",
            format!("phase {} aborted:", failure.filesystem).red(),
            failure.error
        );
    }
    if let Some(fatal) = &outcome.fatal {
        println!("{} {}", "campaign aborted:".red(), fatal);
    }

    if !outcome.fully_successful() {
        std::process::exit(1);
    }
    Ok(())
}

fn aggregate(config_path: &Path) -> anyhow::Result<()> {
    let config = Config::try_from_path(config_path)?;
    let filesystems = config.filter_filesystems(&[])?;
    let workloads = config.filter_workloads(&[])?;

    let output_dir = config.output_dir();
    if !output_dir.exists() {
        anyhow::bail!(
            "Output directory {} does not exist, nothing to aggregate",
            output_dir.display()
        );
    }

    let plan = campaign::build_plan(&output_dir, &filesystems, &workloads);
    let meta = report::CampaignMeta::load_or_default(&output_dir, &config);
    let aggregated = report::aggregate(&config, &plan, &meta);
    let report_path = aggregated
        .write(&output_dir)
        .context("Failed to write aggregated report")?;

    println!("{}", report::render_summary(&aggregated));
    println!("Report written to {}", report_path.display());
    Ok(())
}
