use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};

use loadcal::calib::{registry, BinarySearch, CalibrationPoint, CalibrationTest, Ramp};
use loadcal::config::{Config, General};
use loadcal::remote::RemoteHost;

#[derive(Parser)]
#[command(
    name = "loadcal",
    about = "Adaptive load calibration for remote traffic engines",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the available calibration tests
    List,

    /// Run calibration tests against the configured tester and SUT
    Run {
        /// Configuration file
        #[arg(long, default_value = "loadcal.toml")]
        config: PathBuf,

        /// Run a single test instead of the configured list
        #[arg(long)]
        test: Option<String>,

        /// Search strategy
        #[arg(long, value_enum, default_value_t = Strategy::Bisect)]
        strategy: Strategy,

        /// Write the calibration points as JSON to this file
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Show hardware details of one configured host
    HostInfo {
        /// Configuration file
        #[arg(long, default_value = "loadcal.toml")]
        config: PathBuf,

        /// Which host to inspect
        #[arg(long, value_enum, default_value_t = Host::Tester)]
        host: Host,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Strategy {
    /// Bisect towards the highest sustainable load
    Bisect,
    /// Probe a fixed ladder of load values
    Ramp,
}

#[derive(Clone, Copy, ValueEnum)]
enum Host {
    Tester,
    Sut,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::List => {
            println!("{:<15} | Description", "Test");
            println!("{:-<15}-|-{:-<50}", "", "");
            for entry in registry::catalog() {
                println!("{:<15} | {}", entry.name, entry.description);
            }
        }
        Commands::Run {
            config,
            test,
            strategy,
            output,
        } => {
            let cfg = Config::load(&config)?;
            let names: Vec<String> = match test {
                Some(name) => vec![name],
                None => cfg.general.tests.clone(),
            };
            for name in names {
                run_test(&name, &cfg, strategy, output.as_deref()).await?;
            }
        }
        Commands::HostInfo { config, host } => {
            let cfg = Config::load(&config)?;
            let (name, endpoint) = match host {
                Host::Tester => ("tester", &cfg.tester),
                Host::Sut => ("sut", &cfg.sut),
            };
            let remote = RemoteHost::from_config(name, endpoint);

            let cores = remote.core_count().await?;
            let topology = remote.cpu_topology().await?;
            let hugepages = remote.hugepage_counts().await?;

            println!("Host {} ({})", name, endpoint.ip);
            println!("  logical cpus : {}", cores);
            for (socket, core_map) in &topology {
                println!("  socket {:<6} : {} cores", socket, core_map.len());
            }
            println!("  hugepages    : {} x 2MB, {} x 1GB", hugepages.two_mb, hugepages.one_gb);
        }
    }

    Ok(())
}

async fn run_test(
    name: &str,
    cfg: &Config,
    strategy: Strategy,
    output: Option<&std::path::Path>,
) -> Result<()> {
    let Some(entry) = registry::find(name) else {
        let known: Vec<&str> = registry::catalog().iter().map(|e| e.name).collect();
        bail!("unknown test {:?}, available: {}", name, known.join(", "));
    };

    tracing::info!(test = entry.name, "starting calibration run");
    let mut test: Box<dyn CalibrationTest> = (entry.build)(cfg);
    test.setup().await?;

    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for interrupts");
            std::future::pending::<()>().await;
        }
    };
    let (points, run_result) =
        run_strategy(test.as_mut(), strategy, &cfg.general, interrupt).await;

    // Tear down and report whatever completed even when the run aborted.
    if let Err(e) = test.teardown().await {
        tracing::warn!(error = %e, "teardown failed");
    }
    report(test.as_ref(), &points, output)?;

    run_result
}

/// Run one strategy to completion or until `interrupt` fires, whichever comes
/// first. The points completed so far are handed back either way, so an
/// interrupted run still gets reported.
async fn run_strategy(
    test: &mut dyn CalibrationTest,
    strategy: Strategy,
    general: &General,
    interrupt: impl std::future::Future<Output = ()>,
) -> (Vec<CalibrationPoint>, Result<()>) {
    match strategy {
        Strategy::Bisect => {
            let mut search = BinarySearch::new();
            let result = tokio::select! {
                r = search.run(test, general) => r,
                _ = interrupt => {
                    tracing::warn!("interrupted, reporting completed points");
                    Ok(())
                }
            };
            (search.into_points(), result)
        }
        Strategy::Ramp => {
            let mut ramp = Ramp::new();
            let result = tokio::select! {
                r = ramp.run(test, general) => r,
                _ = interrupt => {
                    tracing::warn!("interrupted, reporting completed points");
                    Ok(())
                }
            };
            (ramp.into_points(), result)
        }
    }
}

fn report(
    test: &dyn CalibrationTest,
    points: &[CalibrationPoint],
    output: Option<&std::path::Path>,
) -> Result<()> {
    println!("\n=== {} ===", test.name());
    println!(
        "{:<9} | {:>7} | {:>9} | {:>7} | Result",
        "Pkt size", "Value", "Mpps", "Loss %"
    );
    println!("{:-<9}-|-{:-<7}-|-{:-<9}-|-{:-<7}-|-{:-<6}", "", "", "", "", "");
    for p in points {
        println!(
            "{:<9} | {:>7.2} | {:>9.2} | {:>7.3} | {}",
            p.pkt_size,
            p.value,
            p.throughput_mpps,
            p.loss_pct,
            if p.success { "pass" } else { "FAIL" }
        );
    }
    println!("KPI: {}\n", test.kpi());

    if let Some(path) = output {
        let json = serde_json::to_string_pretty(points)?;
        std::fs::write(path, json)?;
        tracing::info!(path = %path.display(), "wrote calibration points");
    }
    Ok(())
}
