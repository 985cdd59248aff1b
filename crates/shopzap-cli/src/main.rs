use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shopzap_monitor::{Monitor, MonitorConfig};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "shopzap")]
#[command(about = "Shopzap product price and stock monitor")]
struct Cli {
    /// Debug-level logging for shopzap crates.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API and the task scheduler.
    Serve,
    /// Extract one product page and record the observation.
    Scrape {
        url: String,
        #[arg(long)]
        selector: Option<String>,
    },
    /// Keyword search on a supported site.
    Search { site: String, keyword: String },
    /// List scheduled monitoring tasks.
    Tasks,
}

fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("shopzap={level}").parse()?)
        .add_directive("warn".parse()?);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;
    let config = MonitorConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            info!(port = config.port, db = %config.db_path.display(), "starting shopzap");
            shopzap_web::serve(config).await?;
        }
        Commands::Scrape { url, selector } => {
            let monitor = Monitor::from_config(&config).await?;
            let report = monitor
                .pipeline()
                .run(&url, selector.as_deref())
                .await
                .with_context(|| format!("scraping {url}"));
            // A restock alert may still be queued; deliver it before exiting.
            monitor.pipeline().drain_alerts().await;
            println!("{}", serde_json::to_string_pretty(&report?)?);
        }
        Commands::Search { site, keyword } => {
            let monitor = Monitor::from_config(&config).await?;
            let hits = monitor
                .pipeline()
                .search(&site, &keyword)
                .await
                .with_context(|| format!("searching {site} for {keyword:?}"))?;
            println!("{}", serde_json::to_string_pretty(&hits)?);
        }
        Commands::Tasks => {
            let monitor = Monitor::from_config(&config).await?;
            for task in monitor.scheduler().list().await {
                println!(
                    "{}\t{}\t{}\t{}",
                    task.task_id,
                    task.trigger_schedule,
                    task.target_url,
                    task.field_descriptor.as_deref().unwrap_or("-")
                );
            }
        }
    }

    Ok(())
}
