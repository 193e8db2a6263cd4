use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

use costledger::events;
use costledger::services::valuation::{ValuationFilter, ValuationMethod};

#[derive(Parser)]
#[command(name = "costledger-cli", about = "FIFO cost ledger operations")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run pending database migrations and exit.
    Migrate,
    /// Audit positions against their layer ledgers and print the summary.
    Audit {
        /// Per-position value drift tolerated before it is flagged.
        #[arg(long)]
        tolerance: Option<Decimal>,
        /// How many worst-drifted positions to list.
        #[arg(long)]
        top: Option<u64>,
        /// Persist the summary as an integrity snapshot.
        #[arg(long)]
        snapshot: bool,
    },
    /// Repair drift found by the auditor. Dry run unless --apply is given.
    Reconcile {
        /// Actually write repairs instead of reporting them.
        #[arg(long)]
        apply: bool,
        /// Cap on flagged positions touched in this pass.
        #[arg(long)]
        limit: Option<u64>,
    },
    /// Print a valuation report over the scoped positions.
    Valuation {
        #[arg(long)]
        organization: Option<Uuid>,
        #[arg(long)]
        product: Option<Uuid>,
        #[arg(long)]
        location: Option<Uuid>,
        #[arg(long)]
        category: Option<String>,
        /// fifo or weighted_average.
        #[arg(long, default_value = "fifo")]
        method: ValuationMethod,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = costledger::config::load_config()?;
    costledger::config::init_tracing(&config.log_level, config.log_json);

    if let Command::Migrate = cli.command {
        let pool = costledger::db::establish_connection_from_app_config(&config).await?;
        costledger::db::run_migrations(&pool).await?;
        info!("migrations applied");
        return Ok(());
    }

    let (state, event_rx) = costledger::bootstrap(config).await?;
    tokio::spawn(events::process_events(event_rx));

    match cli.command {
        Command::Migrate => unreachable!("handled before bootstrap"),
        Command::Audit {
            tolerance,
            top,
            snapshot,
        } => {
            let summary = state.services.integrity.audit(tolerance, top).await?;
            if snapshot {
                state.services.integrity.persist_snapshot(&summary).await?;
            }
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Reconcile { apply, limit } => {
            let result = state.services.reconciliation.reconcile(!apply, limit).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Valuation {
            organization,
            product,
            location,
            category,
            method,
        } => {
            let report = state
                .services
                .valuation
                .report(
                    ValuationFilter {
                        organization_id: organization,
                        product_id: product,
                        location_id: location,
                        category,
                    },
                    method,
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
