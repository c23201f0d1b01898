use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};

use peg_ledger_lib::broadcast::LocalBus;
use peg_ledger_lib::clock::SystemClock;
use peg_ledger_lib::db::{self, DbState};
use peg_ledger_lib::identity::{Actor, KeyringIdentity};
use peg_ledger_lib::import::{export_rows, import_rows};
use peg_ledger_lib::settings::{get_setting, set_setting, ALL_KEYS};
use peg_ledger_lib::{diagnostics, init_logging, ClientContext, MutationOutcome, ProductKey, RoomStatus};

#[derive(Parser)]
#[command(name = "peg-ledger")]
#[command(version)]
#[command(about = "Bar inventory and peg accounting ledger", long_about = None)]
struct Cli {
    /// Data directory (defaults to $PEG_LEDGER_DATA_DIR or the platform data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Queue mutations instead of applying them, as a disconnected client would
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version, database and sync health
    Status,

    /// Onboard products from a JSON array of spreadsheet rows
    Import { file: PathBuf },

    /// Print current stock as JSON rows that `import` accepts
    Export,

    /// Compare expected closing stock with current stock
    Reconcile,

    /// Sell servings (pegs) of a product, e.g. `sell "Old Monk@750" 2`
    Sell { product: String, servings: u32 },

    /// Receive stock
    Purchase {
        product: String,
        #[arg(long, default_value_t = 0)]
        cases: u64,
        #[arg(long, default_value_t = 0)]
        bottles: u64,
    },

    /// Record spilled or broken stock in ml
    Waste {
        product: String,
        ml: u64,
        #[arg(long, default_value = "")]
        reason: String,
    },

    /// Overwrite stock with a physical count
    Count {
        product: String,
        containers: u64,
        #[arg(long, default_value_t = 0.0)]
        servings: f64,
        #[arg(long)]
        reason: String,
    },

    /// Set a room's status
    Room {
        id: String,
        status: String,
        #[arg(long)]
        occupant: Option<String>,
    },

    /// List rooms
    Rooms,

    /// Show servings sold and the most recent bar sales
    Sales {
        /// Limit the totals to one product, e.g. "Old Monk@750"
        product: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Show recent activity, newest first
    Activity {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Replay the offline queue
    Replay {
        /// Drop a queued mutation that can never apply instead of replaying
        #[arg(long)]
        discard: Option<String>,
    },

    /// Read or write an engine setting
    Setting { key: Option<String>, value: Option<String> },

    /// Store the signed-in staff member in the OS keyring
    Login { id: String, name: String, device: String },

    /// Forget the signed-in staff member
    Logout,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let data_dir = cli.data_dir.unwrap_or_else(diagnostics::get_data_dir);
    init_logging(&data_dir.join("logs"));

    let Some(command) = cli.command else {
        println!("Use --help to see available commands");
        return Ok(());
    };

    match &command {
        Commands::Login { id, name, device } => {
            let actor = Actor {
                id: id.clone(),
                name: name.clone(),
                device: device.clone(),
            };
            KeyringIdentity::store(&actor).map_err(|e| anyhow!(e))?;
            return Ok(());
        }
        Commands::Logout => {
            KeyringIdentity::clear().map_err(|e| anyhow!(e))?;
            return Ok(());
        }
        _ => {}
    }

    let db = Arc::new(db::init(&data_dir).context("opening ledger database")?);

    if let Commands::Setting { key, value } = &command {
        return setting(&db, key.as_deref(), value.as_deref());
    }

    let ctx = ClientContext::open(
        db.clone(),
        Arc::new(LocalBus::default()),
        Arc::new(KeyringIdentity::new(hostname())),
        Arc::new(SystemClock),
    )?;
    if cli.offline {
        ctx.go_offline();
    }

    let result = dispatch(&db, &ctx, command).await;
    ctx.flush_now().context("flushing ledger state")?;
    result
}

async fn dispatch(db: &DbState, ctx: &ClientContext, command: Commands) -> Result<()> {
    match command {
        Commands::Status => print_json(&json!({
            "about": diagnostics::get_about_info(),
            "health": diagnostics::get_system_health(db, ctx)?,
        })),
        Commands::Import { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let rows: Vec<Value> = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not a JSON array of rows", file.display()))?;
            print_json(&import_rows(ctx, &rows))
        }
        Commands::Export => print_json(&export_rows(&ctx.products()?)),
        Commands::Reconcile => print_json(&ctx.discrepancy_report_in_background().await?),
        Commands::Sell { product, servings } => {
            let key = ProductKey::parse(&product)?;
            match ctx.record_sale(&key, servings)? {
                MutationOutcome::Committed(sale) => print_json(&json!({
                    "product": key,
                    "requested": sale.requested,
                    "fulfilled": sale.fulfilled,
                    "current": sale.entry.current,
                })),
                MutationOutcome::Queued { mutation_id } => print_queued(&mutation_id),
            }
        }
        Commands::Purchase {
            product,
            cases,
            bottles,
        } => {
            let key = ProductKey::parse(&product)?;
            print_outcome(ctx.record_purchase(&key, cases, bottles)?)
        }
        Commands::Waste { product, ml, reason } => {
            let key = ProductKey::parse(&product)?;
            match ctx.record_wastage(&key, ml, &reason)? {
                MutationOutcome::Committed(outcome) => print_json(&json!({
                    "product": key,
                    "current": outcome.entry.current,
                    "openContainerWrittenOff": outcome.open_container_written_off,
                })),
                MutationOutcome::Queued { mutation_id } => print_queued(&mutation_id),
            }
        }
        Commands::Count {
            product,
            containers,
            servings,
            reason,
        } => {
            let key = ProductKey::parse(&product)?;
            print_outcome(ctx.adjust_to_physical_count(&key, containers, servings, &reason)?)
        }
        Commands::Room {
            id,
            status,
            occupant,
        } => {
            let status = RoomStatus::parse(&status)
                .ok_or_else(|| anyhow!("unknown room status '{status}'"))?;
            let outcome = ctx.update_room_status(&id, status, occupant.as_deref(), ctx.now_ms())?;
            print_outcome(outcome)
        }
        Commands::Rooms => print_json(&ctx.rooms()?),
        Commands::Sales { product, limit } => {
            let accounting = ctx.accounting()?;
            let servings = match product.as_deref().map(ProductKey::parse).transpose()? {
                Some(key) => accounting.servings_sold_for(&key),
                None => accounting.servings_sold(),
            };
            print_json(&json!({
                "servingsSold": servings,
                "byProduct": accounting.servings_by_product,
                "recent": accounting.recent(limit),
            }))
        }
        Commands::Activity { limit } => print_json(&ctx.activity(limit)?),
        Commands::Replay { discard: Some(id) } => {
            if !ctx.discard_queued(&id)? {
                return Err(anyhow!("no queued mutation with id {id}"));
            }
            println!("Discarded {id}");
            Ok(())
        }
        Commands::Replay { discard: None } => print_json(&ctx.reconnect().await?),
        Commands::Setting { .. } | Commands::Login { .. } | Commands::Logout => Ok(()),
    }
}

fn setting(db: &DbState, key: Option<&str>, value: Option<&str>) -> Result<()> {
    match (key, value) {
        (None, _) => {
            let mut all = serde_json::Map::new();
            for key in ALL_KEYS {
                let value = get_setting(db, key)?.map(Value::String).unwrap_or(Value::Null);
                all.insert(key.to_string(), value);
            }
            print_json(&all)
        }
        (Some(key), None) => {
            println!("{}", get_setting(db, key)?.unwrap_or_default());
            Ok(())
        }
        (Some(key), Some(value)) => {
            set_setting(db, key, value)?;
            println!("{key} = {value}");
            Ok(())
        }
    }
}

fn print_outcome<T: Serialize>(outcome: MutationOutcome<T>) -> Result<()> {
    match outcome {
        MutationOutcome::Committed(value) => print_json(&value),
        MutationOutcome::Queued { mutation_id } => print_queued(&mutation_id),
    }
}

fn print_queued(mutation_id: &str) -> Result<()> {
    print_json(&json!({ "queued": true, "mutationId": mutation_id }))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "bar-terminal".into())
}
