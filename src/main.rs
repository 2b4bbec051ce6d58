use std::process::ExitCode;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde_json::json;
use thiserror::Error;
use tracing::info;
use ulid::Ulid;

use labbook::config::Config;
use labbook::model::{EquipmentInfo, Reservation};
use labbook::notify::NotifyHub;
use labbook::{with_deadline, Engine, RequesterId, ReservationStore, ResourceId, StoreError};

#[derive(Parser)]
#[command(author, version, about = "Operate the equipment reservation store", long_about = None)]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register a piece of equipment
    Register {
        #[arg(long)]
        equipment: i64,
        #[arg(long)]
        name: Option<String>,
    },
    /// Retire equipment that holds no reservations
    Retire {
        #[arg(long)]
        equipment: i64,
    },
    /// Change or clear an equipment's name
    Rename {
        #[arg(long)]
        equipment: i64,
        #[arg(long)]
        name: Option<String>,
    },
    /// List equipment, look one up by id, or search by name
    Equipment {
        #[arg(long, conflicts_with = "name")]
        id: Option<i64>,
        #[arg(long)]
        name: Option<String>,
    },
    /// Reserve equipment for [start, end)
    Reserve {
        #[arg(long)]
        equipment: i64,
        #[arg(long)]
        requester: String,
        /// RFC 3339 instant, e.g. 2026-03-02T10:00:00+01:00
        #[arg(long, value_parser = parse_instant)]
        start: DateTime<Utc>,
        #[arg(long, value_parser = parse_instant)]
        end: DateTime<Utc>,
    },
    /// List reservations on a piece of equipment
    List {
        #[arg(long)]
        equipment: i64,
    },
    /// List reservations made by a requester
    Mine {
        #[arg(long)]
        requester: String,
    },
    /// Show one reservation
    Show { id: Ulid },
    /// Cancel a reservation owned by the requester
    Cancel {
        id: Ulid,
        #[arg(long)]
        requester: String,
    },
    /// Compact the WAL now
    Compact,
}

#[derive(Debug, Error)]
enum CommandError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("reservation {id} is not owned by {requester}")]
    NotOwner { id: Ulid, requester: String },
}

impl CommandError {
    fn label(&self) -> &'static str {
        match self {
            CommandError::Store(e) => e.label(),
            CommandError::NotOwner { .. } => "forbidden",
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, CommandError::Store(e) if e.is_retryable())
    }

    fn to_json(&self) -> serde_json::Value {
        json!({
            "error": self.to_string(),
            "kind": self.label(),
            "retryable": self.is_retryable(),
        })
    }
}

fn parse_instant(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid RFC 3339 instant {s:?}: {e}"))
}

fn reservation_json(r: &Reservation) -> serde_json::Value {
    json!({
        "id": r.id.to_string(),
        "equipment_id": r.resource_id,
        "requester_id": r.requester_id,
        "start": r.start().to_rfc3339(),
        "end": r.end().to_rfc3339(),
    })
}

fn equipment_json(e: &EquipmentInfo) -> serde_json::Value {
    json!({
        "equipment_id": e.id,
        "name": e.name,
        "reservations": e.reservation_count,
    })
}

async fn run(engine: &Engine, config: &Config, command: Command) -> Result<serde_json::Value, CommandError> {
    let deadline = config.op_timeout();
    let out = match command {
        Command::Register { equipment, name } => {
            with_deadline(deadline, engine.register_equipment(ResourceId(equipment), name)).await?;
            json!({ "registered": equipment })
        }
        Command::Retire { equipment } => {
            with_deadline(deadline, engine.retire_equipment(ResourceId(equipment))).await?;
            json!({ "retired": equipment })
        }
        Command::Rename { equipment, name } => {
            with_deadline(deadline, engine.rename_equipment(ResourceId(equipment), name)).await?;
            json!({ "renamed": equipment })
        }
        Command::Equipment { id: Some(id), .. } => equipment_json(&engine.equipment(ResourceId(id)).await?),
        Command::Equipment { id: None, name: Some(query) } => {
            engine.equipment_by_name(&query).await.iter().map(equipment_json).collect()
        }
        Command::Equipment { id: None, name: None } => {
            engine.list_equipment().await.iter().map(equipment_json).collect()
        }
        Command::Reserve { equipment, requester, start, end } => {
            let id = with_deadline(
                deadline,
                engine.create(ResourceId(equipment), RequesterId::new(requester), start, end),
            )
            .await?;
            json!({ "id": id.to_string() })
        }
        Command::List { equipment } => {
            let rs = with_deadline(deadline, engine.list_by_resource(ResourceId(equipment))).await?;
            rs.iter().map(reservation_json).collect()
        }
        Command::Mine { requester } => {
            let rs = with_deadline(deadline, engine.list_by_requester(&RequesterId::new(requester))).await?;
            rs.iter().map(reservation_json).collect()
        }
        Command::Show { id } => reservation_json(&with_deadline(deadline, engine.get(id)).await?),
        Command::Cancel { id, requester } => {
            // Ownership is checked here, at the boundary; the store never authorizes.
            let reservation = with_deadline(deadline, engine.get(id)).await?;
            if reservation.requester_id.as_str() != requester {
                return Err(CommandError::NotOwner { id, requester });
            }
            with_deadline(deadline, engine.cancel(id)).await?;
            json!({ "cancelled": id.to_string() })
        }
        Command::Compact => {
            engine.compact_wal().await?;
            json!({ "compacted": true })
        }
    };
    Ok(out)
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = cli.config;

    labbook::observability::init_tracing(&config.log);
    labbook::observability::init_metrics(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let wal_path = config.wal_path();
    let engine = Engine::new(wal_path.clone(), Arc::new(NotifyHub::new()))?;
    info!("opened {}", wal_path.display());

    let result = run(&engine, &config, cli.command).await;
    if engine.compact_if_needed(config.compact_threshold).await? {
        info!("WAL compacted after {} appends", config.compact_threshold);
    }

    let (out, code) = match result {
        Ok(v) => (v, ExitCode::SUCCESS),
        Err(e) => (e.to_json(), ExitCode::FAILURE),
    };
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(code)
}
