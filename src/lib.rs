//! FIFO cost-layer ledger for inventory positions: receipts with landed-cost
//! allocation, FIFO consumption with exact COGS, valuation rollups, a
//! finance-integrity auditor, and a reconciler that repairs the drift the
//! auditor finds.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod config;
pub mod costing;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod migrator;
pub mod services;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::errors::AppError;
use crate::events::{Event, EventSender};
use crate::services::AppServices;

/// Shared state of a running engine: the pool, the effective configuration,
/// the event channel, and every service wired over them.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbPool>,
    pub config: AppConfig,
    pub event_sender: EventSender,
    pub services: AppServices,
}

/// Connects to the database, optionally migrates, and wires the services.
/// Returns the state plus the receiving end of the event channel; callers
/// decide whether to drain it with [`events::process_events`] or their own
/// consumer.
pub async fn bootstrap(
    config: AppConfig,
) -> Result<(AppState, tokio::sync::mpsc::Receiver<Event>), AppError> {
    let pool = db::establish_connection_from_app_config(&config).await?;
    if config.auto_migrate {
        db::run_migrations(&pool).await?;
    }

    let db = Arc::new(pool);
    let (event_sender, event_receiver) = events::channel(1024);
    let services = AppServices::build(db.clone(), &config, event_sender.clone());

    Ok((
        AppState {
            db,
            config,
            event_sender,
            services,
        },
        event_receiver,
    ))
}
