// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `tally serve` command implementation.
//!
//! Opens the database, builds the configured notification sink and runs the
//! scheduled dispatcher until SIGINT or SIGTERM.

use std::time::Duration;

use tally_config::TallyConfig;
use tally_core::TallyError;
use tally_dispatch::{ScheduledDispatcher, sink_from_config};
use tally_storage::Database;
use tracing::info;

use crate::shutdown;

/// Run the dispatcher loop until a shutdown signal arrives.
pub async fn run_serve(config: &TallyConfig) -> Result<(), TallyError> {
    let db = Database::from_config(&config.storage).await?;
    let sink = sink_from_config(&config.notify)?;
    let dispatcher = ScheduledDispatcher::from_config(db.clone(), sink, &config.dispatch);

    info!(
        service = %config.service.name,
        database = %config.storage.database_path,
        sink = dispatcher.sink_name(),
        interval_secs = config.dispatch.interval_secs,
        "tally serving"
    );

    let cancel = shutdown::install_signal_handler();
    let runs = dispatcher
        .run_scheduled(Duration::from_secs(config.dispatch.interval_secs), cancel)
        .await;

    drop(dispatcher);
    db.close().await?;
    info!(runs, "tally stopped");
    Ok(())
}

/// Initializes the tracing subscriber with the given log level.
///
/// `RUST_LOG` takes precedence when set.
pub fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tally={log_level},warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(false)
        .with_writer(std::io::stderr)
        .init();
}
