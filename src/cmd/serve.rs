use clap::Parser;
use snafu::prelude::*;
use tracing::info;

use crate::config::EngineConfig;
use crate::consumer::Consumer;
use crate::outbox::processor::{OutboxProcessor, SentReaper};
use crate::outbox::OutboxTable;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("core setup error: {source}"))]
    Core { source: super::Error },

    #[snafu(display("signal error: {source}"))]
    Signal { source: std::io::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Parser, Debug)]
pub struct ServeArgs {}

/// Run the full worker: consumer, one outbox processor per table, and the
/// sent-row reapers, until ctrl-c.
pub async fn handle_serve(_args: ServeArgs, config: EngineConfig) -> Result<()> {
    let outbox_config = config.outbox.clone();
    let core = super::build_core(config).await.context(CoreSnafu)?;

    let mut tasks = Vec::new();
    for table in [OutboxTable::Waits, OutboxTable::Retries] {
        tasks.push(
            OutboxProcessor::new(
                core.outbox.clone(),
                core.broker.clone(),
                table,
                outbox_config.clone(),
            )
            .spawn(),
        );
        tasks.push(SentReaper::new(core.outbox.clone(), table, outbox_config.clone()).spawn());
    }
    tasks.push(Consumer::new(core).spawn());

    info!("worker running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await.context(SignalSnafu)?;
    info!("shutting down");
    for task in tasks {
        task.abort();
    }
    Ok(())
}
