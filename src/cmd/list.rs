use clap::Parser;
use snafu::prelude::*;

use crate::config::EngineConfig;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("core setup error: {source}"))]
    Core { source: super::Error },

    #[snafu(display("definition store error: {source}"))]
    Store { source: crate::store::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Parser, Debug)]
pub struct ListArgs {}

pub async fn handle_list(_args: ListArgs, config: EngineConfig) -> Result<()> {
    let core = super::build_core(config).await.context(CoreSnafu)?;
    let definitions = core.definitions.list().await.context(StoreSnafu)?;
    if definitions.is_empty() {
        println!("no definitions uploaded");
        return Ok(());
    }
    for (name, version) in definitions {
        println!("{name} {version}");
    }
    Ok(())
}
