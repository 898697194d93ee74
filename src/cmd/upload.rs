use std::path::PathBuf;

use clap::Parser;
use snafu::prelude::*;
use tracing::info;

use crate::config::EngineConfig;
use crate::parser;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("cannot read {path:?}: {source}"))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("definition does not validate: {source}"))]
    Invalid { source: crate::parser::Error },

    #[snafu(display("core setup error: {source}"))]
    Core { source: super::Error },

    #[snafu(display("definition store error: {source}"))]
    Store { source: crate::store::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Parser, Debug)]
pub struct UploadArgs {
    /// Workflow definition file (YAML or JSON)
    pub file: PathBuf,
}

pub async fn handle_upload(args: UploadArgs, config: EngineConfig) -> Result<()> {
    let text = tokio::fs::read_to_string(&args.file)
        .await
        .context(ReadSnafu {
            path: args.file.clone(),
        })?;

    // Validate before storing; definitions are immutable once uploaded.
    let tree = parser::parse_str(&text).context(InvalidSnafu)?;

    let core = super::build_core(config).await.context(CoreSnafu)?;
    core.definitions
        .insert(&tree.name, &tree.version, &text)
        .await
        .context(StoreSnafu)?;

    info!(name = tree.name, version = tree.version, "definition uploaded");
    println!("uploaded {} {}", tree.name, tree.version);
    Ok(())
}
