use clap::Parser;
use snafu::prelude::*;

use crate::config::EngineConfig;
use crate::consumer::Consumer;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("input is not valid JSON: {source}"))]
    BadInput { source: serde_json::Error },

    #[snafu(display("core setup error: {source}"))]
    Core { source: super::Error },

    #[snafu(display("start error: {source}"))]
    Start { source: crate::consumer::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Parser, Debug)]
pub struct StartArgs {
    /// Workflow name
    pub name: String,
    /// Workflow version
    pub version: String,
    /// JSON input for the instance (defaults to {})
    #[arg(default_value = "{}")]
    pub input: String,
}

pub async fn handle_start(args: StartArgs, config: EngineConfig) -> Result<()> {
    let input = serde_json::from_str(&args.input).context(BadInputSnafu)?;
    let core = super::build_core(config).await.context(CoreSnafu)?;
    let consumer = Consumer::new(core);
    let workflow_id = consumer
        .start(&args.name, &args.version, input)
        .await
        .context(StartSnafu)?;
    println!("started {} {} as {workflow_id}", args.name, args.version);
    Ok(())
}
