use clap::Parser;
use snafu::prelude::*;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod activities;
mod broker;
mod cmd;
mod config;
mod consumer;
mod context;
mod descriptors;
mod dsl;
mod errors;
mod expressions;
mod interpreter;
mod message;
mod node;
mod outbox;
mod parser;
mod position;
mod retry;
mod store;

use cmd::{
    handle_list, handle_serve, handle_start, handle_upload, ListArgs, ServeArgs, StartArgs,
    UploadArgs,
};
use config::EngineConfig;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Upload error: {source}"))]
    Upload { source: cmd::upload::Error },

    #[snafu(display("List error: {source}"))]
    List { source: cmd::list::Error },

    #[snafu(display("Start error: {source}"))]
    Start { source: cmd::start::Error },

    #[snafu(display("Serve error: {source}"))]
    Serve { source: cmd::serve::Error },
}

#[derive(Parser, Debug)]
#[command(name = "shrike")]
#[command(version)]
#[command(about = "A durable, outbox-driven execution engine for Serverless Workflows", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Upload a workflow definition
    Upload(UploadArgs),
    /// List uploaded definitions
    List(ListArgs),
    /// Start a workflow instance
    Start(StartArgs),
    /// Run the worker (consumer + outbox processors)
    Serve(ServeArgs),
}

fn init_tracing(verbose: bool) {
    let filter_layer = if verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"))
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = EngineConfig::load().unwrap_or_default();

    match cli.command {
        Commands::Upload(args) => handle_upload(args, config).await.context(UploadSnafu),
        Commands::List(args) => handle_list(args, config).await.context(ListSnafu),
        Commands::Start(args) => handle_start(args, config).await.context(StartSnafu),
        Commands::Serve(args) => handle_serve(args, config).await.context(ServeSnafu),
    }
}
