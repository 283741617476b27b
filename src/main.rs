use std::process::exit;

use anyhow::Context;
use clap::Parser;

use config::Args;
use dispatcher::Dispatcher;

mod config;
mod dispatcher;
mod flow;
mod logging;
mod mutator;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    logging::init(args.log_level, args.log_format);

    if let Err(err) = run(args).await {
        eprintln!("{err:#}");
        exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let resolved = args.resolve().await.context("failed to resolve configuration")?;

    let dispatcher = Dispatcher::bind(
        resolved.listen_addr,
        resolved.server_addr,
        resolved.proxy_as_server_template,
        resolved.idle_timeout,
        resolved.gc_interval,
    )
    .await
    .with_context(|| format!("failed to bind listen socket {}", resolved.listen_addr))?;

    tokio::select! {
        result = dispatcher.run() => {
            result.context("dispatcher loop terminated")?;
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("shutdown requested, exiting");
        }
    }
    Ok(())
}
