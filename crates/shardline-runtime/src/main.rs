//! shardline: command-line front end over a file-backed partitioned log.

use clap::Parser;

mod cli;
mod cmd_compact;
mod cmd_consume;
mod cmd_publish;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    let filter = std::env::var("SHARDLINE_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    let data_dir = args.data_dir;
    match args.command {
        cli::Command::Create(opts) => cmd_publish::cmd_create(&data_dir, &opts).await?,
        cli::Command::Publish(opts) => cmd_publish::cmd_publish(&data_dir, opts).await?,
        cli::Command::Close(opts) => cmd_publish::cmd_close(&data_dir, &opts).await?,
        cli::Command::Consume(opts) => cmd_consume::cmd_consume(&data_dir, opts).await?,
        cli::Command::Compact(opts) => cmd_compact::cmd_compact(&data_dir, opts).await?,
    }

    Ok(())
}
