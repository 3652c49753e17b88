#![allow(clippy::print_stdout)]

mod args;
mod commands;

use crate::args::Cli;
use clap::Parser;
use qhub_domain::config::{AppConfig, LoggingSettings};
use qhub_kernel::config::load_config;
use qhub_logger::{Logger, parse_level, parse_rotation};
use qhub_quota::QuotaManager;
use tracing::debug;

fn init_logger(settings: &LoggingSettings) -> anyhow::Result<Logger> {
    let builder =
        Logger::builder().name(env!("CARGO_BIN_NAME")).console(settings.console).level(parse_level(&settings.level)?);
    let builder = match &settings.filter {
        Some(filter) => builder.env_filter(filter),
        None => builder,
    };

    let logger = match &settings.directory {
        Some(directory) => {
            let file = builder
                .path(directory)
                .rotation(parse_rotation(&settings.rotation)?)
                .max_files(settings.max_files);
            if settings.json { file.json().init()? } else { file.init()? }
        },
        None => builder.init()?,
    };
    Ok(logger)
}

#[qhub_runtime::main(memory_efficient)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config: AppConfig = load_config(cli.config.as_ref())?;
    if let Some(root) = cli.root {
        config.quota.storage_dir = root;
    }
    let _logger = init_logger(&config.logging)?;
    debug!(quota = ?config.quota, "Configuration loaded");

    let manager =
        QuotaManager::builder().root(&config.quota.storage_dir).config(config.quota.clone()).build()?;

    let outcome = commands::execute(&manager, cli.command).await;
    manager.shutdown().await?;
    outcome
}
