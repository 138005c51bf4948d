// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use clap::Parser;
use rabbitmq_jobs::{
    cli::{self, Cli, LogHandler, LOG_HANDLER},
    AmqpConfig, FromEnv, HandlerRegistry,
};
use std::{process::ExitCode, sync::Arc};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn install_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if let Err(err) = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init()
    {
        eprintln!("failure to install tracing subscriber: {err}");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    install_tracing();

    let cfg = match AmqpConfig::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = err.to_string(), "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let registry = HandlerRegistry::new().register(LOG_HANDLER, Arc::new(LogHandler));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received");
            shutdown_tx.send_replace(true);
        }
    });

    match cli::run(cli, cfg, registry, shutdown_rx).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = err.to_string(), "exiting on error");
            ExitCode::FAILURE
        }
    }
}
