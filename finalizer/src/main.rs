// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use proof_finalizer::config::Args;
use proof_finalizer::eth_client::EthChainClient;
use proof_finalizer::node::run_finalizer;
use proof_finalizer::source::PgEventSource;
use proof_finalizer_pg_db::{Db, SessionView};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Legacy deployments configure everything through a .env file
    let dotenv = dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    if let Some(path) = dotenv {
        info!("[Main] Loaded environment from {}", path.display());
    }

    let args = Args::parse();
    let db_args = args.db_args.clone();
    let config = args
        .into_config()?
        .validate()
        .context("Invalid finalizer configuration")?;

    let db = Db::for_read(config.database_url.clone(), db_args)
        .await
        .context("Failed to connect to the session database")?;
    let source = Arc::new(PgEventSource::new(SessionView::new(
        db,
        config.table_name.clone(),
    )?));
    let chain = Arc::new(
        EthChainClient::new(
            config.rpc_endpoint.as_str(),
            config.wallet.clone(),
            config.proofchain_address,
            config.gas_limit,
        )
        .await?,
    );

    let cancel = CancellationToken::new();
    let handles = run_finalizer(config.coordinator_config(), source, chain, cancel.clone()).await;

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("[Main] Failed to listen for Ctrl-C: {}", e);
            return;
        }
        info!("[Main] Received Ctrl-C, shutting down");
        shutdown.cancel();
    });

    for result in futures::future::join_all(handles).await {
        result.map_err(|e| anyhow!("Task join error: {}", e))?;
    }
    info!("[Main] Finalizer stopped");
    Ok(())
}
