// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::time::Duration;

use diesel::ConnectionError;
use diesel_async::pooled_connection::ManagerConfig;
use diesel_async::{
    pooled_connection::{
        bb8::{Pool, PooledConnection},
        AsyncDieselConnectionManager,
    },
    AsyncPgConnection, RunQueryDsl,
};
use futures::FutureExt;
use tracing::info;
use url::Url;

pub mod sessions;
pub mod tls;

pub use sessions::{SessionRow, SessionView};
use tls::{build_tls_config, establish_tls_connection};

#[derive(clap::Args, Debug, Clone)]
pub struct DbArgs {
    // Number of connections to keep in the pool.
    #[arg(long, env, default_value_t = Self::default().db_connection_pool_size)]
    pub db_connection_pool_size: u32,

    // Time spent waiting for a connection from the pool to become available, in milliseconds.
    #[arg(long, env, default_value_t = Self::default().db_connection_timeout_ms)]
    pub db_connection_timeout_ms: u64,

    // Time spent waiting for statements to complete, in milliseconds.
    #[arg(long, env)]
    pub db_statement_timeout_ms: Option<u64>,

    // Verify the server certificate. Off by default, matching libpq.
    #[arg(long, env)]
    pub tls_verify_cert: bool,

    // Extra CA certificate (PEM or DER) trusted when verifying the server certificate.
    #[arg(long, env)]
    pub tls_ca_cert_path: Option<PathBuf>,
}

// Read-only handle over a pool of connections to the indexer database. Instances of [Db] can be
// cloned to share access to the same pool.
#[derive(Clone)]
pub struct Db {
    pool: Pool<AsyncPgConnection>,
}

// Wrapper struct over the remote `PooledConnection` type.
pub struct Connection<'a>(PooledConnection<'a, AsyncPgConnection>);

impl DbArgs {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.db_connection_timeout_ms)
    }

    pub fn statement_timeout(&self) -> Option<Duration> {
        self.db_statement_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for DbArgs {
    fn default() -> Self {
        Self {
            db_connection_pool_size: 4,
            db_connection_timeout_ms: 30_000,
            db_statement_timeout_ms: None,
            tls_verify_cert: false,
            tls_ca_cert_path: None,
        }
    }
}

impl Db {
    // Construct a pool whose connections default to read-only transactions. The finalizer only
    // ever reads the session view; writes belong to the indexer that feeds it.
    pub async fn for_read(database_url: Url, config: DbArgs) -> anyhow::Result<Self> {
        info!(
            "Connecting to {}:{} (pool size {})",
            database_url.host_str().unwrap_or("<unknown>"),
            database_url.port().unwrap_or(5432),
            config.db_connection_pool_size
        );
        let pool = pool(database_url, config, true).await?;
        Ok(Self { pool })
    }

    // Retrieves a connection from the pool. Can fail with a timeout if a connection cannot be
    // established before the [DbArgs::connection_timeout] has elapsed.
    pub async fn connect(&self) -> anyhow::Result<Connection<'_>> {
        Ok(Connection(self.pool.get().await?))
    }
}

impl<'a> Deref for Connection<'a> {
    type Target = PooledConnection<'a, AsyncPgConnection>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Connection<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

// Builds a database URL out of discrete credentials, the way the legacy deployment passed them
// (`DB_USER`, `DB_PASSWORD`, `DB_HOST`, `DB_DATABASE`).
pub fn database_url_from_parts(
    user: &str,
    password: &str,
    host: &str,
    database: &str,
) -> anyhow::Result<Url> {
    let mut url = Url::parse(&format!("postgres://{host}/{database}"))?;
    url.set_username(user)
        .map_err(|_| anyhow::anyhow!("Invalid database user"))?;
    if !password.is_empty() {
        url.set_password(Some(password))
            .map_err(|_| anyhow::anyhow!("Invalid database password"))?;
    }
    Ok(url)
}

async fn pool(
    database_url: Url,
    args: DbArgs,
    read_only: bool,
) -> anyhow::Result<Pool<AsyncPgConnection>> {
    let statement_timeout = args.statement_timeout();
    let tls_config = build_tls_config(args.tls_verify_cert, args.tls_ca_cert_path.as_deref())?;

    let mut config = ManagerConfig::default();

    config.custom_setup = Box::new(move |url| {
        let tls_config = tls_config.clone();

        async move {
            let mut conn = establish_tls_connection(url, tls_config).await?;

            if let Some(timeout) = statement_timeout {
                diesel::sql_query(format!("SET statement_timeout = {}", timeout.as_millis()))
                    .execute(&mut conn)
                    .await
                    .map_err(ConnectionError::CouldntSetupConfiguration)?;
            }

            if read_only {
                diesel::sql_query("SET default_transaction_read_only = 'on'")
                    .execute(&mut conn)
                    .await
                    .map_err(ConnectionError::CouldntSetupConfiguration)?;
            }

            Ok(conn)
        }
        .boxed()
    });

    let manager = AsyncDieselConnectionManager::new_with_config(database_url.as_str(), config);

    Ok(Pool::builder()
        .max_size(args.db_connection_pool_size)
        .connection_timeout(args.connection_timeout())
        .build(manager)
        .await?)
}
