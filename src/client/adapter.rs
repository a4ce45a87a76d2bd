//! Adapter facade
//!
//! `query` / `prepared` / `close` over either a pool or a single lazily (re)opened
//! connection, depending on the configuration's pooling flag.

use crate::connection::{Connection, ConnectionConfig, Row, TransportProvider};
use crate::pool::ConnectionPool;
use crate::sanitize::sanitize;
use crate::{Error, Result};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::Instrument;

/// Database facade
///
/// Every error returned by [`query`](Self::query) and [`prepared`](Self::prepared)
/// is an `Error::Query`; [`Error::cause`] gives the underlying failure.
pub struct Adapter {
    config: Arc<ConnectionConfig>,
    backend: Backend,
}

enum Backend {
    Pooled(ConnectionPool),
    Single(SingleConnection),
}

/// One shared connection, replaced on demand after it closes itself
struct SingleConnection {
    provider: Arc<dyn TransportProvider>,
    conn: tokio::sync::Mutex<Option<Connection>>,
    closed: AtomicBool,
}

impl Adapter {
    /// Create an adapter without opening any connection.
    ///
    /// # Errors
    ///
    /// `Error::Config` if the configuration is invalid.
    pub fn new(
        config: impl Into<Arc<ConnectionConfig>>,
        provider: Arc<dyn TransportProvider>,
    ) -> Result<Self> {
        let config = config.into();
        config.validate()?;

        let backend = if config.pooling() {
            Backend::Pooled(ConnectionPool::new(config.clone(), provider)?)
        } else {
            Backend::Single(SingleConnection {
                provider,
                conn: tokio::sync::Mutex::new(None),
                closed: AtomicBool::new(false),
            })
        };

        Ok(Self { config, backend })
    }

    /// Create an adapter and open its first connection.
    ///
    /// # Errors
    ///
    /// `Error::Config` for an invalid configuration, `Error::Connect` if the server
    /// cannot be reached or rejects the handshake.
    pub async fn connect(
        config: impl Into<Arc<ConnectionConfig>>,
        provider: Arc<dyn TransportProvider>,
    ) -> Result<Self> {
        let adapter = Self::new(config, provider)?;

        match &adapter.backend {
            Backend::Pooled(pool) => {
                let conn = pool.acquire().await?;
                pool.release(conn).await?;
            }
            Backend::Single(single) => {
                single.connection(&adapter.config).await?;
            }
        }

        tracing::debug!(
            host = %adapter.config.host(),
            database = %adapter.config.database(),
            pooling = adapter.config.pooling(),
            "adapter connected"
        );
        Ok(adapter)
    }

    /// Run SQL verbatim
    pub async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        self.run(sql, Vec::new())
            .instrument(tracing::debug_span!("query"))
            .await
            .map_err(Error::into_query)
    }

    /// Rewrite `?` placeholders for the configured dialect, then run.
    ///
    /// Fails with an `Error::Query` caused by `Error::ParamCountMismatch` when
    /// `params` is short.
    pub async fn prepared(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let run = async {
            let query = sanitize(sql, params, self.config.dialect())?;
            self.run(&query.sql, query.values).await
        };
        run.instrument(tracing::debug_span!("prepared", params = params.len()))
            .await
            .map_err(Error::into_query)
    }

    /// Close the pool or the single connection.
    ///
    /// Later calls fail with an `Error::Query` caused by `Error::ConnectionClosed`.
    pub async fn close(&self) {
        match &self.backend {
            Backend::Pooled(pool) => pool.close().await,
            Backend::Single(single) => single.close().await,
        }
    }

    /// Whether [`close`](Self::close) was called
    pub fn is_closed(&self) -> bool {
        match &self.backend {
            Backend::Pooled(pool) => pool.is_closed(),
            Backend::Single(single) => single.closed.load(Ordering::Acquire),
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// The pool, when pooling is enabled
    pub fn pool(&self) -> Option<&ConnectionPool> {
        match &self.backend {
            Backend::Pooled(pool) => Some(pool),
            Backend::Single(_) => None,
        }
    }

    async fn run(&self, sql: &str, values: Vec<Value>) -> Result<Vec<Row>> {
        match &self.backend {
            Backend::Pooled(pool) => {
                let lease = Lease {
                    pool,
                    conn: Some(pool.acquire().await?),
                };
                let result = lease.connection()?.execute(sql, values).await;
                lease.release().await;
                result
            }
            Backend::Single(single) => {
                let conn = single.connection(&self.config).await?;
                conn.execute(sql, values).await
            }
        }
    }
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("Adapter");
        s.field("config", &self.config);
        match &self.backend {
            Backend::Pooled(pool) => s.field("pool", pool),
            Backend::Single(single) => s.field("closed", &single.closed.load(Ordering::Relaxed)),
        };
        s.finish()
    }
}

impl SingleConnection {
    /// Current connection, reopened if it closed itself
    async fn connection(&self, config: &Arc<ConnectionConfig>) -> Result<Connection> {
        let mut slot = self.conn.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }

        if let Some(conn) = slot.as_ref().filter(|c| c.is_open()) {
            return Ok(conn.clone());
        }

        if slot.is_some() {
            tracing::debug!("replacing closed connection");
        }
        let conn = Connection::connect(config.clone(), self.provider.clone()).await?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let conn = self.conn.lock().await.take();
        if let Some(conn) = conn {
            conn.close().await;
        }
    }
}

/// Checked-out pool connection, returned on every path
struct Lease<'a> {
    pool: &'a ConnectionPool,
    conn: Option<Connection>,
}

impl Lease<'_> {
    fn connection(&self) -> Result<&Connection> {
        self.conn.as_ref().ok_or(Error::ConnectionClosed)
    }

    async fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = self.pool.release(conn).await {
                tracing::warn!(error = %e, "failed to return connection to pool");
            }
        }
    }
}

impl Drop for Lease<'_> {
    // Only reached when the query future is dropped mid-flight
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let pool = self.pool.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = pool.release(conn).await {
                    tracing::warn!(error = %e, "failed to return connection to pool");
                }
            });
        }
    }
}
