//! Bounded connection pool
//!
//! At most `max_connections` connections exist at once. When all of them are checked
//! out, `acquire()` suspends in a FIFO queue; a released connection goes straight to
//! the earliest waiter that is still listening. All bookkeeping lives under one lock
//! that is never held across an await, a wake-up or a connect.

use crate::connection::{Connection, ConnectionConfig, ConnectionId, TransportProvider};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;

type Waiter = oneshot::Sender<Result<Connection>>;

/// Pool of connections sharing one configuration and transport provider
///
/// Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: Arc<ConnectionConfig>,
    provider: Arc<dyn TransportProvider>,
    state: Mutex<PoolState>,
}

#[derive(Default)]
struct PoolState {
    /// Open connections plus in-progress creations
    active: usize,
    /// Released connections, most recently used last
    idle: Vec<Connection>,
    waiters: VecDeque<Waiter>,
    checked_out: HashSet<ConnectionId>,
    closed: bool,
}

impl PoolState {
    fn record(&self) {
        crate::metrics::gauges::pool_occupancy(self.active, self.idle.len(), self.waiters.len());
    }

    /// Earliest waiter whose caller is still waiting
    fn next_waiter(&mut self) -> Option<Waiter> {
        while let Some(waiter) = self.waiters.pop_front() {
            if !waiter.is_closed() {
                return Some(waiter);
            }
        }
        None
    }
}

impl ConnectionPool {
    /// Create an empty pool; connections are opened on demand.
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
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                provider,
                state: Mutex::new(PoolState::default()),
            }),
        })
    }

    /// Check out a connection.
    ///
    /// Reuses an idle connection, opens a new one while below capacity, or waits for
    /// a release. Waiters are served in the order they started waiting.
    ///
    /// # Errors
    ///
    /// `Error::Connect` if a new connection cannot be established,
    /// `Error::ConnectionClosed` once the pool is closed.
    pub async fn acquire(&self) -> Result<Connection> {
        let started = Instant::now();
        let result = self.acquire_inner().await;
        crate::metrics::histograms::pool_wait(started.elapsed().as_millis() as u64);
        result
    }

    async fn acquire_inner(&self) -> Result<Connection> {
        enum Next {
            Idle(Connection),
            Create(Reservation),
            Wait(Waiting),
        }

        let next = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(Error::ConnectionClosed);
            }

            let next = loop {
                match state.idle.pop() {
                    Some(conn) if conn.is_open() => {
                        state.checked_out.insert(conn.id());
                        break Next::Idle(conn);
                    }
                    Some(conn) => {
                        // Closed itself while idle; its slot is reused below
                        tracing::debug!(connection = %conn.id(), "discarding closed idle connection");
                        state.active -= 1;
                    }
                    None if state.active < self.inner.config.max_connections() => {
                        state.active += 1;
                        break Next::Create(Reservation::new(&self.inner));
                    }
                    None => {
                        let (tx, rx) = oneshot::channel();
                        state.waiters.push_back(tx);
                        break Next::Wait(Waiting {
                            rx,
                            inner: self.inner.clone(),
                        });
                    }
                }
            };
            state.record();
            next
        };

        match next {
            Next::Idle(conn) => Ok(conn),
            Next::Create(reservation) => {
                let conn = self.inner.open_connection().await?;
                match reservation.commit(conn) {
                    Ok(conn) => Ok(conn),
                    Err(conn) => {
                        conn.close().await;
                        Err(Error::ConnectionClosed)
                    }
                }
            }
            Next::Wait(mut waiting) => {
                tracing::debug!("pool exhausted, waiting for a connection");
                (&mut waiting.rx).await.map_err(|_| Error::ConnectionClosed)?
            }
        }
    }

    /// Return a checked-out connection.
    ///
    /// A healthy connection goes to the earliest waiter, or to the idle list. A closed
    /// one is discarded and its slot given to a fresh connection for the earliest
    /// waiter. After [`close`](Self::close) the connection is closed.
    ///
    /// # Errors
    ///
    /// `Error::ProtocolMisuse` if the connection is not checked out from this pool
    /// (released twice, or never acquired here).
    pub async fn release(&self, conn: Connection) -> Result<()> {
        if let Some(conn) = self.inner.check_in(conn)? {
            conn.close().await;
        }
        Ok(())
    }

    /// Close the pool.
    ///
    /// Idle connections are closed and waiters fail with `Error::ConnectionClosed`.
    /// Later `acquire()` calls fail; later releases close the returned connection.
    pub async fn close(&self) {
        let (idle, waiters) = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            let idle = std::mem::take(&mut state.idle);
            state.active -= idle.len();
            let waiters = std::mem::take(&mut state.waiters);
            state.record();
            (idle, waiters)
        };

        tracing::debug!(
            idle = idle.len(),
            waiters = waiters.len(),
            "closing pool"
        );

        for waiter in waiters {
            let _ = waiter.send(Err(Error::ConnectionClosed));
        }
        futures::future::join_all(idle.iter().map(|conn| conn.close())).await;
    }

    /// Open connections, including ones being created
    pub fn size(&self) -> usize {
        self.inner.state.lock().active
    }

    /// Connections available for immediate checkout
    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    /// Callers suspended in `acquire()`
    pub fn waiting(&self) -> usize {
        self.inner
            .state
            .lock()
            .waiters
            .iter()
            .filter(|w| !w.is_closed())
            .count()
    }

    /// Capacity
    pub fn max_connections(&self) -> usize {
        self.inner.config.max_connections()
    }

    /// Whether [`close`](Self::close) was called
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Configuration shared by every connection
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ConnectionPool")
            .field("active", &state.active)
            .field("idle", &state.idle.len())
            .field("waiting", &state.waiters.len())
            .field("max_connections", &self.inner.config.max_connections())
            .field("closed", &state.closed)
            .finish()
    }
}

impl PoolInner {
    async fn open_connection(&self) -> Result<Connection> {
        let conn = Connection::connect(self.config.clone(), self.provider.clone()).await?;
        tracing::debug!(connection = %conn.id(), "pool opened connection");
        Ok(conn)
    }

    /// Take back a checked-out connection; `Some` means the caller must close it
    fn check_in(self: &Arc<Self>, conn: Connection) -> Result<Option<Connection>> {
        let mut state = self.state.lock();

        if !state.checked_out.remove(&conn.id()) {
            let reason = if state.idle.iter().any(|c| c.id() == conn.id()) {
                "connection released twice"
            } else {
                "connection does not belong to this pool"
            };
            return Err(Error::ProtocolMisuse(format!("{} (id {})", reason, conn.id())));
        }

        if state.closed {
            state.active -= 1;
            state.record();
            return Ok(Some(conn));
        }

        if !conn.is_open() {
            tracing::debug!(connection = %conn.id(), "discarding closed connection");
            drop(state);
            self.release_slot();
            return Ok(None);
        }

        let mut conn = conn;
        loop {
            let Some(waiter) = state.next_waiter() else {
                state.idle.push(conn);
                state.record();
                return Ok(None);
            };

            state.checked_out.insert(conn.id());
            state.record();
            drop(state);

            match waiter.send(Ok(conn)) {
                Ok(()) => {
                    tracing::debug!("handed connection to waiter");
                    return Ok(None);
                }
                // Waiter gave up between the check and the send
                Err(Ok(returned)) => {
                    conn = returned;
                    state = self.state.lock();
                    state.checked_out.remove(&conn.id());
                }
                Err(Err(_)) => return Ok(None),
            }
        }
    }

    /// Give up one slot: transfer it to the earliest waiter, or free it
    fn release_slot(self: &Arc<Self>) {
        let mut state = self.state.lock();

        let waiter = if state.closed {
            None
        } else {
            state.next_waiter()
        };

        let Some(waiter) = waiter else {
            state.active -= 1;
            state.record();
            return;
        };
        state.record();
        drop(state);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!("opening replacement connection for waiter");
                handle.spawn(self.clone().connect_for(waiter));
            }
            Err(_) => {
                let _ = waiter.send(Err(Error::ConnectionClosed));
                let mut state = self.state.lock();
                state.active -= 1;
                state.record();
            }
        }
    }

    /// Open a connection on behalf of a waiter that inherited a slot
    async fn connect_for(self: Arc<Self>, waiter: Waiter) {
        let conn = match self.open_connection().await {
            Ok(conn) => conn,
            Err(e) => {
                let _ = waiter.send(Err(e));
                self.release_slot();
                return;
            }
        };

        let pool_closed = {
            let mut state = self.state.lock();
            if state.closed {
                state.active -= 1;
                state.record();
            } else {
                state.checked_out.insert(conn.id());
            }
            state.closed
        };
        if pool_closed {
            let _ = waiter.send(Err(Error::ConnectionClosed));
            conn.close().await;
            return;
        }

        if let Err(Ok(conn)) = waiter.send(Ok(conn)) {
            // Nobody is waiting any more; treat as released
            if let Ok(Some(conn)) = self.check_in(conn) {
                conn.close().await;
            }
        }
    }
}

/// Slot held while a new connection is being created
///
/// Dropped without `commit` (failed or cancelled connect), the slot is given back.
struct Reservation {
    inner: Option<Arc<PoolInner>>,
}

impl Reservation {
    fn new(inner: &Arc<PoolInner>) -> Self {
        Self {
            inner: Some(inner.clone()),
        }
    }

    /// Register the new connection as checked out; `Err` if the pool closed meanwhile
    fn commit(mut self, conn: Connection) -> std::result::Result<Connection, Connection> {
        let Some(inner) = self.inner.take() else {
            return Err(conn);
        };
        let mut state = inner.state.lock();
        if state.closed {
            state.active -= 1;
            state.record();
            return Err(conn);
        }
        state.checked_out.insert(conn.id());
        Ok(conn)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.release_slot();
        }
    }
}

/// Receiving end of a queued `acquire()`
///
/// Dropped after a connection was handed over but before it was collected, the
/// connection is checked back in.
struct Waiting {
    rx: oneshot::Receiver<Result<Connection>>,
    inner: Arc<PoolInner>,
}

impl Drop for Waiting {
    fn drop(&mut self) {
        self.rx.close();
        if let Ok(Ok(conn)) = self.rx.try_recv() {
            tracing::debug!(connection = %conn.id(), "waiter gone, returning connection");
            // Some(_) only after pool close; dropping the last handle closes it
            if let Err(e) = self.inner.check_in(conn) {
                tracing::warn!(error = %e, "failed to return uncollected connection");
            }
        }
    }
}
