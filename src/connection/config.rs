//! Connection configuration

use super::tls::{SslMode, TlsConfig};
use crate::sanitize::Dialect;
use crate::{Error, Result};
use std::time::Duration;

/// Default server port
pub const DEFAULT_PORT: u16 = 5432;

/// Default bound on the startup handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default inactivity period before a ready connection closes itself
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Default pool capacity
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;

/// Connection configuration
///
/// Immutable once built. Use [`ConnectionConfig::builder`] or
/// [`ConnectionConfig::from_url`].
#[derive(Clone)]
pub struct ConnectionConfig {
    host: String,
    port: u16,
    user: String,
    password: Option<String>,
    database: String,
    sslmode: SslMode,
    tls: Option<TlsConfig>,
    connect_timeout: Duration,
    query_timeout: Duration,
    idle_timeout: Duration,
    max_connections: usize,
    pooling: bool,
    dialect: Dialect,
    application_name: Option<String>,
}

impl ConnectionConfig {
    /// Create a builder
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let config = ConnectionConfig::builder("db.internal", "orders", "app")
    ///     .password("secret")
    ///     .sslmode(SslMode::Required)
    ///     .query_timeout(Duration::from_secs(2))
    ///     .build()?;
    /// ```
    pub fn builder(
        host: impl Into<String>,
        database: impl Into<String>,
        user: impl Into<String>,
    ) -> ConnectionConfigBuilder {
        ConnectionConfigBuilder {
            host: host.into(),
            port: DEFAULT_PORT,
            user: user.into(),
            password: None,
            database: database.into(),
            sslmode: SslMode::default(),
            sslmode_str: None,
            tls: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            query_timeout: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            pooling: true,
            dialect: Dialect::default(),
            application_name: None,
        }
    }

    /// Server host name or address
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Server port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// User name sent at startup
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Password answered to a cleartext challenge
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Database name sent at startup
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Channel security mode
    pub fn sslmode(&self) -> SslMode {
        self.sslmode
    }

    /// TLS options; present exactly when the ssl mode is not `none`
    pub fn tls(&self) -> Option<&TlsConfig> {
        self.tls.as_ref()
    }

    /// Bound on opening the channel plus the startup handshake
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Bound on a single query
    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    /// Inactivity period before a ready connection closes itself
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Pool capacity
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Whether the adapter shares a pool or a single connection
    pub fn pooling(&self) -> bool {
        self.pooling
    }

    /// Placeholder dialect used by `prepared`
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Application name sent at startup
    pub fn application_name(&self) -> Option<&str> {
        self.application_name.as_deref()
    }

    /// Check the invariants `build()` establishes
    pub(crate) fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Config("host must not be empty".into()));
        }
        if self.user.is_empty() {
            return Err(Error::Config("user must not be empty".into()));
        }
        if self.database.is_empty() {
            return Err(Error::Config("database must not be empty".into()));
        }
        if self.port == 0 {
            return Err(Error::Config("port must not be 0".into()));
        }
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be at least 1".into()));
        }
        for (name, value) in [
            ("connect_timeout", self.connect_timeout),
            ("query_timeout", self.query_timeout),
            ("idle_timeout", self.idle_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::Config(format!("{} must be greater than zero", name)));
            }
        }
        if self.sslmode.is_secure() != self.tls.is_some() {
            return Err(Error::Config(format!(
                "sslmode={} does not match the TLS options",
                self.sslmode
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .field("sslmode", &self.sslmode)
            .field("connect_timeout", &self.connect_timeout)
            .field("query_timeout", &self.query_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_connections", &self.max_connections)
            .field("pooling", &self.pooling)
            .field("dialect", &self.dialect)
            .field("application_name", &self.application_name)
            .finish()
    }
}

/// Builder for [`ConnectionConfig`]
#[derive(Debug, Clone)]
pub struct ConnectionConfigBuilder {
    host: String,
    port: u16,
    user: String,
    password: Option<String>,
    database: String,
    sslmode: SslMode,
    sslmode_str: Option<String>,
    tls: Option<TlsConfig>,
    connect_timeout: Duration,
    query_timeout: Option<Duration>,
    idle_timeout: Duration,
    max_connections: usize,
    pooling: bool,
    dialect: Dialect,
    application_name: Option<String>,
}

impl ConnectionConfigBuilder {
    /// Set the port
    ///
    /// Default: 5432
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the password
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the ssl mode
    ///
    /// Default: `none`
    pub fn sslmode(mut self, mode: SslMode) -> Self {
        self.sslmode = mode;
        self.sslmode_str = None;
        self
    }

    /// Set the ssl mode from text; anything but `none`, `true` or `required` fails
    /// in [`build`](Self::build).
    pub fn sslmode_str(mut self, mode: impl Into<String>) -> Self {
        self.sslmode_str = Some(mode.into());
        self
    }

    /// Use these TLS options instead of the ones implied by the ssl mode
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Set the connect timeout
    ///
    /// Default: 5000 ms
    pub fn connect_timeout(mut self, duration: Duration) -> Self {
        self.connect_timeout = duration;
        self
    }

    /// Set the query timeout
    ///
    /// Default: the connect timeout
    pub fn query_timeout(mut self, duration: Duration) -> Self {
        self.query_timeout = Some(duration);
        self
    }

    /// Set the idle timeout
    ///
    /// Default: 30000 ms
    pub fn idle_timeout(mut self, duration: Duration) -> Self {
        self.idle_timeout = duration;
        self
    }

    /// Set the pool capacity
    ///
    /// Default: 10
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Share a pool (`true`, default) or a single connection
    pub fn pooling(mut self, pooling: bool) -> Self {
        self.pooling = pooling;
        self
    }

    /// Set the placeholder dialect
    ///
    /// Default: positional
    pub fn dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    /// Set the application name sent at startup
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Validate and build the configuration
    ///
    /// # Errors
    ///
    /// `Error::Config` for an unknown ssl mode, an empty host, user or database,
    /// port 0, a zero timeout or capacity, or TLS options that cannot be built.
    pub fn build(self) -> Result<ConnectionConfig> {
        let sslmode = match &self.sslmode_str {
            Some(raw) => raw.parse::<SslMode>()?,
            None => self.sslmode,
        };

        let tls = match (sslmode.is_secure(), self.tls) {
            (false, _) => None,
            (true, Some(tls)) => Some(tls),
            (true, None) => TlsConfig::for_mode(sslmode)?,
        };

        let config = ConnectionConfig {
            host: self.host,
            port: self.port,
            user: self.user,
            password: self.password,
            database: self.database,
            sslmode,
            tls,
            connect_timeout: self.connect_timeout,
            query_timeout: self.query_timeout.unwrap_or(self.connect_timeout),
            idle_timeout: self.idle_timeout,
            max_connections: self.max_connections,
            pooling: self.pooling,
            dialect: self.dialect,
            application_name: self.application_name,
        };
        config.validate()?;
        Ok(config)
    }
}
