use crate::connection::{Config, ParseError};

const DEFAULT_POOL_SIZE: usize = 8;

/// Pool options: connection settings plus the connection cap.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub(crate) conn: Config,
    pub(crate) size: usize,
}

impl PoolConfig {
    /// Pool over `conn` with the default connection cap.
    pub fn new(conn: Config) -> Self {
        Self { conn, size: DEFAULT_POOL_SIZE }
    }

    /// Parse connection settings from url, see [`Config::parse`].
    pub fn parse(url: &str) -> Result<Self, ParseError> {
        Ok(Self::new(Config::parse(url)?))
    }

    /// Read connection settings from environment variables, see
    /// [`Config::from_env`].
    pub fn from_env() -> Self {
        Self::new(Config::from_env())
    }

    /// Cap the number of live connections. A zero size is bumped to one.
    pub fn size(mut self, size: usize) -> Self {
        self.size = size.max(1);
        self
    }
}

impl From<Config> for PoolConfig {
    fn from(conn: Config) -> Self {
        Self::new(conn)
    }
}
