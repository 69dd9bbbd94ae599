//! Wiring of the coordination stack over one database.

use std::sync::Arc;

use common::{DatabaseConfig, MigrationConfig};

use crate::client::{QueryExecutor, TransactionalClient};
use crate::connector::MySqlConnector;
use crate::error::{with_cleanup, Error, Result};
use crate::lock::LockFactory;
use crate::lockable::LockableUnitOfWorkFactory;
use crate::migrator::Migrator;
use crate::pool::ConnectionPool;
use crate::scope::OperationScope;
use crate::unit_of_work::{CompletionObserver, TracingObserver, UnitOfWorkFactory};

/// Connection pool, unit of work, lock and migration factories sharing one
/// database.
#[derive(Clone)]
pub struct Database {
    connector: Option<Arc<MySqlConnector>>,
    pool: ConnectionPool,
    units: UnitOfWorkFactory,
    locks: LockFactory,
    lockable: LockableUnitOfWorkFactory,
}

impl Database {
    /// Connect to MySQL and build the stack with the [`TracingObserver`].
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        Self::connect_with_observer(config, Arc::new(TracingObserver)).await
    }

    pub async fn connect_with_observer(
        config: &DatabaseConfig,
        observer: Arc<dyn CompletionObserver>,
    ) -> Result<Self> {
        let connector = MySqlConnector::open(config).await?;
        let client = connector.client();
        Ok(Self::build(Some(Arc::new(connector)), client, observer))
    }

    /// Build the stack over any driver.
    pub fn from_client(client: Arc<dyn TransactionalClient>) -> Self {
        Self::build(None, client, Arc::new(TracingObserver))
    }

    pub fn from_client_with_observer(
        client: Arc<dyn TransactionalClient>,
        observer: Arc<dyn CompletionObserver>,
    ) -> Self {
        Self::build(None, client, observer)
    }

    fn build(
        connector: Option<Arc<MySqlConnector>>,
        client: Arc<dyn TransactionalClient>,
        observer: Arc<dyn CompletionObserver>,
    ) -> Self {
        let pool = ConnectionPool::new(client);
        let units = UnitOfWorkFactory::with_observer(pool.clone(), observer);
        let locks = LockFactory::new(pool.clone());
        let lockable = LockableUnitOfWorkFactory::new(locks.clone(), units.clone());
        Self {
            connector,
            pool,
            units,
            locks,
            lockable,
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn units(&self) -> &UnitOfWorkFactory {
        &self.units
    }

    pub fn locks(&self) -> &LockFactory {
        &self.locks
    }

    pub fn lockable(&self) -> &LockableUnitOfWorkFactory {
        &self.lockable
    }

    /// The MySQL connector, when connected through [`Database::connect`].
    pub fn connector(&self) -> Option<&MySqlConnector> {
        self.connector.as_deref()
    }

    pub fn migrator(&self, config: MigrationConfig) -> Migrator {
        Migrator::new(self.lockable.clone(), config)
    }

    /// Check connectivity with a round trip on a fresh session.
    pub async fn ping(&self) -> Result<()> {
        if let Some(connector) = &self.connector {
            return connector.ping().await;
        }

        let conn = self.pool.acquire(&OperationScope::new()).await?;
        let result = conn
            .query_one("SELECT 1", &[])
            .await
            .map(|_| ())
            .map_err(|e| Error::database("ping database", e));
        let release = conn.release().await;
        with_cleanup(result, release)
    }

    /// Close the MySQL handle once no other clone holds it.
    pub async fn close(self) -> Result<()> {
        let Some(connector) = self.connector else {
            return Ok(());
        };
        match Arc::try_unwrap(connector) {
            Ok(connector) => connector.close().await,
            Err(_) => {
                tracing::debug!("Database handle still shared; leaving it open");
                Ok(())
            }
        }
    }
}
