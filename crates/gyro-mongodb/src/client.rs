//! Client façade
//!
//! [`Mongo`] is the entry point of the crate. It owns one
//! [`ConnectionManager`] and exposes the operations in
//! [`operations`](crate::operations). Clones share the same connection.

use bson::Document;
use std::sync::Arc;

use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::driver::{Driver, DriverCollection};
use crate::events::EventBus;
use crate::mongo_driver::MongoDriver;
use crate::Result;

/// MongoDB client with automatic reconnection
#[derive(Debug, Clone)]
pub struct Mongo {
    manager: ConnectionManager,
}

impl Default for Mongo {
    fn default() -> Self {
        Self::new()
    }
}

impl Mongo {
    /// Client for `mongodb://localhost:27017` with default options
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    /// Client for `url` with default options
    pub fn with_url(url: impl Into<String>) -> Self {
        Self::with_config(ClientConfig::new(url))
    }

    /// Client for `url` with an options document (`reconnectTimeout` plus driver options)
    pub fn with_options(url: impl Into<String>, options: Document) -> Result<Self> {
        Ok(Self::with_config(ClientConfig::from_options(url, options)?))
    }

    /// Client backed by the `mongodb` crate
    pub fn with_config(config: ClientConfig) -> Self {
        Self::with_driver(config, Arc::new(MongoDriver::new()))
    }

    /// Client backed by a custom driver
    pub fn with_driver(config: ClientConfig, driver: Arc<dyn Driver>) -> Self {
        Self {
            manager: ConnectionManager::new(config, driver),
        }
    }

    /// Address the client connects to
    pub fn url(&self) -> &str {
        &self.manager.config().address
    }

    pub fn config(&self) -> &ClientConfig {
        self.manager.config()
    }

    /// Lifecycle event registry (`connect`, `close`, `reconnect`, `error`)
    pub fn events(&self) -> &EventBus {
        self.manager.events()
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Establish the connection ahead of the first operation
    pub async fn connect(&self) -> Result<()> {
        self.manager.connect().await.map(|_| ())
    }

    /// Handle for the collection called `name`, connecting first if needed
    pub async fn collection(&self, name: &str) -> Result<Collection> {
        let database = self.manager.connect().await?;
        Ok(Collection {
            inner: database.collection(name),
        })
    }
}

/// Driver handle scoped to one collection
#[derive(Clone)]
pub struct Collection {
    inner: Arc<dyn DriverCollection>,
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection").field("name", &self.name()).finish()
    }
}

impl Collection {
    /// Name of the collection
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Raw driver operations, without casting or default options
    pub fn driver(&self) -> &dyn DriverCollection {
        self.inner.as_ref()
    }
}
