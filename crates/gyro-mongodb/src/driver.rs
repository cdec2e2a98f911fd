//! Driver abstraction
//!
//! The client never talks to the wire itself. A [`Driver`] opens database
//! connections, a [`DriverDatabase`] hands out collection handles and reports
//! lifecycle notices, and a [`DriverCollection`] runs the raw operations.
//!
//! Options arrive as documents: the client layers its own defaults on top of
//! what the caller passed and leaves every key it does not understand for the
//! driver to interpret.
//!
//! [`MongoDriver`](crate::mongo_driver::MongoDriver) is the production
//! implementation backed by the `mongodb` crate.

use async_trait::async_trait;
use bson::{Bson, Document};
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::Result;

/// Lifecycle notice reported by an open connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverNotice {
    /// The connection to the server was lost
    Close,
    /// The server became reachable again on the same connection
    Reconnect,
}

/// Opens connections to a deployment
#[async_trait]
pub trait Driver: Send + Sync {
    /// Establish a connection to `address`, passing `options` through untouched
    async fn connect(&self, address: &str, options: &Document) -> Result<Arc<dyn DriverDatabase>>;
}

/// An open connection to a database
pub trait DriverDatabase: Send + Sync {
    /// Handle for the collection called `name`
    fn collection(&self, name: &str) -> Arc<dyn DriverCollection>;

    /// Subscribe to lifecycle notices of this connection
    fn notices(&self) -> broadcast::Receiver<DriverNotice>;
}

/// Documents yielded by an open cursor
pub type DocumentStream = BoxStream<'static, Result<Document>>;

/// Cursor parameters shared by `find` and `count`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CursorRequest {
    pub filter: Document,
    /// Fields to return, taken out of the caller's `fields` option
    pub projection: Option<Document>,
    /// Remaining cursor options (`sort`, `limit`, `skip`, ...)
    pub options: Document,
}

/// Raw operations on one collection
#[async_trait]
pub trait DriverCollection: Send + Sync {
    /// Name of the collection
    fn name(&self) -> &str;

    /// Open a cursor; documents are yielded as the server returns them
    async fn find_stream(&self, request: CursorRequest) -> Result<DocumentStream>;

    /// Number of documents the cursor would yield
    async fn count(&self, request: CursorRequest) -> Result<u64>;

    async fn find_one(&self, filter: Document) -> Result<Option<Document>>;

    /// Insert `documents`, returning them as stored (with `_id` assigned)
    async fn insert(&self, documents: Vec<Document>, options: Document) -> Result<Vec<Document>>;

    /// Update matching documents, returning the server's update result
    async fn update(&self, filter: Document, update: Document, options: Document) -> Result<Document>;

    /// Find, modify and return one document
    ///
    /// Resolves to the document (if any) and the raw update information.
    async fn find_and_modify(
        &self,
        filter: Document,
        sort: Document,
        update: Document,
        options: Document,
    ) -> Result<(Option<Document>, Document)>;

    /// Remove matching documents, returning how many were removed
    async fn remove(&self, filter: Document, options: Document) -> Result<u64>;

    /// Run an aggregation pipeline; `None` options are omitted from the call
    async fn aggregate(&self, pipeline: Vec<Document>, options: Option<Document>) -> Result<Vec<Document>>;

    /// Create an index on `keys` unless it already exists
    async fn ensure_index(&self, keys: Document, options: Document) -> Result<()>;

    /// Drop every index except `_id`
    async fn drop_indexes(&self) -> Result<bool>;
}

/// Read a numeric reply field as a count
pub(crate) fn as_count(value: Option<&Bson>) -> u64 {
    match value {
        Some(Bson::Int32(n)) => u64::try_from(*n).unwrap_or(0),
        Some(Bson::Int64(n)) => u64::try_from(*n).unwrap_or(0),
        Some(Bson::Double(n)) if *n >= 0.0 => *n as u64,
        _ => 0,
    }
}

/// Read an option flag the way loosely typed callers write it: `true`, `1`, `1.0`
pub(crate) fn flag(value: Option<&Bson>) -> bool {
    match value {
        Some(Bson::Boolean(b)) => *b,
        Some(Bson::Int32(n)) => *n != 0,
        Some(Bson::Int64(n)) => *n != 0,
        Some(Bson::Double(n)) => *n != 0.0,
        _ => false,
    }
}
