//! [`Driver`] implementation backed by the official `mongodb` crate
//!
//! Operations are issued as database commands built from the option documents
//! the client layer prepares, so option keys this module does not know about
//! reach the server untouched. The acknowledgement keys (`safe`, `w`, `j`,
//! `wtimeout`) are folded into a `writeConcern` sub-document.
//!
//! Connection loss is detected from SDAM heartbeats, tracked per server: the
//! connection is reported lost ([`DriverNotice::Close`]) once no server of the
//! topology answers, and back ([`DriverNotice::Reconnect`]) as soon as one does.

use async_trait::async_trait;
use bson::{doc, oid::ObjectId, Bson, Document};
use futures::{StreamExt, TryStreamExt};
use mongodb::event::sdam::SdamEvent;
use mongodb::event::EventHandler;
use mongodb::options::ClientOptions;
use mongodb::{Client, Database};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use gyro_common::error::DUPLICATE_KEY_CODE;
use gyro_common::GyroError;

use crate::driver::{
    as_count, flag, CursorRequest, DocumentStream, Driver, DriverCollection, DriverDatabase, DriverNotice,
};
use crate::Result;

/// Database used when the connection string does not name one
pub const DEFAULT_DATABASE: &str = "test";

const NOTICE_CAPACITY: usize = 16;

/// Connection pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Minimum number of connections in the pool (default: 0)
    pub min_pool_size: Option<u32>,
    /// Maximum number of connections in the pool (default: 10)
    pub max_pool_size: Option<u32>,
    /// Maximum time a connection can remain idle before being closed (default: none)
    pub max_idle_time: Option<Duration>,
    /// Connection timeout (default: 10s)
    pub connect_timeout: Option<Duration>,
    /// Server selection timeout; bounds how long a connect attempt can take
    pub server_selection_timeout: Option<Duration>,
    /// Application name for server logs
    pub app_name: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_pool_size: None,
            max_pool_size: Some(10),
            max_idle_time: None,
            connect_timeout: Some(Duration::from_secs(10)),
            server_selection_timeout: Some(Duration::from_secs(10)),
            app_name: Some("gyro".to_string()),
        }
    }
}

impl PoolConfig {
    /// Apply on top of parsed options; settings from the connection string win
    fn apply(&self, options: &mut ClientOptions) {
        if options.min_pool_size.is_none() {
            options.min_pool_size = self.min_pool_size;
        }
        if options.max_pool_size.is_none() {
            options.max_pool_size = self.max_pool_size;
        }
        if options.max_idle_time.is_none() {
            options.max_idle_time = self.max_idle_time;
        }
        if options.connect_timeout.is_none() {
            options.connect_timeout = self.connect_timeout;
        }
        if options.server_selection_timeout.is_none() {
            options.server_selection_timeout = self.server_selection_timeout;
        }
        if options.app_name.is_none() {
            options.app_name = self.app_name.clone();
        }
    }
}

/// Driver that connects through the `mongodb` crate
#[derive(Debug, Clone, Default)]
pub struct MongoDriver {
    pool: PoolConfig,
}

impl MongoDriver {
    /// Create a driver with default pool settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a driver with custom pool configuration
    pub fn with_pool(pool: PoolConfig) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Driver for MongoDriver {
    async fn connect(&self, address: &str, options: &Document) -> Result<Arc<dyn DriverDatabase>> {
        let uri = connection_uri(address, options);
        let mut client_options = ClientOptions::parse(&uri).await.map_err(connection_error)?;
        self.pool.apply(&mut client_options);

        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        client_options.sdam_event_handler = Some(heartbeat_handler(notices.clone()));

        let client = Client::with_options(client_options).map_err(connection_error)?;
        let database = client
            .default_database()
            .unwrap_or_else(|| client.database(DEFAULT_DATABASE));

        // Clients connect lazily; ping so that an unreachable server fails here.
        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(connection_error)?;

        tracing::debug!(database = %database.name(), "mongodb client ready");
        Ok(Arc::new(MongoDatabase {
            _client: client,
            database,
            notices,
        }))
    }
}

fn connection_error(err: mongodb::error::Error) -> GyroError {
    GyroError::Connection(err.to_string())
}

/// Append driver options to the connection string as URI options
fn connection_uri(address: &str, options: &Document) -> String {
    let mut params = Vec::new();
    for (key, value) in options {
        let rendered = match value {
            Bson::String(s) => s.clone(),
            Bson::Boolean(b) => b.to_string(),
            Bson::Int32(n) => n.to_string(),
            Bson::Int64(n) => n.to_string(),
            Bson::Double(n) => n.to_string(),
            other => {
                tracing::debug!(option = %key, value = %other, "skipping non-scalar driver option");
                continue;
            }
        };
        params.push(format!("{}={}", urlencoding::encode(key), urlencoding::encode(&rendered)));
    }

    if params.is_empty() {
        return address.to_string();
    }

    let separator = if address.contains('?') {
        "&"
    } else {
        let after_scheme = address.split_once("://").map_or(address, |(_, rest)| rest);
        if after_scheme.contains('/') {
            "?"
        } else {
            "/?"
        }
    };
    format!("{}{}{}", address, separator, params.join("&"))
}

/// Reachability of the servers of one topology, fed by heartbeats
#[derive(Debug, Default)]
struct HeartbeatTracker {
    healthy: HashSet<String>,
    lost: bool,
}

impl HeartbeatTracker {
    fn succeeded(&mut self, server: String) -> Option<DriverNotice> {
        self.healthy.insert(server);
        if self.lost {
            self.lost = false;
            return Some(DriverNotice::Reconnect);
        }
        None
    }

    /// A failure only counts once it takes out the last healthy server
    fn failed(&mut self, server: &str) -> Option<DriverNotice> {
        if self.healthy.remove(server) && self.healthy.is_empty() && !self.lost {
            self.lost = true;
            return Some(DriverNotice::Close);
        }
        None
    }
}

fn heartbeat_handler(notices: broadcast::Sender<DriverNotice>) -> EventHandler<SdamEvent> {
    let tracker = Mutex::new(HeartbeatTracker::default());
    EventHandler::callback(move |event: SdamEvent| {
        let notice = match event {
            SdamEvent::ServerHeartbeatFailed(event) => tracker.lock().failed(&event.server_address.to_string()),
            SdamEvent::ServerHeartbeatSucceeded(event) => tracker.lock().succeeded(event.server_address.to_string()),
            _ => None,
        };
        if let Some(notice) = notice {
            tracing::debug!(?notice, "mongodb topology reachability changed");
            let _ = notices.send(notice);
        }
    })
}

struct MongoDatabase {
    // Keeps the client's background monitoring alive for the connection's lifetime
    _client: Client,
    database: Database,
    notices: broadcast::Sender<DriverNotice>,
}

impl DriverDatabase for MongoDatabase {
    fn collection(&self, name: &str) -> Arc<dyn DriverCollection> {
        Arc::new(MongoCollection {
            database: self.database.clone(),
            name: name.to_string(),
        })
    }

    fn notices(&self) -> broadcast::Receiver<DriverNotice> {
        self.notices.subscribe()
    }
}

struct MongoCollection {
    database: Database,
    name: String,
}

impl MongoCollection {
    async fn command(&self, command: Document) -> Result<Document> {
        let reply = self.database.run_command(command).await?;
        check_write_reply(&reply)?;
        Ok(reply)
    }

    async fn cursor(&self, command: Document) -> Result<Vec<Document>> {
        let cursor = self.database.run_cursor_command(command).await?;
        Ok(cursor.try_collect().await?)
    }
}

#[async_trait]
impl DriverCollection for MongoCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn find_stream(&self, request: CursorRequest) -> Result<DocumentStream> {
        let mut command = doc! { "find": self.name.as_str(), "filter": request.filter };
        if let Some(projection) = request.projection {
            command.insert("projection", projection);
        }
        command.extend(request.options);
        let cursor = self.database.run_cursor_command(command).await?;
        Ok(cursor.map_err(GyroError::from).boxed())
    }

    async fn count(&self, request: CursorRequest) -> Result<u64> {
        let mut command = doc! { "count": self.name.as_str(), "query": request.filter };
        for (key, value) in request.options {
            // count takes limit/skip/hint but has no use for ordering
            if key != "sort" {
                command.insert(key, value);
            }
        }
        let reply = self.command(command).await?;
        Ok(as_count(reply.get("n")))
    }

    async fn find_one(&self, filter: Document) -> Result<Option<Document>> {
        let command = doc! { "find": self.name.as_str(), "filter": filter, "limit": 1, "singleBatch": true };
        Ok(self.cursor(command).await?.into_iter().next())
    }

    async fn insert(&self, mut documents: Vec<Document>, options: Document) -> Result<Vec<Document>> {
        for document in documents.iter_mut() {
            if !document.contains_key("_id") {
                // Keep _id first, as the server would
                let mut with_id = doc! { "_id": ObjectId::new() };
                with_id.extend(std::mem::take(document));
                *document = with_id;
            }
        }

        let mut command = doc! { "insert": self.name.as_str(), "documents": documents.clone() };
        command.extend(write_options(options));
        self.command(command).await?;
        Ok(documents)
    }

    async fn update(&self, filter: Document, update: Document, mut options: Document) -> Result<Document> {
        let upsert = take_bool(&mut options, "upsert");
        let multi = take_bool(&mut options, "multi");

        let mut command = doc! {
            "update": self.name.as_str(),
            "updates": [{ "q": filter, "u": update, "upsert": upsert, "multi": multi }],
        };
        command.extend(write_options(options));
        self.command(command).await
    }

    async fn find_and_modify(
        &self,
        filter: Document,
        sort: Document,
        update: Document,
        mut options: Document,
    ) -> Result<(Option<Document>, Document)> {
        // `multi` only shapes the client-side result; the command rejects it
        options.remove("multi");
        for key in ["new", "upsert", "remove"] {
            if let Some(value) = options.remove(key) {
                options.insert(key, flag(Some(&value)));
            }
        }

        let mut command = doc! { "findAndModify": self.name.as_str(), "query": filter, "update": update };
        if !sort.is_empty() {
            command.insert("sort", sort);
        }
        command.extend(write_options(options));

        let mut reply = self.command(command).await?;
        let value = match reply.remove("value") {
            Some(Bson::Document(document)) => Some(document),
            _ => None,
        };
        Ok((value, reply))
    }

    async fn remove(&self, filter: Document, mut options: Document) -> Result<u64> {
        let single = take_bool(&mut options, "single") || take_bool(&mut options, "justOne");
        let limit = if single { 1 } else { 0 };
        let mut command = doc! {
            "delete": self.name.as_str(),
            "deletes": [{ "q": filter, "limit": limit }],
        };
        command.extend(write_options(options));
        let reply = self.command(command).await?;
        Ok(as_count(reply.get("n")))
    }

    async fn aggregate(&self, pipeline: Vec<Document>, options: Option<Document>) -> Result<Vec<Document>> {
        let mut command = doc! { "aggregate": self.name.as_str(), "pipeline": pipeline, "cursor": {} };
        if let Some(options) = options {
            command.extend(options);
        }
        self.cursor(command).await
    }

    async fn ensure_index(&self, keys: Document, options: Document) -> Result<()> {
        let mut index = doc! { "name": index_name(&keys), "key": keys };
        index.extend(options);
        self.command(doc! { "createIndexes": self.name.as_str(), "indexes": [index] }).await?;
        Ok(())
    }

    async fn drop_indexes(&self) -> Result<bool> {
        let reply = self.command(doc! { "dropIndexes": self.name.as_str(), "index": "*" }).await?;
        Ok(reply.get("ok").map(|ok| as_count(Some(ok)) == 1).unwrap_or(false))
    }
}

fn take_bool(options: &mut Document, key: &str) -> bool {
    flag(options.remove(key).as_ref())
}

/// Fold acknowledgement keys into a `writeConcern`; other keys are kept as-is
fn write_options(mut options: Document) -> Document {
    let mut concern = Document::new();
    if let Some(safe) = options.remove("safe") {
        concern.insert("w", if flag(Some(&safe)) { 1 } else { 0 });
    }
    for (key, target) in [("w", "w"), ("j", "j"), ("wtimeout", "wtimeout"), ("wtimeoutMS", "wtimeout")] {
        if let Some(value) = options.remove(key) {
            concern.insert(target, value);
        }
    }
    if !concern.is_empty() && !options.contains_key("writeConcern") {
        options.insert("writeConcern", concern);
    }
    options
}

/// Server's default index name: `field_direction` pairs joined by `_`
fn index_name(keys: &Document) -> String {
    keys.iter()
        .map(|(field, direction)| match direction {
            Bson::String(kind) => format!("{}_{}", field, kind),
            Bson::Int32(n) => format!("{}_{}", field, n),
            Bson::Int64(n) => format!("{}_{}", field, n),
            Bson::Double(n) => format!("{}_{}", field, n),
            other => format!("{}_{}", field, other),
        })
        .collect::<Vec<_>>()
        .join("_")
}

/// Turn `writeErrors` / `writeConcernError` in a command reply into an error
fn check_write_reply(reply: &Document) -> Result<()> {
    if let Ok(errors) = reply.get_array("writeErrors") {
        if let Some(Bson::Document(first)) = errors.first() {
            let code = first.get_i32("code").unwrap_or_default();
            let message = first.get_str("errmsg").unwrap_or("write error").to_string();
            return Err(if code == DUPLICATE_KEY_CODE {
                GyroError::Conflict(message)
            } else {
                GyroError::MongoDB(format!("{} (code {})", message, code))
            });
        }
    }
    if let Ok(concern_error) = reply.get_document("writeConcernError") {
        let message = concern_error.get_str("errmsg").unwrap_or("write concern error");
        return Err(GyroError::MongoDB(message.to_string()));
    }
    Ok(())
}
