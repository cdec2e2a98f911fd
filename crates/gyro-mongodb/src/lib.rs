//! Resilient MongoDB access layer
//!
//! This crate wraps a MongoDB connection behind a small client that keeps
//! itself connected and speaks in application-friendly documents.
//!
//! # Features
//! - Lazy connection with a single in-flight attempt shared by every caller
//! - Automatic reconnection at a fixed delay, with lifecycle events
//! - ObjectId casting: 24-character hex strings in, hex strings out
//! - Every operation is a future; completion handlers attach with `on_complete`
//! - Pluggable driver layer, with a `mongodb` crate implementation

pub mod client;
pub mod codec;
pub mod completion;
pub mod config;
pub mod connection;
pub mod driver;
pub mod events;
pub mod mongo_driver;
pub mod operations;
pub mod query;

pub use client::{Collection, Mongo};
pub use codec::{cast, cast_all, cast_value, is_valid_object_id, new_id, uncast, uncast_all, uncast_value};
pub use completion::{settle, Completion, Deferred};
pub use config::ClientConfig;
pub use connection::{ConnectionManager, ConnectionState};
pub use driver::{CursorRequest, DocumentStream, Driver, DriverCollection, DriverDatabase, DriverNotice};
pub use events::{ConnectionEvent, EventBus, EventKind, EventListener, ListenerId};
pub use gyro_common::{GyroError, Result};
pub use mongo_driver::{MongoDriver, PoolConfig};
pub use operations::{IndexSpec, Modified};
pub use query::FindOptions;
