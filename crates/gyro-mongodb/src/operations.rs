//! Collection operations
//!
//! Every operation connects (or joins the pending connection), casts
//! identifier strings in its inputs to ObjectIds, runs the raw driver call and
//! uncasts identifiers in the result. Write operations default to acknowledged
//! writes (`safe: true`); caller options override the defaults key by key and
//! any key this layer does not interpret is passed to the driver as-is.
//!
//! Failures are never retried. Besides being returned, operation failures are
//! emitted as `error` events; connection failures are reported by the
//! connection manager instead.
//!
//! # Example
//! ```rust,ignore
//! use bson::doc;
//! use gyro_mongodb::{Deferred, Mongo};
//!
//! let mongo = Mongo::with_url("mongodb://localhost:27017/app");
//! let user = mongo.insert("users", doc! { "name": "ada" }, None).await?;
//! let id = user.get_str("_id")?;
//!
//! mongo
//!     .find("users", doc! { "_id": id }, doc! { "fields": ["name"] })
//!     .on_complete(|outcome| tracing::debug!(ok = outcome.is_ok(), "lookup done"))
//!     .await?;
//! ```

use bson::{doc, Bson, Document};
use futures::{StreamExt, TryStreamExt};
use std::future::Future;

use gyro_common::GyroError;

use crate::client::{Collection, Mongo};
use crate::codec::{cast, cast_all, uncast, uncast_all};
use crate::driver::{flag, CursorRequest, DocumentStream};
use crate::events::ConnectionEvent;
use crate::Result;

/// Field incremented by [`Mongo::get_next_sequence`]
pub const SEQUENCE_FIELD: &str = "seq";

/// Result of [`Mongo::find_and_modify`]
#[derive(Debug, Clone, PartialEq)]
pub enum Modified {
    /// The modified document, or `None` when nothing matched
    One(Option<Document>),
    /// Returned instead of `One` when the `multi` option is set
    Many(Vec<Document>),
}

impl Modified {
    /// First document of the result, if any
    pub fn into_first(self) -> Option<Document> {
        match self {
            Modified::One(document) => document,
            Modified::Many(documents) => documents.into_iter().next(),
        }
    }

    /// All documents of the result
    pub fn into_vec(self) -> Vec<Document> {
        match self {
            Modified::One(document) => document.into_iter().collect(),
            Modified::Many(documents) => documents,
        }
    }
}

/// Keys of an index passed to [`Mongo::ensure_index`]
#[derive(Debug, Clone, PartialEq)]
pub enum IndexSpec {
    /// Ascending index on a single field
    Field(String),
    /// Full key document, e.g. `{ "a": 1, "b": -1 }`
    Keys(Document),
}

impl IndexSpec {
    pub fn into_keys(self) -> Document {
        match self {
            IndexSpec::Field(field) => {
                let mut keys = Document::new();
                keys.insert(field, 1);
                keys
            }
            IndexSpec::Keys(keys) => keys,
        }
    }
}

impl From<&str> for IndexSpec {
    fn from(field: &str) -> Self {
        IndexSpec::Field(field.to_string())
    }
}

impl From<String> for IndexSpec {
    fn from(field: String) -> Self {
        IndexSpec::Field(field)
    }
}

impl From<Document> for IndexSpec {
    fn from(keys: Document) -> Self {
        IndexSpec::Keys(keys)
    }
}

/// Layer caller options over `defaults`; caller keys win
fn with_defaults(defaults: Document, options: Option<Document>) -> Document {
    let mut merged = defaults;
    if let Some(options) = options {
        merged.extend(options);
    }
    merged
}

fn acknowledged() -> Document {
    doc! { "safe": true }
}

fn returning_new() -> Document {
    doc! { "new": true, "safe": true }
}

/// Split the `fields` option off into a projection
fn cursor_request(filter: Document, options: Option<Document>) -> Result<CursorRequest> {
    let mut options = options.unwrap_or_default();
    let projection = match options.remove("fields") {
        None | Some(Bson::Null) => None,
        Some(Bson::Document(fields)) => Some(fields),
        Some(Bson::Array(names)) => {
            let mut fields = Document::new();
            for name in names {
                match name {
                    Bson::String(name) => {
                        fields.insert(name, 1);
                    }
                    other => {
                        return Err(GyroError::Query(format!("field names must be strings, got {}", other)));
                    }
                }
            }
            Some(fields)
        }
        Some(other) => {
            return Err(GyroError::Query(format!(
                "fields must be a document or an array of names, got {}",
                other
            )))
        }
    };

    Ok(CursorRequest {
        filter,
        projection: projection.filter(|fields| !fields.is_empty()),
        options,
    })
}

fn sequence_value(document: &Document) -> Result<i64> {
    match document.get(SEQUENCE_FIELD) {
        Some(Bson::Int32(n)) => Ok(i64::from(*n)),
        Some(Bson::Int64(n)) => Ok(*n),
        Some(Bson::Double(n)) if n.fract() == 0.0 => Ok(*n as i64),
        Some(other) => Err(GyroError::Query(format!("{} is not an integer: {}", SEQUENCE_FIELD, other))),
        None => Err(GyroError::Query(format!("counter document has no {} field", SEQUENCE_FIELD))),
    }
}

impl Mongo {
    /// Connect, run `body` against the collection and report its failure
    async fn run<T, F, Fut>(&self, operation: &'static str, collection: &str, body: F) -> Result<T>
    where
        F: FnOnce(Collection) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        // Connection failures were already emitted by the manager.
        let handle = self.collection(collection).await?;
        tracing::debug!(collection, operation, "running operation");
        let outcome = body(handle).await;
        self.report(operation, collection, outcome)
    }

    fn report<T>(&self, operation: &'static str, collection: &str, outcome: Result<T>) -> Result<T> {
        if let Err(error) = &outcome {
            tracing::warn!(collection, operation, error = %error, "mongodb operation failed");
            self.events().emit(&ConnectionEvent::Error { error: error.clone() });
        }
        outcome
    }

    /// Every document matching `filter`
    ///
    /// `fields` (a projection document or an array of field names) selects the
    /// returned fields; `sort`, `limit`, `skip` and other cursor options pass through.
    pub async fn find(
        &self,
        collection: &str,
        filter: Document,
        options: impl Into<Option<Document>>,
    ) -> Result<Vec<Document>> {
        self.find_cursor(collection, filter, options).await?.try_collect().await
    }

    /// Documents matching `filter`, yielded as the server returns them
    ///
    /// Takes the same options as [`Mongo::find`]. A failure while iterating
    /// ends the stream with that error and is reported like any other
    /// operation failure.
    pub async fn find_cursor(
        &self,
        collection: &str,
        mut filter: Document,
        options: impl Into<Option<Document>>,
    ) -> Result<DocumentStream> {
        cast(&mut filter);
        let request = match cursor_request(filter, options.into()) {
            Ok(request) => request,
            Err(error) => return self.report("find", collection, Err(error)),
        };

        let cursor = self
            .run("find", collection, |handle| async move { handle.driver().find_stream(request).await })
            .await?;

        let mongo = self.clone();
        let name = collection.to_string();
        Ok(cursor
            .map(move |item| -> Result<Document> {
                let mut document = mongo.report("find", &name, item)?;
                uncast(&mut document);
                Ok(document)
            })
            .boxed())
    }

    /// First document matching `filter`
    pub async fn find_one(&self, collection: &str, mut filter: Document) -> Result<Option<Document>> {
        cast(&mut filter);
        let document = self
            .run("find_one", collection, |handle| async move { handle.driver().find_one(filter).await })
            .await?;
        Ok(document.map(|mut document| {
            uncast(&mut document);
            document
        }))
    }

    /// Number of documents `find` would return for the same arguments
    pub async fn count(&self, collection: &str, mut filter: Document, options: impl Into<Option<Document>>) -> Result<u64> {
        cast(&mut filter);
        let request = match cursor_request(filter, options.into()) {
            Ok(request) => request,
            Err(error) => return self.report("count", collection, Err(error)),
        };
        self.run("count", collection, |handle| async move { handle.driver().count(request).await })
            .await
    }

    /// Insert one document; resolves to it as stored, `_id` included
    pub async fn insert(
        &self,
        collection: &str,
        document: Document,
        options: impl Into<Option<Document>>,
    ) -> Result<Document> {
        let inserted = self.insert_many(collection, vec![document], options).await?;
        inserted
            .into_iter()
            .next()
            .ok_or_else(|| GyroError::Internal("driver returned no inserted document".to_string()))
    }

    /// Insert several documents in one call
    pub async fn insert_many(
        &self,
        collection: &str,
        mut documents: Vec<Document>,
        options: impl Into<Option<Document>>,
    ) -> Result<Vec<Document>> {
        cast_all(&mut documents);
        let options = with_defaults(acknowledged(), options.into());
        let mut inserted = self
            .run("insert", collection, |handle| async move {
                handle.driver().insert(documents, options).await
            })
            .await?;
        uncast_all(&mut inserted);
        Ok(inserted)
    }

    /// Update documents matching `filter`; honors `upsert` and `multi`
    ///
    /// Resolves to the server's update result (`n`, `nModified`, `upserted`, ...).
    pub async fn update(
        &self,
        collection: &str,
        mut filter: Document,
        mut update: Document,
        options: impl Into<Option<Document>>,
    ) -> Result<Document> {
        cast(&mut filter);
        cast(&mut update);
        let options = with_defaults(acknowledged(), options.into());
        let mut result = self
            .run("update", collection, |handle| async move {
                handle.driver().update(filter, update, options).await
            })
            .await?;
        uncast(&mut result);
        Ok(result)
    }

    /// Modify one document and resolve to its new version
    ///
    /// `sort` picks the document when several match. With `multi` set the
    /// result is [`Modified::Many`]. The driver's update information is dropped.
    pub async fn find_and_modify(
        &self,
        collection: &str,
        mut filter: Document,
        mut update: Document,
        options: impl Into<Option<Document>>,
    ) -> Result<Modified> {
        cast(&mut filter);
        cast(&mut update);
        let mut options = with_defaults(returning_new(), options.into());
        let sort = match options.remove("sort") {
            None | Some(Bson::Null) => Document::new(),
            Some(Bson::Document(sort)) => sort,
            Some(other) => {
                let error = GyroError::Query(format!("sort must be a document, got {}", other));
                return self.report("find_and_modify", collection, Err(error));
            }
        };
        let multi = flag(options.get("multi"));

        let (value, _info) = self
            .run("find_and_modify", collection, |handle| async move {
                handle.driver().find_and_modify(filter, sort, update, options).await
            })
            .await?;

        let value = value.map(|mut document| {
            uncast(&mut document);
            document
        });
        Ok(if multi {
            Modified::Many(value.into_iter().collect())
        } else {
            Modified::One(value)
        })
    }

    /// Remove documents matching `filter`; resolves to how many were removed
    pub async fn remove(&self, collection: &str, mut filter: Document, options: impl Into<Option<Document>>) -> Result<u64> {
        cast(&mut filter);
        let options = with_defaults(acknowledged(), options.into());
        self.run("remove", collection, |handle| async move {
            handle.driver().remove(filter, options).await
        })
        .await
    }

    /// Run an aggregation pipeline
    ///
    /// An empty options document is treated as no options at all.
    pub async fn aggregate(
        &self,
        collection: &str,
        mut pipeline: Vec<Document>,
        options: impl Into<Option<Document>>,
    ) -> Result<Vec<Document>> {
        cast_all(&mut pipeline);
        let options = options.into().filter(|options| !options.is_empty());
        let mut documents = self
            .run("aggregate", collection, |handle| async move {
                handle.driver().aggregate(pipeline, options).await
            })
            .await?;
        uncast_all(&mut documents);
        Ok(documents)
    }

    /// Increment the `seq` counter of the document matching `filter`
    ///
    /// Pass `{ "upsert": true }` to start a missing counter at 1.
    pub async fn get_next_sequence(
        &self,
        collection: &str,
        filter: Document,
        options: impl Into<Option<Document>>,
    ) -> Result<i64> {
        let options = with_defaults(returning_new(), options.into());
        let mut increment = Document::new();
        increment.insert(SEQUENCE_FIELD, 1);
        let update = doc! { "$inc": increment };
        let modified = self.find_and_modify(collection, filter, update, options).await?;

        let outcome = match modified.into_first() {
            Some(counter) => sequence_value(&counter),
            None => Err(GyroError::Query("no counter document matched".to_string())),
        };
        self.report("get_next_sequence", collection, outcome)
    }

    /// Create an index unless it exists; `options` may carry `unique`, `name`, ...
    pub async fn ensure_index(
        &self,
        collection: &str,
        index: impl Into<IndexSpec>,
        options: impl Into<Option<Document>>,
    ) -> Result<()> {
        let keys = index.into().into_keys();
        let options = options.into().unwrap_or_default();
        self.run("ensure_index", collection, |handle| async move {
            handle.driver().ensure_index(keys, options).await
        })
        .await
    }

    /// Drop every index of the collection except `_id`
    pub async fn drop_indexes(&self, collection: &str) -> Result<bool> {
        self.run("drop_indexes", collection, |handle| async move {
            handle.driver().drop_indexes().await
        })
        .await
    }

    /// Remove every document of the collection
    pub async fn erase_collection(&self, collection: &str) -> Result<u64> {
        self.remove(collection, Document::new(), None).await
    }
}
