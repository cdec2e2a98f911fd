//! In-memory driver shared by the integration tests
//!
//! Storage outlives individual connections, so data written before a close
//! notice is still there after reconnecting. Filters match on top-level
//! equality; updates understand `$set`, `$inc` and whole-document replacement;
//! the aggregation pipeline understands `$match`, `$sort` and `$group` with
//! `$sum`.

#![allow(dead_code)]

use async_trait::async_trait;
use bson::{doc, oid::ObjectId, Bson, Document};
use futures::StreamExt;
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use gyro_mongodb::{
    ClientConfig, CursorRequest, DocumentStream, Driver, DriverCollection, DriverDatabase, DriverNotice, GyroError,
    Mongo, Result,
};

pub const TEST_ADDRESS: &str = "mongodb://memory:27017/test-mongo-gyro";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Client over a fresh in-memory driver with a short reconnection delay
pub fn memory_client() -> (Mongo, MemoryDriver) {
    init_tracing();
    let driver = MemoryDriver::new();
    let config = ClientConfig::new(TEST_ADDRESS).with_reconnect_timeout(Duration::from_millis(20));
    let mongo = Mongo::with_driver(config, Arc::new(driver.clone()));
    (mongo, driver)
}

/// Poll `condition` until it holds or a second has passed
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[derive(Default)]
struct StoredCollection {
    documents: Vec<Document>,
    unique: Vec<Vec<String>>,
}

#[derive(Default)]
struct Shared {
    collections: Mutex<HashMap<String, StoredCollection>>,
    attempts: AtomicUsize,
    failures: AtomicUsize,
    connect_delay: Mutex<Duration>,
    notices: Mutex<Option<broadcast::Sender<DriverNotice>>>,
    last_aggregate_options: Mutex<Option<Option<Document>>>,
    operation_failures: AtomicUsize,
    cursor_failure_after: Mutex<Option<usize>>,
}

/// Test driver keeping every collection in memory
#[derive(Clone, Default)]
pub struct MemoryDriver {
    shared: Arc<Shared>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `count` connect attempts
    pub fn fail_next(&self, count: usize) {
        self.shared.failures.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` collection operations
    pub fn fail_operations(&self, count: usize) {
        self.shared.operation_failures.store(count, Ordering::SeqCst);
    }

    /// Break the next cursor after it has yielded `count` documents
    pub fn fail_cursor_after(&self, count: usize) {
        *self.shared.cursor_failure_after.lock() = Some(count);
    }

    /// Make every connect attempt take `delay`
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.shared.connect_delay.lock() = delay;
    }

    /// Number of connect attempts seen so far
    pub fn attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Report the current connection as lost
    pub fn close(&self) {
        self.notify(DriverNotice::Close);
    }

    /// Report the current connection as usable again
    pub fn restore(&self) {
        self.notify(DriverNotice::Reconnect);
    }

    fn notify(&self, notice: DriverNotice) {
        if let Some(sender) = self.shared.notices.lock().as_ref() {
            let _ = sender.send(notice);
        }
    }

    /// Snapshot of a collection's documents
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.shared
            .collections
            .lock()
            .get(collection)
            .map(|stored| stored.documents.clone())
            .unwrap_or_default()
    }

    /// Options of the last aggregate call; `None` if aggregate never ran
    pub fn last_aggregate_options(&self) -> Option<Option<Document>> {
        self.shared.last_aggregate_options.lock().clone()
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn connect(&self, _address: &str, _options: &Document) -> Result<Arc<dyn DriverDatabase>> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);

        let delay = *self.shared.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let refused = self
            .shared
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(GyroError::Connection("connection refused".to_string()));
        }

        let (sender, _) = broadcast::channel(8);
        *self.shared.notices.lock() = Some(sender.clone());
        Ok(Arc::new(MemoryDatabase {
            shared: self.shared.clone(),
            notices: sender,
        }))
    }
}

struct MemoryDatabase {
    shared: Arc<Shared>,
    notices: broadcast::Sender<DriverNotice>,
}

impl DriverDatabase for MemoryDatabase {
    fn collection(&self, name: &str) -> Arc<dyn DriverCollection> {
        Arc::new(MemoryCollection {
            shared: self.shared.clone(),
            name: name.to_string(),
        })
    }

    fn notices(&self) -> broadcast::Receiver<DriverNotice> {
        self.notices.subscribe()
    }
}

struct MemoryCollection {
    shared: Arc<Shared>,
    name: String,
}

impl MemoryCollection {
    fn check_failure(&self) -> Result<()> {
        let failed = self
            .shared
            .operation_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(GyroError::MongoDB("operation failed".to_string()));
        }
        Ok(())
    }

    fn with_collection<T>(&self, f: impl FnOnce(&mut StoredCollection) -> Result<T>) -> Result<T> {
        self.check_failure()?;
        let mut collections = self.shared.collections.lock();
        f(collections.entry(self.name.clone()).or_default())
    }
}

#[async_trait]
impl DriverCollection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn find_stream(&self, request: CursorRequest) -> Result<DocumentStream> {
        let found = self.with_collection(|stored| {
            let mut found: Vec<Document> = stored
                .documents
                .iter()
                .filter(|document| matches(document, &request.filter))
                .cloned()
                .collect();

            if let Ok(sort) = request.options.get_document("sort") {
                sort_documents(&mut found, sort);
            }
            let skip = request.options.get_i64("skip").or_else(|_| request.options.get_i32("skip").map(i64::from));
            if let Ok(skip) = skip {
                found = found.into_iter().skip(skip as usize).collect();
            }
            let limit = request.options.get_i64("limit").or_else(|_| request.options.get_i32("limit").map(i64::from));
            if let Ok(limit) = limit {
                if limit > 0 {
                    found.truncate(limit as usize);
                }
            }

            Ok(match &request.projection {
                Some(projection) => found.iter().map(|document| project(document, projection)).collect(),
                None => found,
            })
        })?;

        let items: Vec<Result<Document>> = match self.shared.cursor_failure_after.lock().take() {
            Some(count) => found
                .into_iter()
                .take(count)
                .map(Ok)
                .chain(std::iter::once(Err(GyroError::MongoDB("cursor killed".to_string()))))
                .collect(),
            None => found.into_iter().map(Ok).collect(),
        };
        Ok(futures::stream::iter(items).boxed())
    }

    async fn count(&self, request: CursorRequest) -> Result<u64> {
        self.with_collection(|stored| {
            Ok(stored
                .documents
                .iter()
                .filter(|document| matches(document, &request.filter))
                .count() as u64)
        })
    }

    async fn find_one(&self, filter: Document) -> Result<Option<Document>> {
        self.with_collection(|stored| Ok(stored.documents.iter().find(|document| matches(document, &filter)).cloned()))
    }

    async fn insert(&self, documents: Vec<Document>, _options: Document) -> Result<Vec<Document>> {
        self.with_collection(|stored| {
            let mut inserted = Vec::with_capacity(documents.len());
            for document in documents {
                let document = with_id(document);
                check_unique(stored, &document, None)?;
                stored.documents.push(document.clone());
                inserted.push(document);
            }
            Ok(inserted)
        })
    }

    async fn update(&self, filter: Document, update: Document, options: Document) -> Result<Document> {
        let upsert = truthy(options.get("upsert"));
        let multi = truthy(options.get("multi"));

        self.with_collection(|stored| {
            let mut modified = 0;
            let positions: Vec<usize> = stored
                .documents
                .iter()
                .enumerate()
                .filter(|(_, document)| matches(document, &filter))
                .map(|(position, _)| position)
                .take(if multi { usize::MAX } else { 1 })
                .collect();

            for &position in &positions {
                let updated = apply_update(&stored.documents[position], &update);
                check_unique(stored, &updated, Some(position))?;
                if updated != stored.documents[position] {
                    modified += 1;
                }
                stored.documents[position] = updated;
            }

            if positions.is_empty() && upsert {
                let created = with_id(apply_update(&seed(&filter), &update));
                check_unique(stored, &created, None)?;
                let id = created.get("_id").cloned().unwrap_or(Bson::Null);
                stored.documents.push(created);
                return Ok(doc! { "n": 1, "nModified": 0, "upserted": [{ "index": 0, "_id": id }], "ok": 1 });
            }

            Ok(doc! { "n": positions.len() as i32, "nModified": modified, "ok": 1 })
        })
    }

    async fn find_and_modify(
        &self,
        filter: Document,
        sort: Document,
        update: Document,
        options: Document,
    ) -> Result<(Option<Document>, Document)> {
        let upsert = truthy(options.get("upsert"));
        let return_new = truthy(options.get("new"));

        self.with_collection(|stored| {
            let mut candidates: Vec<(usize, Document)> = stored
                .documents
                .iter()
                .cloned()
                .enumerate()
                .filter(|(_, document)| matches(document, &filter))
                .collect();
            if !sort.is_empty() {
                candidates.sort_by(|(_, a), (_, b)| compare_by(a, b, &sort));
            }

            if let Some((position, original)) = candidates.into_iter().next() {
                let updated = apply_update(&original, &update);
                check_unique(stored, &updated, Some(position))?;
                stored.documents[position] = updated.clone();
                let info = doc! { "lastErrorObject": { "n": 1, "updatedExisting": true }, "ok": 1 };
                return Ok((Some(if return_new { updated } else { original }), info));
            }

            if upsert {
                let created = with_id(apply_update(&seed(&filter), &update));
                check_unique(stored, &created, None)?;
                stored.documents.push(created.clone());
                let info = doc! { "lastErrorObject": { "n": 1, "updatedExisting": false }, "ok": 1 };
                return Ok((return_new.then_some(created), info));
            }

            Ok((None, doc! { "lastErrorObject": { "n": 0, "updatedExisting": false }, "ok": 1 }))
        })
    }

    async fn remove(&self, filter: Document, options: Document) -> Result<u64> {
        let single = truthy(options.get("single")) || truthy(options.get("justOne"));
        self.with_collection(|stored| {
            let mut removed = 0;
            stored.documents.retain(|document| {
                if (single && removed > 0) || !matches(document, &filter) {
                    return true;
                }
                removed += 1;
                false
            });
            Ok(removed)
        })
    }

    async fn aggregate(&self, pipeline: Vec<Document>, options: Option<Document>) -> Result<Vec<Document>> {
        *self.shared.last_aggregate_options.lock() = Some(options);
        self.with_collection(|stored| {
            let mut documents = stored.documents.clone();
            for stage in &pipeline {
                if let Ok(filter) = stage.get_document("$match") {
                    documents.retain(|document| matches(document, filter));
                } else if let Ok(sort) = stage.get_document("$sort") {
                    sort_documents(&mut documents, sort);
                } else if let Ok(group) = stage.get_document("$group") {
                    documents = group_documents(&documents, group);
                } else {
                    return Err(GyroError::Query(format!("unsupported stage {}", stage)));
                }
            }
            Ok(documents)
        })
    }

    async fn ensure_index(&self, keys: Document, options: Document) -> Result<()> {
        self.with_collection(|stored| {
            if options.get_bool("unique").unwrap_or(false) {
                let fields: Vec<String> = keys.keys().cloned().collect();
                if !stored.unique.contains(&fields) {
                    stored.unique.push(fields);
                }
            }
            Ok(())
        })
    }

    async fn drop_indexes(&self) -> Result<bool> {
        self.with_collection(|stored| {
            stored.unique.clear();
            Ok(true)
        })
    }
}

fn matches(document: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, expected)| match expected {
        Bson::Document(condition) if condition.keys().any(|k| k.starts_with('$')) => {
            let actual = document.get(key);
            condition.iter().all(|(op, operand)| match op.as_str() {
                "$in" => match operand {
                    Bson::Array(values) => actual.map_or(false, |actual| values.contains(actual)),
                    _ => false,
                },
                "$ne" => actual != Some(operand),
                "$gt" => actual.map_or(false, |a| compare(a, operand) == CmpOrdering::Greater),
                "$gte" => actual.map_or(false, |a| compare(a, operand) != CmpOrdering::Less),
                "$lt" => actual.map_or(false, |a| compare(a, operand) == CmpOrdering::Less),
                "$lte" => actual.map_or(false, |a| compare(a, operand) != CmpOrdering::Greater),
                _ => false,
            })
        }
        _ => document.get(key) == Some(expected),
    })
}

/// Boolean option as the server reads it: non-zero numbers count as true
fn truthy(value: Option<&Bson>) -> bool {
    match value {
        Some(Bson::Boolean(b)) => *b,
        Some(other) => number(other).is_some_and(|n| n != 0.0),
        None => false,
    }
}

fn number(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(f64::from(*n)),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

fn compare(a: &Bson, b: &Bson) -> CmpOrdering {
    match (number(a), number(b)) {
        (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(CmpOrdering::Equal),
        _ => match (a, b) {
            (Bson::String(a), Bson::String(b)) => a.cmp(b),
            _ => CmpOrdering::Equal,
        },
    }
}

fn compare_by(a: &Document, b: &Document, sort: &Document) -> CmpOrdering {
    for (field, direction) in sort {
        let ordering = match (a.get(field), b.get(field)) {
            (Some(x), Some(y)) => compare(x, y),
            (None, Some(_)) => CmpOrdering::Less,
            (Some(_), None) => CmpOrdering::Greater,
            (None, None) => CmpOrdering::Equal,
        };
        let ordering = if number(direction).unwrap_or(1.0) < 0.0 {
            ordering.reverse()
        } else {
            ordering
        };
        if ordering != CmpOrdering::Equal {
            return ordering;
        }
    }
    CmpOrdering::Equal
}

fn sort_documents(documents: &mut [Document], sort: &Document) {
    documents.sort_by(|a, b| compare_by(a, b, sort));
}

fn project(document: &Document, projection: &Document) -> Document {
    let exclude_id = matches!(projection.get("_id"), Some(value) if number(value) == Some(0.0) || value == &Bson::Boolean(false));
    let mut projected = Document::new();
    for (key, value) in document {
        let included = if key == "_id" { !exclude_id } else { projection.contains_key(key) };
        if included {
            projected.insert(key.clone(), value.clone());
        }
    }
    projected
}

fn with_id(document: Document) -> Document {
    if document.contains_key("_id") {
        return document;
    }
    let mut with_id = doc! { "_id": ObjectId::new() };
    with_id.extend(document);
    with_id
}

/// Equality fields of a filter, used as the base of an upserted document
fn seed(filter: &Document) -> Document {
    filter
        .iter()
        .filter(|(key, value)| !key.starts_with('$') && !matches!(value, Bson::Document(d) if d.keys().any(|k| k.starts_with('$'))))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn apply_update(document: &Document, update: &Document) -> Document {
    if !update.keys().any(|key| key.starts_with('$')) {
        let mut replaced = Document::new();
        if let Some(id) = document.get("_id") {
            replaced.insert("_id", id.clone());
        }
        replaced.extend(update.clone());
        return replaced;
    }

    let mut updated = document.clone();
    if let Ok(set) = update.get_document("$set") {
        for (key, value) in set {
            updated.insert(key.clone(), value.clone());
        }
    }
    if let Ok(inc) = update.get_document("$inc") {
        for (key, delta) in inc {
            let next = match (updated.get(key), delta) {
                (None, delta) => delta.clone(),
                (Some(Bson::Int32(a)), Bson::Int32(b)) => Bson::Int32(a + b),
                (Some(current), delta) => match (current, number(current), number(delta)) {
                    (Bson::Int64(a), _, _) => Bson::Int64(a + number(delta).unwrap_or(0.0) as i64),
                    (_, Some(a), Some(b)) => Bson::Double(a + b),
                    _ => current.clone(),
                },
            };
            updated.insert(key.clone(), next);
        }
    }
    updated
}

fn check_unique(stored: &StoredCollection, candidate: &Document, skip: Option<usize>) -> Result<()> {
    let mut indexes = stored.unique.clone();
    indexes.push(vec!["_id".to_string()]);

    for fields in &indexes {
        let key: Vec<Option<&Bson>> = fields.iter().map(|field| candidate.get(field)).collect();
        let duplicate = stored.documents.iter().enumerate().any(|(position, existing)| {
            Some(position) != skip && fields.iter().map(|field| existing.get(field)).collect::<Vec<_>>() == key
        });
        if duplicate {
            return Err(GyroError::Conflict(format!(
                "E11000 duplicate key error index: {}",
                fields.join("_")
            )));
        }
    }
    Ok(())
}

fn group_documents(documents: &[Document], group: &Document) -> Vec<Document> {
    let key_of = |document: &Document| match group.get("_id") {
        Some(Bson::String(path)) if path.starts_with('$') => document.get(&path[1..]).cloned().unwrap_or(Bson::Null),
        Some(other) => other.clone(),
        None => Bson::Null,
    };

    let mut groups: Vec<(Bson, Document)> = Vec::new();
    for document in documents {
        let key = key_of(document);
        let position = match groups.iter().position(|(existing, _)| existing == &key) {
            Some(position) => position,
            None => {
                groups.push((key.clone(), doc! { "_id": key }));
                groups.len() - 1
            }
        };
        let accumulated = &mut groups[position].1;

        for (field, accumulator) in group.iter().filter(|(field, _)| field.as_str() != "_id") {
            let Some(operand) = accumulator.as_document().and_then(|a| a.get("$sum")) else {
                continue;
            };
            let amount = match operand {
                Bson::String(path) if path.starts_with('$') => document.get(&path[1..]).and_then(number).unwrap_or(0.0),
                other => number(other).unwrap_or(0.0),
            };
            let total = accumulated.get(field).and_then(number).unwrap_or(0.0) + amount;
            accumulated.insert(field.clone(), total as i64);
        }
    }
    groups.into_iter().map(|(_, document)| document).collect()
}
