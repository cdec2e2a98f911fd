//! Options builder for `find` and `count`

use bson::{Bson, Document};

/// Builder for the options document accepted by [`Mongo::find`](crate::Mongo::find)
/// and [`Mongo::count`](crate::Mongo::count)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    fields: Option<Document>,
    sort: Option<Document>,
    skip: Option<u64>,
    limit: Option<i64>,
    extra: Document,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return only the named fields (plus `_id`)
    pub fn fields<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let projection = self.fields.get_or_insert_with(Document::new);
        for name in names {
            projection.insert(name.into(), 1);
        }
        self
    }

    /// Set the projection document
    pub fn projection(mut self, projection: Document) -> Self {
        self.fields = Some(projection);
        self
    }

    /// Add a sort key; 1 for ascending, -1 for descending
    pub fn sort(mut self, field: impl Into<String>, direction: i32) -> Self {
        self.sort
            .get_or_insert_with(Document::new)
            .insert(field.into(), direction);
        self
    }

    /// Set the number of documents to skip
    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Set the maximum number of documents to return
    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Any other cursor option, passed to the driver untouched
    pub fn option(mut self, key: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Build the options document
    pub fn into_document(self) -> Document {
        let mut options = Document::new();
        if let Some(fields) = self.fields {
            options.insert("fields", fields);
        }
        if let Some(sort) = self.sort {
            options.insert("sort", sort);
        }
        if let Some(skip) = self.skip {
            options.insert("skip", skip as i64);
        }
        if let Some(limit) = self.limit {
            options.insert("limit", limit);
        }
        options.extend(self.extra);
        options
    }
}

impl From<FindOptions> for Document {
    fn from(options: FindOptions) -> Self {
        options.into_document()
    }
}

impl From<FindOptions> for Option<Document> {
    fn from(options: FindOptions) -> Self {
        Some(options.into_document())
    }
}
