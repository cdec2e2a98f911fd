//! ObjectId casting between application strings and native BSON values
//!
//! Application code deals in 24-character hex strings; the driver deals in
//! `ObjectId`. [`cast`] converts on the way in, [`uncast`] on the way out.
//! Identifiers are recognised by the shape of the value, never by key name, so
//! any string that looks like an ObjectId is converted wherever it appears.
//!
//! A nested document of the form `{ "$oid": <value> }` is an escape hatch: the
//! whole wrapper is replaced by the wrapped value as-is, without further casting.

use bson::{oid::ObjectId, Bson, Document};

/// Key of the escape wrapper that bypasses string casting
pub const OID_KEY: &str = "$oid";

const OBJECT_ID_HEX_LEN: usize = 24;

/// Returns true if `value` is exactly 24 hexadecimal characters
pub fn is_valid_object_id(value: &str) -> bool {
    value.len() == OBJECT_ID_HEX_LEN && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Generate a fresh identifier in string form
pub fn new_id() -> String {
    ObjectId::new().to_hex()
}

/// Cast identifier strings to `ObjectId` throughout `doc`, in place
pub fn cast(doc: &mut Document) -> &mut Document {
    for (_, value) in doc.iter_mut() {
        cast_value(value);
    }
    doc
}

/// Cast a single value, recursing into documents and arrays
pub fn cast_value(value: &mut Bson) {
    let replacement = match value {
        Bson::String(s) if is_valid_object_id(s) => ObjectId::parse_str(s.as_str()).ok().map(Bson::ObjectId),
        Bson::Document(inner) => match inner.remove(OID_KEY) {
            Some(raw) => Some(raw),
            None => {
                cast(inner);
                None
            }
        },
        Bson::Array(items) => {
            items.iter_mut().for_each(cast_value);
            None
        }
        _ => None,
    };

    if let Some(replacement) = replacement {
        *value = replacement;
    }
}

/// Convert `ObjectId` values back to hex strings throughout `doc`, in place
pub fn uncast(doc: &mut Document) -> &mut Document {
    for (_, value) in doc.iter_mut() {
        uncast_value(value);
    }
    doc
}

/// Uncast a single value, recursing into documents and arrays
pub fn uncast_value(value: &mut Bson) {
    let replacement = match value {
        Bson::ObjectId(oid) => Some(Bson::String(oid.to_hex())),
        Bson::Document(inner) => match inner.remove(OID_KEY) {
            Some(raw) => Some(raw),
            None => {
                uncast(inner);
                None
            }
        },
        Bson::Array(items) => {
            items.iter_mut().for_each(uncast_value);
            None
        }
        _ => None,
    };

    if let Some(replacement) = replacement {
        *value = replacement;
    }
}

/// Cast every document of a batch
pub fn cast_all(docs: &mut [Document]) -> &mut [Document] {
    for doc in docs.iter_mut() {
        cast(doc);
    }
    docs
}

/// Uncast every document of a batch
pub fn uncast_all(docs: &mut [Document]) -> &mut [Document] {
    for doc in docs.iter_mut() {
        uncast(doc);
    }
    docs
}
