//! Stable content hashing.
//!
//! The hash is SHA-256 over a canonical encoding of the selected fields:
//! fields are visited in ascending name order and each contributes
//! `name 0x1F json(value) 0x1E`. Field order in the source row therefore
//! never changes the hash.

use sha2::{Digest, Sha256};

use super::row::Row;

/// Compute the content hash of `row`.
///
/// When `include` is non-empty only those fields participate (a missing
/// field hashes as null). Otherwise every field participates. Fields listed
/// in `exclude` never participate.
pub fn content_hash(row: &Row, include: &[String], exclude: &[String]) -> String {
    let mut hasher = Sha256::new();

    if include.is_empty() {
        for (name, value) in row.fields() {
            if exclude.iter().any(|e| e == name) {
                continue;
            }
            feed(&mut hasher, name, &value.to_string());
        }
    } else {
        let mut fields: Vec<&String> = include
            .iter()
            .filter(|f| !exclude.contains(*f))
            .collect();
        fields.sort();
        fields.dedup();
        for name in fields {
            let encoded = row
                .get(name)
                .map(|v| v.to_string())
                .unwrap_or_else(|| "null".to_string());
            feed(&mut hasher, name, &encoded);
        }
    }

    hex::encode(hasher.finalize())
}

fn feed(hasher: &mut Sha256, name: &str, encoded: &str) {
    hasher.update(name.as_bytes());
    hasher.update([0x1F]);
    hasher.update(encoded.as_bytes());
    hasher.update([0x1E]);
}
