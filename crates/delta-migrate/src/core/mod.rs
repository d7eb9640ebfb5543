//! Core value types shared by every component.
//!
//! - [`key`]: ordered legacy record keys
//! - [`row`]: field-addressed rows exchanged with the stores
//! - [`hash`]: stable content hashing over a canonical field set
//! - [`query`]: the generic parameterized SELECT model the stores implement

pub mod hash;
pub mod key;
pub mod query;
pub mod row;

pub use hash::content_hash;
pub use key::RecordKey;
pub use query::{Predicate, SelectQuery, TableRef};
pub use row::{parse_timestamp, Row};
