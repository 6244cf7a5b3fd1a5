//! Core vocabulary shared across the etlmr workspace: the row/value
//! model, dimension kinds, the shelved store, the fact table and the
//! connection wrapper. Distribution strategies, the key server and the
//! post-fix pass live in `etlmr-cluster`.

pub mod config;
pub mod connection;
pub mod dimension;
pub mod error;
pub mod fact;
pub mod handlers;
pub mod lru;
pub mod row;
pub mod store;

pub use dimension::{CachedDimension, Dimension, DimensionHandle, DimensionRegistry, KeyAllocator, KeySource, ScdDimension, SnowflakedDimension};
pub use error::{EtlError, Result};
pub use fact::{BulkFactTable, BulkLoader};
pub use row::{NameMapping, Row, Value};
pub use store::ShelvedStore;
