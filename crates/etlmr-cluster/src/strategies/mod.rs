//! The three distribution strategies (ODOT, ODAT, Offline-Big-Dim).
//! Each module ports the corresponding `pyetlmr.*etlmr` module's
//! map/combiner/reduce hooks onto plain sequential loops over one
//! process-local [`DimensionRegistry`].

pub mod odat;
pub mod odot;
pub mod offline;

use std::collections::HashMap;

use etlmr_core::dimension::{DimensionHandle, DimensionRegistry};
use etlmr_core::fact::BulkFactTable;
use etlmr_core::handlers::RowHandler;
use etlmr_core::row::NameMapping;

/// How a dimension is populated from a source row: which fields feed
/// it, which handlers run first, and how source names map onto the
/// dimension's canonical attribute names. Ported from
/// `config.dimensions`'s per-dimension settings dict.
pub struct DimensionUsage {
    pub srcfields: Vec<String>,
    pub rowhandlers: Vec<RowHandler>,
    pub namemapping: NameMapping,
}

/// How a fact row is built: which dimensions it references (in lookup
/// order), its handlers, and its name mapping. Ported from
/// `config.facts`'s per-fact settings dict.
pub struct FactUsage {
    pub refdims: Vec<DimensionHandle>,
    pub namemapping: NameMapping,
    pub rowhandlers: Vec<RowHandler>,
}

/// Everything a strategy needs to run a job: the dimension registry,
/// each dimension's usage settings, the snowflake load order (levels
/// loaded to completion before the next begins), and the fact tables.
pub struct JobContext {
    pub registry: DimensionRegistry,
    pub usages: HashMap<DimensionHandle, DimensionUsage>,
    pub order: Vec<Vec<DimensionHandle>>,
    pub facts: Vec<(BulkFactTable, FactUsage)>,
}

impl JobContext {
    pub fn usage(&self, handle: DimensionHandle) -> &DimensionUsage {
        self.usages.get(&handle).expect("every dimension has a declared usage")
    }
}
