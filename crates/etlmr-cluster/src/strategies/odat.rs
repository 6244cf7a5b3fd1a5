//! ODAT — One Dimension, All Tasks. Ported from `pyetlmr.odatetlmr`.
//!
//! Every mapper `ensure`s every dimension directly; there is no
//! dimension reducer. Surrogate keys must come from the central key
//! server (concurrent `ensure`s across partitions would otherwise
//! collide on a shelve-local counter). Duplicate rows produced by
//! concurrent inserts of the same business key are expected and are
//! resolved afterwards by [`crate::postfix`].

use etlmr_core::dimension::KeySource;
use etlmr_core::error::Result;
use etlmr_core::fact::BulkLoader;
use etlmr_core::row::Row;

use super::JobContext;

/// Dimension phase: every dimension is ensured directly against every
/// partition. Ported from `odatetlmr.dim_map_func`; there is no
/// `dim_reduce_func` counterpart (the source's is a no-op).
///
/// A genuinely distributed cluster would run each partition as its own
/// task against a replicated shelve and a connection to the central key
/// server (see [`crate::keys::CentralKeySource`]); the registry and key
/// source here are process-local shared state, so partitions are
/// applied sequentially rather than concurrently. `source` should be a
/// [`KeySource::External`] wrapping the central key server client:
/// concurrent `ensure`s against a shared shelve-local counter would
/// collide the way a real distributed ODAT job's would.
pub async fn load_dimensions(ctx: &mut JobContext, partitions: Vec<Vec<Row>>, source: &mut KeySource<'_>) -> Result<()> {
    let order: Vec<_> = ctx.order.iter().flatten().copied().collect();
    for partition in &partitions {
        for &handle in &order {
            let usage = ctx.usage(handle);
            let srcfields = usage.srcfields.clone();
            let rowhandlers = usage.rowhandlers.clone();
            let namemapping = usage.namemapping.clone();
            for src_row in partition {
                let mut projected = src_row.project(&srcfields);
                for handler in &rowhandlers {
                    handler(&mut projected, &namemapping)?;
                }
                ctx.registry.ensure(handle, &mut projected, &namemapping, source)?;
                metrics::counter!("etlmr_dimension_ensure_total", "dimension" => ctx.registry.get(handle).name().to_string())
                    .increment(1);
            }
        }
    }
    Ok(())
}

/// Fact phase: identical shape to ODOT's — lookup each referenced
/// dimension's key, append to the bulk sink.
pub fn load_facts(ctx: &mut JobContext, input: &[Row], loader: &mut BulkLoader) -> Result<()> {
    for (fact, usage) in &mut ctx.facts {
        for src_row in input {
            let mut row = src_row.clone();
            for handler in &usage.rowhandlers {
                handler(&mut row, &usage.namemapping)?;
            }
            for &dim in &usage.refdims {
                let key = ctx.registry.lookup(dim, &row, &usage.namemapping)?;
                let key_attr = ctx.registry.key_attr(dim).to_string();
                match key {
                    Some(k) => row.set(key_attr, k),
                    None => row.set(key_attr, etlmr_core::row::Value::Null),
                }
            }
            fact.insert(&row, &usage.namemapping, loader)?;
        }
        fact.endload(loader)?;
    }
    Ok(())
}
