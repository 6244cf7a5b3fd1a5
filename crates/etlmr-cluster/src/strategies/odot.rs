//! ODOT — One Dimension, One Reducer. Ported from `pyetlmr.odotetlmr`.
//!
//! The source's map phase projects and emits to a reducer keyed by
//! dimension name (guaranteeing exactly one writer per dimension); its
//! combiner buffers up to 50,000 rows before flushing. Run locally and
//! sequentially, that partition-then-reduce shape collapses to: for
//! each level in declared load order, for every dimension in that
//! level, project + handle + ensure each input row in turn. The
//! reducer's buffering threshold has no externally observable effect
//! once there is no cross-process transport to batch over, so it is
//! not reproduced.

use etlmr_core::dimension::KeySource;
use etlmr_core::error::Result;
use etlmr_core::fact::BulkLoader;
use etlmr_core::row::Row;

use super::JobContext;

/// Dimension phase: loads every declared dimension, honoring `order`'s
/// level-wise sequencing so a parent's snowflake children already exist.
/// Snowflake parents resolve their children by lookup only, matching
/// `dim_reduce_func`'s `refdim.lookup(...)` calls — a reducer never
/// inserts into a dimension it doesn't own, only into the one `order`
/// assigned it.
pub fn load_dimensions(ctx: &mut JobContext, input: &[Row], source: &mut KeySource<'_>) -> Result<()> {
    let order = ctx.order.clone();
    for level in order {
        for handle in level {
            let usage = ctx.usage(handle);
            let srcfields = usage.srcfields.clone();
            let rowhandlers = usage.rowhandlers.clone();
            let namemapping = usage.namemapping.clone();
            for src_row in input {
                let mut projected = src_row.project(&srcfields);
                for handler in &rowhandlers {
                    handler(&mut projected, &namemapping)?;
                }
                ctx.registry.ensure_with_looked_up_children(handle, &mut projected, &namemapping, source)?;
                metrics::counter!("etlmr_dimension_ensure_total", "dimension" => ctx.registry.get(handle).name().to_string())
                    .increment(1);
            }
        }
    }
    Ok(())
}

/// Fact phase: looks each referenced dimension's key up (already loaded
/// by the dimension phase) and appends to the bulk-copy sink, flushing
/// at `endload`.
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
