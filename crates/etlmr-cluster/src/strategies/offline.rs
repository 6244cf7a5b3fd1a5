//! Offline Big-Dimension. Ported from `pyetlmr.offdimetlmr`.
//!
//! One dimension is flagged big; input partitions are assumed
//! pre-hashed on its business key (not verified here, see
//! DESIGN.md's Open Question decisions). Every other ("small")
//! dimension is reduced centrally. Reduced shelves are then shipped to
//! every other host so the fact phase can look keys up purely from
//! local files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use etlmr_core::dimension::{CachedDimension, DimensionHandle, KeySource};
use etlmr_core::error::{EtlError, Result};
use etlmr_core::fact::BulkLoader;
use etlmr_core::row::Row;
use etlmr_core::store::ShelvedStore;

use super::JobContext;

fn task_store_path(base: &Path, taskid: usize) -> PathBuf {
    let mut path = base.as_os_str().to_owned();
    path.push(format!(".task{taskid}"));
    PathBuf::from(path)
}

/// Processes the big dimension for one task's partition against its own
/// per-task shelve, mirroring `dim_map_func`'s big-dimension branch and
/// `open_shelveddb(taskid=this_partition())`.
pub fn load_big_dimension_partition(
    ctx: &mut JobContext,
    big_dim: DimensionHandle,
    shelve_base_path: &Path,
    taskid: usize,
    capacity: usize,
    partition: &[Row],
    source: &mut KeySource<'_>,
) -> Result<()> {
    let (name, key, attributes, lookupatts, default_id) = match ctx.registry.get(big_dim) {
        etlmr_core::dimension::Dimension::Cached(d) => d.declaration(),
        _ => return Err(EtlError::Configuration("big dimension must be a cached dimension".into())),
    };
    let usage = ctx.usage(big_dim);
    let srcfields = usage.srcfields.clone();
    let rowhandlers = usage.rowhandlers.clone();
    let namemapping = usage.namemapping.clone();

    let store = ShelvedStore::open(task_store_path(shelve_base_path, taskid), capacity, false)?;
    let mut task_dim = CachedDimension::new(name, key, attributes, lookupatts, default_id, store)?;
    for src_row in partition {
        let mut projected = src_row.project(&srcfields);
        for handler in &rowhandlers {
            handler(&mut projected, &namemapping)?;
        }
        task_dim.ensure(&mut projected, &namemapping, source)?;
        metrics::counter!("etlmr_dimension_ensure_total", "dimension" => task_dim.name.clone()).increment(1);
    }
    task_dim.store_mut().sync()
}

/// Reduce phase for small dimensions: dedupe each dimension's projected
/// rows across every partition (mirroring `dim_combiner_func_using_list`'s
/// `if not row in rows` membership check), then apply handlers and
/// `ensure` into the dimension's single shared shelve.
pub fn load_small_dimensions(
    ctx: &mut JobContext,
    big_dim: DimensionHandle,
    partitions: &[Vec<Row>],
    source: &mut KeySource<'_>,
) -> Result<()> {
    let small_dims: Vec<DimensionHandle> = ctx
        .order
        .iter()
        .flatten()
        .copied()
        .filter(|&h| h != big_dim)
        .collect();

    for handle in small_dims {
        let usage = ctx.usage(handle);
        let srcfields = usage.srcfields.clone();
        let rowhandlers = usage.rowhandlers.clone();
        let namemapping = usage.namemapping.clone();

        let mut deduped: Vec<Row> = Vec::new();
        for partition in partitions {
            for src_row in partition {
                let projected = src_row.project(&srcfields);
                if !deduped.contains(&projected) {
                    deduped.push(projected);
                }
            }
        }
        for mut row in deduped {
            for handler in &rowhandlers {
                handler(&mut row, &namemapping)?;
            }
            ctx.registry.ensure(handle, &mut row, &namemapping, source)?;
            metrics::counter!("etlmr_dimension_ensure_total", "dimension" => ctx.registry.get(handle).name().to_string())
                .increment(1);
        }
    }
    Ok(())
}

/// Copies a reduced shelve file to another host via `scp`, mirroring
/// `offdimetlmr.scp_file`. Reads `SSH_USER`/`SSH_KEY` from the
/// environment exactly as the source does.
pub async fn sync_shelve_to_host(shelve_path: &Path, hostname: &str) -> Result<()> {
    let ssh_key = std::env::var("SSH_KEY").ok();
    let ssh_user = std::env::var("SSH_USER").unwrap_or_default();
    let target = if ssh_user.is_empty() {
        hostname.to_string()
    } else {
        format!("{ssh_user}@{hostname}")
    };

    let mut ssh_args: Vec<String> = Vec::new();
    if let Some(key) = &ssh_key {
        ssh_args.push("-i".into());
        ssh_args.push(key.clone());
    }

    let path_str = shelve_path.to_string_lossy().to_string();
    let mut rm_cmd = tokio::process::Command::new("ssh");
    rm_cmd.args(&ssh_args).arg(&target).arg(format!("rm -f {path_str}"));
    let _ = rm_cmd.status().await;

    let mut scp_cmd = tokio::process::Command::new("scp");
    scp_cmd.args(&ssh_args).arg(&path_str).arg(format!("{target}:{path_str}"));
    let status = scp_cmd.status().await.map_err(|e| EtlError::Other(e.into()))?;
    if !status.success() {
        return Err(EtlError::Configuration(format!("copying {path_str} to {hostname} failed")));
    }
    Ok(())
}

/// Bulk-loads every row in a readonly shelve into the warehouse,
/// mirroring `offdimetlmr.golive`. `table` is the warehouse table name,
/// independent of `shelve_path` (a per-task shelve's path carries a
/// `.task<N>` suffix the table name must not).
pub fn golive(table: &str, shelve_path: &Path, columns: &[String], capacity: usize, loader: &mut BulkLoader) -> Result<()> {
    let store = ShelvedStore::open(shelve_path, capacity, true)?;
    let mut buffer: Vec<u8> = Vec::new();
    for (_key, versions) in store.iter_entries() {
        for row in versions {
            let fields: Vec<String> = columns
                .iter()
                .map(|c| match row.get(c) {
                    Some(v) if !v.is_null() => v.to_string(),
                    _ => String::new(),
                })
                .collect();
            buffer.extend_from_slice(fields.join("\t").as_bytes());
            buffer.push(b'\n');
        }
    }
    loader(table, columns, "\t", "\n", None, &buffer)
}

/// Tracks which host currently holds each dimension's freshest shelve,
/// mirroring `path_addr` in `offdimetlmr.sync_dims_across_servers`.
pub type PathAddr = HashMap<PathBuf, String>;
