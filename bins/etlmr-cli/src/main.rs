//! Job driver CLI. Ported from `rde-cli`'s clap + tracing-subscriber +
//! CancellationToken shape, driving the three distribution strategies
//! against a declarative [`JobSpec`] instead of a fixed source/sink
//! pipeline.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use etlmr_core::config::{DimensionKindSpec, JobSpec};
use etlmr_core::dimension::{
    CachedDimension, Dimension, DimensionHandle, DimensionRegistry, KeySource, ScdDimension, SnowflakedDimension,
};
use etlmr_core::fact::{BulkFactTable, BulkLoader};
use etlmr_core::handlers;
use etlmr_core::row::{NameMapping, Row, Value};
use etlmr_core::store::ShelvedStore;
use etlmr_cluster::keys::{CentralKeySource, RangeKeySource};
use etlmr_cluster::postfix::{self, DimensionMeta};
use etlmr_cluster::strategies::{odat, odot, offline, DimensionUsage, FactUsage, JobContext};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for the job driver, matching the source's
/// `disco-master`/`nr-maps`/`nr-reducers`/`load-step`/`load-method`/
/// `post-fix`/`go-live`/`profile`/`config` options one-to-one.
#[derive(Parser, Debug)]
#[command(name = "etlmr-cli")]
#[command(about = "Distributed star/snowflake warehouse ETL driver")]
struct Args {
    /// Accepted for interface parity with the source's map/reduce driver.
    /// The local executor has no remote cluster to address.
    #[arg(long)]
    disco_master: Option<String>,

    #[arg(long, default_value_t = 1)]
    nr_maps: usize,

    #[arg(long, default_value_t = 1)]
    nr_reducers: usize,

    /// 1 = dimension phase, 2 = fact phase.
    #[arg(long)]
    load_step: u8,

    /// 1 = ODOT, 2 = ODAT, 3 = Offline Big-Dimension.
    #[arg(long)]
    load_method: u8,

    /// 1 = run post-fix after an ODAT dimension phase, 2 = skip.
    #[arg(long, default_value_t = 2)]
    post_fix: u8,

    /// 1 = bulk-load reduced shelves into the warehouse after an
    /// Offline dimension phase, 2 = skip.
    #[arg(long, default_value_t = 2)]
    go_live: u8,

    #[arg(long)]
    profile: Option<String>,

    #[arg(long)]
    config: PathBuf,

    /// Required for `--load-method 2` (ODAT): address of a running
    /// `etlmr-keyserver`. Not named in the original CLI surface, added
    /// because the central key service has to be addressed somehow.
    #[arg(long)]
    key_server_addr: Option<SocketAddr>,

    /// Serves `/metrics` in Prometheus text format when given.
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,

    /// Input file paths (tab-separated, header row).
    inputs: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        tracing::error!(error = %e, "job failed");
        return Err(e);
    }
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    if let Some(master) = &args.disco_master {
        tracing::debug!(disco_master = %master, "accepted for interface parity, not used by the local executor");
    }

    let spec = JobSpec::load(&args.config).context("loading job configuration")?;
    let cancel = CancellationToken::new();

    let metrics_handle = match args.metrics_addr {
        Some(_) => Some(metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?),
        None => None,
    };
    if let (Some(addr), Some(handle)) = (args.metrics_addr, metrics_handle.clone()) {
        let server_cancel = cancel.child_token();
        tokio::spawn(async move {
            if let Err(e) = serve_metrics(addr, handle, server_cancel).await {
                tracing::error!(error = %e, "metrics server stopped");
            }
        });
    }

    let (client, connection) = tokio_postgres::connect(&spec.connection.conninfo, tokio_postgres::NoTls)
        .await
        .context("connecting to warehouse")?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!(error = %e, "warehouse connection terminated");
        }
    });
    let client = Arc::new(tokio::sync::Mutex::new(client));
    let rt_handle = tokio::runtime::Handle::current();

    let (mut ctx, handles) = build_job_context(&spec)?;

    let inputs = read_inputs(&args.inputs)?;

    tokio::select! {
        result = drive(&args, &spec, &mut ctx, &handles, &inputs, client.clone(), rt_handle.clone()) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("received Ctrl-C, aborting before the current phase finishes");
            cancel.cancel();
            return Err(anyhow!("interrupted"));
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    args: &Args,
    spec: &JobSpec,
    ctx: &mut JobContext,
    handles: &HashMap<String, DimensionHandle>,
    inputs: &[Row],
    client: Arc<tokio::sync::Mutex<tokio_postgres::Client>>,
    rt_handle: tokio::runtime::Handle,
) -> Result<()> {
    match args.load_step {
        1 => load_dimension_phase(args, spec, ctx, handles, inputs, client, rt_handle).await?,
        2 => {
            let mut loader = make_bulk_loader(rt_handle, client, spec.connection.conninfo.clone());
            odot::load_facts(ctx, inputs, &mut *loader)?;
            metrics::counter!("etlmr_bulk_load_total", "table" => "facts").increment(1);
        }
        other => return Err(anyhow!("--load-step must be 1 or 2, got {other}")),
    }
    Ok(())
}

async fn load_dimension_phase(
    args: &Args,
    spec: &JobSpec,
    ctx: &mut JobContext,
    handles: &HashMap<String, DimensionHandle>,
    inputs: &[Row],
    client: Arc<tokio::sync::Mutex<tokio_postgres::Client>>,
    rt_handle: tokio::runtime::Handle,
) -> Result<()> {
    match args.load_method {
        1 => {
            let mut source = KeySource::ShelveLocal;
            odot::load_dimensions(ctx, inputs, &mut source)?;
            ctx.registry.sync_all()?;
        }
        2 => {
            let addr = args
                .key_server_addr
                .ok_or_else(|| anyhow!("--key-server-addr is required for --load-method 2 (ODAT)"))?;
            let mut central = CentralKeySource::connect(addr)?;
            let mut alloc = move |name: &str| central.next_id(name);
            let mut source = KeySource::External(&mut alloc);
            let partitions = partition_rows(inputs, args.nr_maps.max(1));
            odat::load_dimensions(ctx, partitions, &mut source).await?;
            ctx.registry.sync_all()?;

            if args.post_fix == 1 {
                run_post_fix(spec, client.clone()).await?;
            }
        }
        3 => {
            let big_name = spec
                .dimensions
                .iter()
                .find(|d| d.bigdim)
                .map(|d| d.name.clone())
                .ok_or_else(|| anyhow!("--load-method 3 (Offline) requires one dimension with bigdim: true"))?;
            let big_handle = *handles
                .get(&big_name)
                .ok_or_else(|| anyhow!("big dimension {big_name} was not registered"))?;

            let partitions = partition_rows(inputs, args.nr_maps.max(1));
            let shelve_base = Path::new(&spec.shelve_dir).join(&big_name);
            for (taskid, partition) in partitions.iter().enumerate() {
                let mut range = RangeKeySource::new(rt_handle.clone(), client.clone(), 10_000);
                let mut alloc = move |name: &str| range.next_id(name);
                let mut source = KeySource::External(&mut alloc);
                offline::load_big_dimension_partition(
                    ctx,
                    big_handle,
                    &shelve_base,
                    taskid,
                    spec.lru_capacity,
                    partition,
                    &mut source,
                )?;
            }

            let mut source = KeySource::ShelveLocal;
            offline::load_small_dimensions(ctx, big_handle, &partitions, &mut source)?;
            ctx.registry.sync_all()?;

            if args.go_live == 1 {
                go_live(spec, &big_name, partitions.len(), client.clone(), rt_handle.clone())?;
            }
        }
        other => return Err(anyhow!("--load-method must be 1, 2 or 3, got {other}")),
    }
    Ok(())
}

/// Bulk-loads every per-task big-dimension shelve into the warehouse,
/// mirroring `offdimetlmr.golive` driven once per completed task.
fn go_live(
    spec: &JobSpec,
    big_name: &str,
    nr_tasks: usize,
    client: Arc<tokio::sync::Mutex<tokio_postgres::Client>>,
    rt_handle: tokio::runtime::Handle,
) -> Result<()> {
    let big_spec = spec
        .dimensions
        .iter()
        .find(|d| d.name == big_name)
        .expect("big dimension was validated to exist");
    let mut columns = vec![big_spec.key.clone()];
    columns.extend(big_spec.attributes.iter().cloned());

    let mut loader = make_bulk_loader(rt_handle, client, spec.connection.conninfo.clone());
    let shelve_base = Path::new(&spec.shelve_dir).join(big_name);
    for taskid in 0..nr_tasks {
        let mut path = shelve_base.as_os_str().to_owned();
        path.push(format!(".task{taskid}"));
        offline::golive(big_name, Path::new(&path), &columns, spec.lru_capacity, &mut *loader)?;
        metrics::counter!("etlmr_bulk_load_total", "table" => big_name.to_string()).increment(1);
    }
    Ok(())
}

async fn run_post_fix(spec: &JobSpec, client: Arc<tokio::sync::Mutex<tokio_postgres::Client>>) -> Result<()> {
    let Some(root) = spec.references.first().map(|r| r.parent.clone()) else {
        tracing::debug!("no references declared, nothing for post-fix to do");
        return Ok(());
    };
    let mut metas = HashMap::new();
    for dim in &spec.dimensions {
        metas.insert(
            dim.name.clone(),
            DimensionMeta { name: dim.name.clone(), key: dim.key.clone(), lookupatts: dim.lookupatts.clone() },
        );
    }
    let tree = postfix::build_snowflake(&spec.references, &metas, &root)?;
    let start = std::time::Instant::now();
    let client = client.lock().await;
    tree.fix(&client).await?;
    metrics::histogram!("etlmr_postfix_duration_seconds").record(start.elapsed().as_secs_f64());
    Ok(())
}

/// Builds a [`JobContext`] from a job spec: registers every declared
/// dimension, wraps snowflake parents in [`SnowflakedDimension`] nodes,
/// and resolves `order`/`facts.refdims` against the post-wrap handle
/// map so name lookups recurse through snowflake children correctly.
fn build_job_context(spec: &JobSpec) -> Result<(JobContext, HashMap<String, DimensionHandle>)> {
    let mut registry = DimensionRegistry::new();
    let mut handles: HashMap<String, DimensionHandle> = HashMap::new();
    let mut usages: HashMap<DimensionHandle, DimensionUsage> = HashMap::new();

    for dim in &spec.dimensions {
        let shelve_path = dim
            .shelvedpath
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(|| Path::new(&spec.shelve_dir).join(&dim.name));
        let store = ShelvedStore::open(&shelve_path, spec.lru_capacity, false)
            .with_context(|| format!("opening shelve for dimension {}", dim.name))?;

        let handle = match &dim.kind {
            DimensionKindSpec::Cached => {
                let d = CachedDimension::new(
                    dim.name.clone(),
                    dim.key.clone(),
                    dim.attributes.clone(),
                    dim.lookupatts.clone(),
                    dim.default_id,
                    store,
                )?;
                registry.register(Dimension::Cached(d))
            }
            DimensionKindSpec::Scd { versionatt, fromatt, toatt, srcdateatt, type1atts } => {
                let d = ScdDimension::new(
                    dim.name.clone(),
                    dim.key.clone(),
                    dim.attributes.clone(),
                    dim.lookupatts.clone(),
                    dim.default_id,
                    versionatt.clone(),
                    fromatt.clone(),
                    toatt.clone(),
                    srcdateatt.clone(),
                    type1atts.clone(),
                    store,
                )?;
                registry.register(Dimension::Scd(d))
            }
        };
        handles.insert(dim.name.clone(), handle);

        let mut rowhandlers = Vec::with_capacity(dim.rowhandlers.len());
        for name in &dim.rowhandlers {
            rowhandlers.push(handlers::lookup(name)?);
        }
        let mut namemapping = NameMapping::new();
        for (canonical, source) in &dim.namemappings {
            namemapping.insert(canonical.clone(), source.clone());
        }
        usages.insert(handle, DimensionUsage { srcfields: dim.srcfields.clone(), rowhandlers, namemapping });
    }

    // Wrap every declared snowflake parent in a `Snowflaked` node and
    // repoint `handles[parent]` at it, so later name resolution (order,
    // fact refdims) recurses through the children automatically.
    for reference in &spec.references {
        let parent = *handles
            .get(&reference.parent)
            .ok_or_else(|| anyhow!("reference names undeclared dimension {}", reference.parent))?;
        let mut children = Vec::with_capacity(reference.children.len());
        for child_name in &reference.children {
            let child = *handles
                .get(child_name)
                .ok_or_else(|| anyhow!("reference names undeclared dimension {child_name}"))?;
            let fk = registry.key_attr(child).to_string();
            children.push((child, fk));
        }
        let snowflake = registry.register(Dimension::Snowflaked(SnowflakedDimension {
            name: reference.parent.clone(),
            parent,
            children,
        }));
        handles.insert(reference.parent.clone(), snowflake);
    }

    let order: Vec<Vec<DimensionHandle>> = if spec.order.is_empty() {
        vec![handles.values().copied().collect()]
    } else {
        spec.order
            .iter()
            .map(|level| {
                level
                    .iter()
                    .map(|name| {
                        handles.get(name).copied().ok_or_else(|| anyhow!("load order names undeclared dimension {name}"))
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?
    };

    let mut facts = Vec::with_capacity(spec.facts.len());
    for fact in &spec.facts {
        let refdims: Vec<DimensionHandle> = fact
            .refdims
            .iter()
            .map(|name| handles.get(name).copied().ok_or_else(|| anyhow!("fact {} references undeclared dimension {name}", fact.name)))
            .collect::<Result<Vec<_>>>()?;
        let mut rowhandlers = Vec::with_capacity(fact.rowhandlers.len());
        for name in &fact.rowhandlers {
            rowhandlers.push(handlers::lookup(name)?);
        }
        let mut namemapping = NameMapping::new();
        for (canonical, source) in &fact.namemappings {
            namemapping.insert(canonical.clone(), source.clone());
        }
        let table = BulkFactTable::new(
            fact.name.clone(),
            fact.keyrefs.clone(),
            fact.measures.clone(),
            fact.fieldsep.clone(),
            fact.rowsep.clone(),
            fact.nullsubst.clone(),
            fact.bulksize,
        )?;
        facts.push((table, FactUsage { refdims, namemapping, rowhandlers }));
    }

    Ok((JobContext { registry, usages, order, facts }, handles))
}

/// Reads every input path as tab-separated text with a header row,
/// mirroring `mapreader.map_line_reader`'s `csv.DictReader(delimiter='\t')`.
fn read_inputs(paths: &[PathBuf]) -> Result<Vec<Row>> {
    let mut rows = Vec::new();
    for path in paths {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .from_path(path)
            .with_context(|| format!("opening input {}", path.display()))?;
        let headers = reader.headers()?.clone();
        for record in reader.records() {
            let record = record?;
            let mut row = Row::new();
            for (name, field) in headers.iter().zip(record.iter()) {
                row.set(name, Value::Str(field.to_string()));
            }
            rows.push(row);
        }
    }
    Ok(rows)
}

/// Splits `rows` into `n` contiguous partitions, standing in for
/// pre-hashed partition files a real cluster would read one-per-task.
fn partition_rows(rows: &[Row], n: usize) -> Vec<Vec<Row>> {
    if n <= 1 || rows.is_empty() {
        return vec![rows.to_vec()];
    }
    let chunk = rows.len().div_ceil(n);
    rows.chunks(chunk.max(1)).map(|c| c.to_vec()).collect()
}

/// Builds a `COPY FROM STDIN`-backed bulk loader, mirroring the
/// source's `pgcopy`/`psycopg2`-based bulk-copy callback. Blocks the
/// calling thread on the async client via `Handle::block_on`, matching
/// [`etlmr_core::connection::ConnectionWrapper`]'s sync-over-async shape.
///
/// On cursor-acquisition failure, reopens the connection once and
/// retries the whole COPY, mirroring `conf/config.py::UDF_pgcopy`'s
/// reconnect-and-retry loop.
fn make_bulk_loader(
    rt_handle: tokio::runtime::Handle,
    client: Arc<tokio::sync::Mutex<tokio_postgres::Client>>,
    conninfo: String,
) -> Box<BulkLoader> {
    Box::new(move |table, columns, _fieldsep, _rowsep, nullsubst, data| {
        let client = client.clone();
        let conninfo = conninfo.clone();
        let table = table.to_string();
        let table_for_metrics = table.clone();
        let columns = columns.to_vec();
        let nullsubst = nullsubst.map(str::to_string);
        let data = data.to_vec();
        let row_count = bytecount_newlines(&data);
        rt_handle
            .block_on(async move {
                let collist = columns.join(", ");
                let null_clause = nullsubst.as_deref().unwrap_or("");
                let stmt = format!(
                    "COPY {table} ({collist}) FROM STDIN WITH (FORMAT text, DELIMITER E'\\t', NULL '{null_clause}')"
                );
                match copy_once(&client, &stmt, &data).await {
                    Ok(()) => Ok(()),
                    Err(first_err) => {
                        tracing::warn!(error = %first_err, %table, "bulk copy failed, reopening connection and retrying once");
                        let (new_client, connection) =
                            tokio_postgres::connect(&conninfo, tokio_postgres::NoTls).await?;
                        tokio::spawn(async move {
                            if let Err(e) = connection.await {
                                tracing::error!(error = %e, "warehouse connection terminated");
                            }
                        });
                        *client.lock().await = new_client;
                        copy_once(&client, &stmt, &data).await
                    }
                }
            })
            .map_err(|e| etlmr_core::error::EtlError::Other(e.into()))?;
        metrics::counter!("etlmr_bulk_load_total", "table" => table_for_metrics.clone()).increment(1);
        metrics::counter!("etlmr_bulk_load_rows_total", "table" => table_for_metrics).increment(row_count);
        Ok(())
    })
}

async fn copy_once(
    client: &Arc<tokio::sync::Mutex<tokio_postgres::Client>>,
    stmt: &str,
    data: &[u8],
) -> std::result::Result<(), tokio_postgres::Error> {
    let client = client.lock().await;
    let sink = client.copy_in(stmt).await?;
    futures_util::pin_mut!(sink);
    futures_util::SinkExt::send(&mut sink, bytes::Bytes::copy_from_slice(data)).await?;
    futures_util::SinkExt::close(&mut sink).await?;
    Ok(())
}

fn bytecount_newlines(data: &[u8]) -> u64 {
    data.iter().filter(|&&b| b == b'\n').count() as u64
}

async fn serve_metrics(
    addr: SocketAddr,
    handle: metrics_exporter_prometheus::PrometheusHandle,
    cancel: CancellationToken,
) -> Result<()> {
    let app = axum::Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "metrics endpoint listening");
    axum::serve(listener, app).with_graceful_shutdown(async move { cancel.cancelled().await }).await?;
    Ok(())
}
