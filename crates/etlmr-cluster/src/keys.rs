//! Surrogate-key sources. Ported from `offdimtables.CachedDimension
//! ._getnextid` (big-dimension range reservation; the shelve-local path
//! lives directly on `ShelvedStore`/`KeySource::ShelveLocal` instead of
//! here, see DESIGN.md) and `paralleletl.seq_server`/`client_thread`
//! (the central service).

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};

use etlmr_core::error::{EtlError, Result};

/// Reserves a block of `block_size` surrogate keys at a time from a
/// database sequence named `seq_<key>`, handing them out locally until
/// exhausted. Ported from `CachedDimension._getnextid`'s big-dimension
/// branch ("every 10000th call does `SELECT NEXTVAL`").
pub struct RangeKeySource {
    handle: tokio::runtime::Handle,
    client: std::sync::Arc<tokio::sync::Mutex<tokio_postgres::Client>>,
    block_size: i64,
    next: i64,
    end_exclusive: i64,
}

impl RangeKeySource {
    pub fn new(
        handle: tokio::runtime::Handle,
        client: std::sync::Arc<tokio::sync::Mutex<tokio_postgres::Client>>,
        block_size: i64,
    ) -> Self {
        RangeKeySource { handle, client, block_size, next: 0, end_exclusive: 0 }
    }

    fn reserve_block(&mut self, key_name: &str) -> Result<()> {
        let client = self.client.clone();
        let stmt = format!("SELECT NEXTVAL('seq_{key_name}')");
        let start: i64 = self.handle.block_on(async move {
            let client = client.lock().await;
            let row = client.query_one(&stmt, &[]).await?;
            Ok::<i64, tokio_postgres::Error>(row.get(0))
        }).map_err(|e| EtlError::Other(e.into()))?;
        self.next = start;
        self.end_exclusive = start + self.block_size;
        Ok(())
    }

    pub fn next_id(&mut self, key_name: &str) -> Result<i64> {
        if self.next >= self.end_exclusive {
            self.reserve_block(key_name)?;
        }
        let id = self.next;
        self.next += 1;
        Ok(id)
    }
}

/// Client for the central surrogate-key server (ODAT). One connection
/// per task, matching `paralleletl.client_thread`'s per-connection
/// sequence namespace.
pub struct CentralKeySource {
    stream: BufReader<TcpStream>,
    raw: TcpStream,
}

impl CentralKeySource {
    pub fn connect(addr: SocketAddr) -> Result<Self> {
        let raw = TcpStream::connect(addr).map_err(EtlError::KeyServer)?;
        let stream = BufReader::new(raw.try_clone().map_err(EtlError::KeyServer)?);
        Ok(CentralKeySource { stream, raw })
    }

    pub fn next_id(&mut self, dimension: &str) -> Result<i64> {
        writeln!(self.raw, "{dimension}").map_err(EtlError::KeyServer)?;
        let mut line = String::new();
        self.stream.read_line(&mut line).map_err(EtlError::KeyServer)?;
        line.trim()
            .parse()
            .map_err(|_| EtlError::Configuration(format!("key server returned malformed reply: {line:?}")))
    }
}

impl Drop for CentralKeySource {
    fn drop(&mut self) {
        let _ = writeln!(self.raw, "END");
    }
}

/// Seeds initial per-dimension counters from `SELECT MAX(key) FROM
/// name`, mirroring `paralleletl.seq_init`.
pub async fn seed_from_warehouse(
    client: &tokio_postgres::Client,
    dimensions: &[(String, String)],
) -> Result<HashMap<String, i64>> {
    let mut seeds = HashMap::new();
    for (name, key) in dimensions {
        let stmt = format!("SELECT COALESCE(MAX({key}), 0) FROM {name}");
        let row = client.query_one(&stmt, &[]).await.map_err(|e| EtlError::Other(e.into()))?;
        let max: i64 = row.get(0);
        seeds.insert(name.clone(), max + 1);
    }
    Ok(seeds)
}
