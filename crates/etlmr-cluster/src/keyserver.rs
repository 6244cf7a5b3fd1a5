//! Central surrogate-key server used by the ODAT strategy. Ported from
//! `paralleletl.seq_server`/`client_thread`: one accept loop, one
//! handler per connected client, a shared per-dimension counter.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use etlmr_core::error::{EtlError, Result};

pub const DEFAULT_PORT: u16 = 8888;

type Counters = Arc<Mutex<HashMap<String, i64>>>;

async fn handle_client(stream: TcpStream, counters: Counters) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(l)) => l,
            _ => break,
        };
        let dim = line.trim();
        if dim.is_empty() || dim == "END" {
            break;
        }
        let next = {
            let mut counters = counters.lock().await;
            let entry = counters.entry(dim.to_string()).or_insert(1);
            let value = *entry;
            *entry += 1;
            value
        };
        if write_half.write_all(format!("{next}\n").as_bytes()).await.is_err() {
            break;
        }
    }
}

/// Runs the key server until `cancel` fires. `seed` provides the
/// initial next-id value for each dimension name, mirroring
/// `seq_init`'s `SELECT MAX(key) FROM name` pass.
pub async fn run(addr: impl tokio::net::ToSocketAddrs, seed: HashMap<String, i64>, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr).await.map_err(EtlError::KeyServer)?;
    tracing::info!(local_addr = ?listener.local_addr().ok(), "key server listening");
    let counters: Counters = Arc::new(Mutex::new(seed));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("key server shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted.map_err(EtlError::KeyServer)?;
                tracing::debug!(%peer, "key server client connected");
                let counters = counters.clone();
                tokio::spawn(handle_client(stream, counters));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpStream;

    #[tokio::test]
    async fn hands_out_increasing_ids_per_dimension() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let cancel = CancellationToken::new();
        let mut seed = HashMap::new();
        seed.insert("pagedim".to_string(), 1);
        let server_cancel = cancel.clone();
        let server = tokio::spawn(run(addr, seed, server_cancel));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let client_addr = addr;
        let ids = tokio::task::spawn_blocking(move || {
            let stream = TcpStream::connect(client_addr).unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            let mut ids = Vec::new();
            for _ in 0..3 {
                writeln!(writer, "pagedim").unwrap();
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                ids.push(line.trim().parse::<i64>().unwrap());
            }
            writeln!(writer, "END").unwrap();
            ids
        })
        .await
        .unwrap();

        assert_eq!(ids, vec![1, 2, 3]);
        cancel.cancel();
        let _ = server.await;
    }
}
