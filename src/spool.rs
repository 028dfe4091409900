//! Durable Upload Spool — `unsent/`/`sent/` directories, the HTTP publish
//! path, the retry sweep, and the debug-sink dump directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

use crate::codec::{self, Mac};
use crate::error::DurabilityError;
use crate::events::GatewayEvent;
use crate::gateway_config::GatewayConfig;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, Serialize, Deserialize)]
struct UploadBody {
    gateway_id: String,
    gateway_password: String,
    measurements: serde_json::Value,
}

/// In-memory, best-effort view of a failed upload still on disk in
/// `unsent/`. The durable truth is the directory itself — a crash loses
/// only this list, never the underlying file (SPEC_FULL §4.D).
#[derive(Clone, Debug)]
pub struct PendingUpload {
    pub path: PathBuf,
    pub last_attempted_upload: DateTime<Utc>,
}

struct SpoolState {
    pending: Vec<PendingUpload>,
    debug_buffers: HashMap<Mac, Vec<u8>>,
}

/// Shared handle to the spool. `publish` is called from the reassembler's
/// finalization path; the HTTP POST itself runs on a blocking worker so a
/// slow endpoint never stalls the BLE event pump.
#[derive(Clone)]
pub struct Spool {
    unsent_dir: PathBuf,
    sent_dir: PathBuf,
    debug_dir: PathBuf,
    gateway: GatewayConfig,
    events: broadcast::Sender<GatewayEvent>,
    state: Arc<RwLock<SpoolState>>,
    http: reqwest::blocking::Client,
}

impl Spool {
    pub async fn new(cache_dir: impl AsRef<Path>, gateway: GatewayConfig, events: broadcast::Sender<GatewayEvent>) -> std::io::Result<Self> {
        let cache_dir = cache_dir.as_ref();
        let unsent_dir = cache_dir.join("unsent");
        let sent_dir = cache_dir.join("sent");
        let debug_dir = cache_dir.join("debug");
        for dir in [&unsent_dir, &sent_dir, &debug_dir] {
            tokio::fs::create_dir_all(dir).await?;
        }
        let http = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("reqwest client config is static and valid");
        let pending = load_pending(&unsent_dir).await?;
        Ok(Self {
            unsent_dir,
            sent_dir,
            debug_dir,
            gateway,
            events,
            state: Arc::new(RwLock::new(SpoolState { pending, debug_buffers: HashMap::new() })),
            http,
        })
    }

    fn emit(&self, tag: impl Into<String>) {
        let _ = self.events.send(GatewayEvent::Msg(tag.into()));
    }

    /// SPEC_FULL §4.D `publish`. `measurements` is the already-constructed
    /// array, not a string.
    pub async fn publish(&self, measurements: serde_json::Value) {
        let body = UploadBody {
            gateway_id: self.gateway.id().await,
            gateway_password: self.gateway.password().await,
            measurements,
        };
        let endpoint = self.gateway.http_endpoint().await;
        let ts = Utc::now();

        match post_blocking(self.http.clone(), endpoint, body.clone()).await {
            Ok(status) if status == 200 => {
                if let Err(e) = write_json(&self.sent_dir.join(file_name(ts)), &body).await {
                    log::error!("failed to archive uploaded body: {e}");
                }
                self.sweep_unsent().await;
                self.emit("UPLOAD-SUCCESS");
            }
            Ok(status) if status == 401 => {
                self.emit("GATEWAY-INVALID");
                self.spool_failed(&body, ts).await;
            }
            _ => {
                self.spool_failed(&body, ts).await;
            }
        }
    }

    async fn spool_failed(&self, body: &UploadBody, ts: DateTime<Utc>) {
        let path = self.unsent_dir.join(file_name(ts));
        match write_json(&path, body).await {
            Ok(()) => {
                self.state.write().await.pending.push(PendingUpload { path, last_attempted_upload: ts });
                self.emit("UPLOAD-FAILED");
            }
            Err(source) => {
                let err = DurabilityError { path: path.display().to_string(), source };
                log::error!("{err}");
            }
        }
    }

    /// Re-POST every file currently in `unsent/`; on success, move it into
    /// `sent/` and drop it from the in-memory pending list; otherwise leave
    /// it for the next sweep.
    async fn sweep_unsent(&self) {
        let entries = self.state.read().await.pending.clone();
        for entry in entries {
            let Ok(bytes) = tokio::fs::read(&entry.path).await else { continue };
            let Ok(body) = serde_json::from_slice::<UploadBody>(&bytes) else { continue };
            let endpoint = self.gateway.http_endpoint().await;
            if let Ok(200) = post_blocking(self.http.clone(), endpoint, body).await {
                let dest = self.sent_dir.join(entry.path.file_name().unwrap());
                if tokio::fs::rename(&entry.path, &dest).await.is_ok() {
                    let mut state = self.state.write().await;
                    state.pending.retain(|p| p.path != entry.path);
                }
            }
        }
    }

    pub async fn pending(&self) -> Vec<PendingUpload> {
        self.state.read().await.pending.clone()
    }

    /// Accumulate raw debug bytes for `address`; a zero byte flushes the
    /// accumulated buffer to `debug/<mac>_debug.bin` and resets it — the
    /// direct analogue of the original's `handleDebugData`.
    pub async fn on_debug_write(&self, address: Mac, data: &[u8]) {
        let mut state = self.state.write().await;
        let buffer = state.debug_buffers.entry(address).or_default();
        for &byte in data {
            if byte == 0 {
                if !buffer.is_empty() {
                    let flushed = std::mem::take(buffer);
                    let path = self.debug_dir.join(format!("{}_debug.bin", mac_underscored(&address)));
                    drop(state);
                    if let Err(e) = tokio::fs::write(&path, &flushed).await {
                        log::error!("failed to flush debug sink for {}: {e}", codec::mac_to_string(&address));
                    }
                    state = self.state.write().await;
                }
            } else {
                buffer.push(byte);
            }
        }
    }
}

fn mac_underscored(address: &Mac) -> String {
    codec::mac_to_string(address).replace(':', "_")
}

fn file_name(ts: DateTime<Utc>) -> String {
    format!("{}.json", ts.timestamp_nanos_opt().unwrap_or_default())
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    crate::registry::atomic_write_json(path, value).await
}

async fn load_pending(unsent_dir: &Path) -> std::io::Result<Vec<PendingUpload>> {
    let mut pending = Vec::new();
    let mut entries = tokio::fs::read_dir(unsent_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if metadata.is_file() {
            let modified: DateTime<Utc> = metadata.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now());
            pending.push(PendingUpload { path: entry.path(), last_attempted_upload: modified });
        }
    }
    Ok(pending)
}

async fn post_blocking(client: reqwest::blocking::Client, endpoint: String, body: UploadBody) -> Result<u16, reqwest::Error> {
    tokio::task::spawn_blocking(move || client.post(&endpoint).json(&body).send().map(|r| r.status().as_u16()))
        .await
        .expect("blocking task panicked")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    async fn spool_with_endpoint(cache: &Path, endpoint: &str) -> (Spool, broadcast::Receiver<GatewayEvent>) {
        let config_dir = tempfile::tempdir().unwrap();
        let gateway = GatewayConfig::load(config_dir.path()).await.unwrap();
        gateway.set_http_endpoint(endpoint).await;
        let (tx, rx) = crate::events::channel();
        (Spool::new(cache, gateway, tx).await.unwrap(), rx)
    }

    /// Spins a one-shot raw-socket HTTP responder on a loopback port,
    /// answering every accepted connection with `status` and no body, in a
    /// background thread. Returns the `http://127.0.0.1:<port>/` endpoint.
    /// `replies` fixes how many connections are served before the thread
    /// exits — one per expected request in the test.
    fn one_shot_http_server(status: &'static str, replies: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            for _ in 0..replies {
                let Ok((mut stream, _)) = listener.accept() else { break };
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf);
                let response = format!("HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://127.0.0.1:{port}/")
    }

    #[tokio::test]
    async fn publish_to_unreachable_endpoint_spools_and_broadcasts() {
        let cache = tempfile::tempdir().unwrap();
        let (spool, mut rx) = spool_with_endpoint(cache.path(), "http://127.0.0.1:1").await;
        spool.publish(serde_json::json!([])).await;
        let pending = spool.pending().await;
        assert_eq!(pending.len(), 1);
        match rx.try_recv().unwrap() {
            GatewayEvent::Msg(tag) => assert_eq!(tag, "UPLOAD-FAILED"),
            _ => panic!("expected Msg"),
        }
    }

    #[tokio::test]
    async fn pending_survives_reload_from_disk() {
        let cache = tempfile::tempdir().unwrap();
        {
            let (spool, _rx) = spool_with_endpoint(cache.path(), "http://127.0.0.1:1").await;
            spool.publish(serde_json::json!([])).await;
        }
        let (spool2, _rx) = spool_with_endpoint(cache.path(), "http://127.0.0.1:1").await;
        assert_eq!(spool2.pending().await.len(), 1);
    }

    #[tokio::test]
    async fn debug_sink_flushes_on_zero_byte() {
        let cache = tempfile::tempdir().unwrap();
        let (spool, _rx) = spool_with_endpoint(cache.path(), "http://127.0.0.1:1").await;
        let address = [1, 2, 3, 4, 5, 6];
        spool.on_debug_write(address, &[0xAA, 0xBB, 0x00]).await;
        let path = cache.path().join("debug").join("01_02_03_04_05_06_debug.bin");
        let contents = tokio::fs::read(&path).await.unwrap();
        assert_eq!(contents, vec![0xAA, 0xBB]);
    }

    #[tokio::test]
    async fn debug_sink_accumulates_across_writes_until_flush() {
        let cache = tempfile::tempdir().unwrap();
        let (spool, _rx) = spool_with_endpoint(cache.path(), "http://127.0.0.1:1").await;
        let address = [1, 2, 3, 4, 5, 6];
        spool.on_debug_write(address, &[0x01]).await;
        spool.on_debug_write(address, &[0x02, 0x00]).await;
        let path = cache.path().join("debug").join("01_02_03_04_05_06_debug.bin");
        let contents = tokio::fs::read(&path).await.unwrap();
        assert_eq!(contents, vec![0x01, 0x02]);
    }

    #[tokio::test]
    async fn unauthorized_response_broadcasts_gateway_invalid_and_spools() {
        let cache = tempfile::tempdir().unwrap();
        let endpoint = one_shot_http_server("401 Unauthorized", 1);
        let (spool, mut rx) = spool_with_endpoint(cache.path(), &endpoint).await;
        spool.publish(serde_json::json!([])).await;
        assert_eq!(spool.pending().await.len(), 1);
        match rx.try_recv().unwrap() {
            GatewayEvent::Msg(tag) => assert_eq!(tag, "GATEWAY-INVALID"),
            _ => panic!("expected Msg"),
        }
        match rx.try_recv().unwrap() {
            GatewayEvent::Msg(tag) => assert_eq!(tag, "UPLOAD-FAILED"),
            _ => panic!("expected Msg"),
        }
    }

    // S4 — failed publish retried: a 503 spools, a later 200 drains `unsent/`
    // via the retry sweep and moves both bodies into `sent/`.
    #[tokio::test]
    async fn failed_publish_is_retried_once_endpoint_recovers() {
        let cache = tempfile::tempdir().unwrap();
        let config_dir = tempfile::tempdir().unwrap();
        let gateway = GatewayConfig::load(config_dir.path()).await.unwrap();
        let (tx, _rx) = crate::events::channel();

        let down = one_shot_http_server("503 Service Unavailable", 1);
        gateway.set_http_endpoint(&down).await;
        let spool = Spool::new(cache.path(), gateway.clone(), tx.clone()).await.unwrap();
        spool.publish(serde_json::json!([])).await;
        assert_eq!(spool.pending().await.len(), 1);

        // Endpoint recovers; a second, successful publish triggers the sweep
        // that re-posts everything still in `unsent/`.
        let up = one_shot_http_server("200 OK", 2);
        gateway.set_http_endpoint(&up).await;
        spool.publish(serde_json::json!([])).await;

        assert!(spool.pending().await.is_empty());
        let mut unsent = tokio::fs::read_dir(cache.path().join("unsent")).await.unwrap();
        assert!(unsent.next_entry().await.unwrap().is_none());
        let mut sent_count = 0;
        let mut sent = tokio::fs::read_dir(cache.path().join("sent")).await.unwrap();
        while sent.next_entry().await.unwrap().is_some() {
            sent_count += 1;
        }
        assert_eq!(sent_count, 2);
    }
}
