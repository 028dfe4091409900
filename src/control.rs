//! Control Socket Server — NUL-framed command dispatch over a UNIX-domain
//! socket, with subscription tables for pairing events and log lines.
//!
//! Framing and the command surface are per SPEC_FULL §4.I. Each accepted
//! connection runs a read loop (splitting on `0x00`) and a writer task fed
//! by an unbounded per-connection channel; asynchronous `MSG:`/`LOG:` frames
//! and synchronous command replies share that same channel so ordering on
//! the wire matches arrival order.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, RwLock};

use crate::ble::{CollectFlags, GattHost};
use crate::codec::{self, Mac};
use crate::events::GatewayEvent;
use crate::gateway_config::GatewayConfig;
use crate::pairing::PairingEngine;
use crate::registry::Registry;
use crate::spool::Spool;

type ConnId = u64;
type Subscriptions = Arc<RwLock<HashMap<ConnId, mpsc::UnboundedSender<String>>>>;

/// Shared state the command dispatcher needs.
#[derive(Clone)]
pub struct ControlServer {
    registry: Registry,
    gateway: GatewayConfig,
    pairing: PairingEngine,
    spool: Spool,
    collect_flags: CollectFlags,
    ble: Arc<dyn GattHost>,
    connected: Arc<RwLock<HashSet<Mac>>>,
    events: broadcast::Sender<GatewayEvent>,
    pairing_subs: Subscriptions,
    log_subs: Subscriptions,
    shutdown: mpsc::Sender<()>,
    next_conn_id: Arc<AtomicU64>,
}

impl ControlServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Registry,
        gateway: GatewayConfig,
        pairing: PairingEngine,
        spool: Spool,
        collect_flags: CollectFlags,
        ble: Arc<dyn GattHost>,
        connected: Arc<RwLock<HashSet<Mac>>>,
        events: broadcast::Sender<GatewayEvent>,
        shutdown: mpsc::Sender<()>,
    ) -> Self {
        Self {
            registry,
            gateway,
            pairing,
            spool,
            collect_flags,
            ble,
            connected,
            events,
            pairing_subs: Arc::new(RwLock::new(HashMap::new())),
            log_subs: Arc::new(RwLock::new(HashMap::new())),
            shutdown,
            next_conn_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Bind the listener at `path`. A stale socket file left by a prior,
    /// no-longer-running process is unlinked first; the live-instance check
    /// itself is the supervisor's job (J), run before this is called.
    pub async fn bind(&self, path: impl AsRef<Path>) -> std::io::Result<UnixListener> {
        let path = path.as_ref();
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }
        UnixListener::bind(path)
    }

    /// Accept loop — spawns one task per connection. Runs until the
    /// listener errors or the process is asked to shut down.
    pub async fn serve(self: Arc<Self>, listener: UnixListener) {
        // Fan out broadcast events to subscribed connections, pruning dead
        // senders the same way the original's PairingLog did.
        let fanout = self.clone();
        let mut events_rx = fanout.events.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events_rx.recv().await {
                fanout.fan_out(event).await;
            }
        });

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let server = self.clone();
                    tokio::spawn(async move { server.handle_connection(stream).await });
                }
                Err(e) => {
                    log::error!("control socket accept failed: {e}");
                    break;
                }
            }
        }
    }

    async fn fan_out(&self, event: GatewayEvent) {
        match event {
            GatewayEvent::Msg(body) => prune_and_send(&self.pairing_subs, &format!("MSG:{body}")).await,
            GatewayEvent::Log(line) => prune_and_send(&self.log_subs, &format!("LOG:{line}")).await,
        }
    }

    async fn handle_connection(&self, stream: UnixStream) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (mut read_half, mut write_half) = stream.into_split();
        let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(frame) = outbox_rx.recv().await {
                let mut bytes = frame.into_bytes();
                bytes.push(0);
                if write_half.write_all(&bytes).await.is_err() {
                    break;
                }
            }
        });

        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match read_half.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    while let Some(pos) = buf.iter().position(|&b| b == 0) {
                        let frame: Vec<u8> = buf.drain(..=pos).collect();
                        let frame = &frame[..frame.len() - 1];
                        if frame.is_empty() {
                            continue;
                        }
                        let line = String::from_utf8_lossy(frame).to_string();
                        let response = self.dispatch(conn_id, &outbox_tx, &line).await;
                        if outbox_tx.send(response).is_err() {
                            break;
                        }
                    }
                }
            }
        }

        self.pairing_subs.write().await.remove(&conn_id);
        self.log_subs.write().await.remove(&conn_id);
    }

    async fn dispatch(&self, conn_id: ConnId, outbox: &mpsc::UnboundedSender<String>, line: &str) -> String {
        let mut parts = line.splitn(2, ' ');
        let cmd = parts.next().unwrap_or("").to_string();
        let rest = parts.next().unwrap_or("").trim();

        match cmd.as_str() {
            "LIST" => {
                let sensors = self.registry.get_all().await;
                ok(&cmd, serde_json::to_string(&sensors).unwrap_or_default())
            }
            "LIST-CONNECTED" => {
                let connected = self.connected.read().await;
                let sensors = self.registry.get_all().await;
                let mut out = Vec::new();
                for sensor in sensors {
                    let last_seen = self.registry.last_seen(&sensor.address).await;
                    out.push(serde_json::json!({
                        "address": codec::mac_to_string(&sensor.address),
                        "connected": connected.contains(&sensor.address),
                        "last_seen": last_seen.as_ref().map(|h| h.last_seen),
                        "activity": last_seen.as_ref().map(|h| &h.last_activity),
                    }));
                }
                ok(&cmd, serde_json::to_string(&out).unwrap_or_default())
            }
            "LIST-PENDING-UPLOADS" => {
                let pending = self.spool.pending().await;
                let payload = serde_json::json!({ "count": pending.len(), "pending": pending.iter().map(|p| p.path.display().to_string()).collect::<Vec<_>>() });
                ok(&cmd, payload.to_string())
            }
            "COLLECT" => {
                let Some(mac) = parse_mac_arg(&cmd, rest) else { return err(&cmd, "not enough arguments") };
                self.collect_flags.flag(mac).await;
                ok(&cmd, codec::mac_to_string(&mac))
            }
            "VIEW" => {
                let Some(mac) = parse_mac_arg(&cmd, rest) else { return err(&cmd, "not enough arguments") };
                match self.registry.get_by_address(&mac).await {
                    Some(sensor) => ok(&cmd, serde_json::to_string(&sensor).unwrap_or_default()),
                    None => err(&cmd, &format!("sensor {} not found", codec::mac_to_string(&mac))),
                }
            }
            "PAIR-LIST" => {
                let addrs: Vec<String> = self.pairing.list_pending().await.iter().map(codec::mac_to_string).collect();
                ok(&cmd, serde_json::to_string(&addrs).unwrap_or_default())
            }
            "PAIR-ENABLE" => {
                self.pairing.enable().await;
                self.pairing_subs.write().await.insert(conn_id, outbox.clone());
                ok(&cmd, "")
            }
            "PAIR-DISABLE" => {
                self.pairing_subs.write().await.remove(&conn_id);
                if self.pairing_subs.read().await.is_empty() {
                    self.pairing.disable().await;
                }
                ok(&cmd, "")
            }
            "PAIR-ACCEPT" => {
                let Some(mac) = parse_mac_arg(&cmd, rest) else { return err(&cmd, "not enough arguments") };
                match self.pairing.accept(mac).await {
                    Ok(()) => ok(&cmd, codec::mac_to_string(&mac)),
                    Err(e) => err(&cmd, &e.to_string()),
                }
            }
            "FORGET" => {
                let Some(mac) = parse_mac_arg(&cmd, rest) else { return err(&cmd, "not enough arguments") };
                match self.registry.remove(&mac).await {
                    Ok(()) => ok(&cmd, codec::mac_to_string(&mac)),
                    Err(e) => err(&cmd, &e.to_string()),
                }
            }
            "GET-GATEWAY" => ok(&cmd, self.gateway.as_json().await.to_string()),
            "SET-GATEWAY-ID" => {
                if rest.is_empty() {
                    return err(&cmd, "not enough arguments");
                }
                self.gateway.set_id(rest.to_string()).await;
                ok(&cmd, "")
            }
            "SET-GATEWAY-PASSWORD" => {
                if rest.is_empty() {
                    return err(&cmd, "not enough arguments");
                }
                self.gateway.set_password(rest.to_string()).await;
                ok(&cmd, "")
            }
            "SET-GATEWAY-HTTP-ENDPOINT" => {
                if rest.is_empty() {
                    return err(&cmd, "not enough arguments");
                }
                self.gateway.set_http_endpoint(rest).await;
                ok(&cmd, "")
            }
            "SET-SENSOR-SETTINGS" => self.handle_set_sensor_settings(&cmd, rest).await,
            "ADD-LOGGER" => {
                self.log_subs.write().await.insert(conn_id, outbox.clone());
                ok(&cmd, "")
            }
            "REMOVE-LOGGER" => {
                self.log_subs.write().await.remove(&conn_id);
                ok(&cmd, "")
            }
            "STOP" => {
                let _ = self.shutdown.send(()).await;
                ok(&cmd, "")
            }
            "" => format!("ERR:invalid command {line}"),
            _ => format!("ERR:invalid command {line}"),
        }
    }

    /// `SET-SENSOR-SETTINGS <mac> [<key> <value>]+` — applies pairs in
    /// order. Not transactional across pairs: the first failing pair aborts
    /// the rest, but earlier pairs' writes have already been persisted
    /// (SPEC_FULL §8 boundary behavior; this is deliberate, documented
    /// per-pair semantics, not a bug).
    async fn handle_set_sensor_settings(&self, cmd: &str, rest: &str) -> String {
        let tokens: Vec<&str> = rest.split_whitespace().collect();
        if tokens.len() < 3 || (tokens.len() - 1) % 2 != 0 {
            return err(cmd, "not enough arguments");
        }
        let Some(mac) = codec::mac_from_string(tokens[0]).ok() else {
            return err(cmd, "not enough arguments");
        };
        let pairs = &tokens[1..];
        for chunk in pairs.chunks(2) {
            let [key, value] = chunk else { continue };
            if let Err(e) = self.registry.update_setting(&mac, key, value).await {
                return err(cmd, &e.to_string());
            }
        }
        self.ble.notify_settings_changed().await;
        ok(cmd, codec::mac_to_string(&mac))
    }
}

fn parse_mac_arg(_cmd: &str, rest: &str) -> Option<Mac> {
    let first = rest.split_whitespace().next()?;
    codec::mac_from_string(first).ok()
}

fn ok(cmd: &str, payload: impl AsRef<str>) -> String {
    format!("OK:{cmd}:{}", payload.as_ref())
}

fn err(cmd: &str, msg: &str) -> String {
    format!("ERR:{cmd}:{msg}")
}

async fn prune_and_send(subs: &Subscriptions, frame: &str) {
    let mut dead = Vec::new();
    {
        let subs = subs.read().await;
        for (id, tx) in subs.iter() {
            if tx.send(frame.to_string()).is_err() {
                dead.push(*id);
            }
        }
    }
    if !dead.is_empty() {
        let mut subs = subs.write().await;
        for id in dead {
            subs.remove(&id);
        }
    }
}
