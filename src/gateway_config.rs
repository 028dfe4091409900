//! Gateway Config — the gateway's own persistent identity: id, password,
//! ingestion endpoint, and its two lazily-derived characteristic UUIDs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::codec::UuidWords;
use crate::registry::atomic_write_json;

pub const DEFAULT_HTTP_ENDPOINT: &str = "https://openphm.org/gateway_data";
const GATEWAY_FILE: &str = "gateway.json";

#[derive(Clone, Debug, Serialize, Deserialize)]
struct GatewayData {
    id: String,
    password: String,
    http_endpoint: String,
    data_char_uuid: UuidWords,
    settings_char_uuid: UuidWords,
}

impl Default for GatewayData {
    fn default() -> Self {
        Self {
            id: String::new(),
            password: String::new(),
            http_endpoint: DEFAULT_HTTP_ENDPOINT.to_string(),
            data_char_uuid: [0, 0, 0, 0],
            settings_char_uuid: [0, 0, 0, 0],
        }
    }
}

/// Shared, lock-guarded handle to the gateway's singleton configuration.
#[derive(Clone)]
pub struct GatewayConfig {
    state: Arc<RwLock<GatewayData>>,
    config_dir: PathBuf,
}

impl GatewayConfig {
    pub async fn load(config_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();
        let data = match tokio::fs::read(config_dir.join(GATEWAY_FILE)).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => GatewayData::default(),
            Err(e) => return Err(e),
        };
        Ok(Self { state: Arc::new(RwLock::new(data)), config_dir })
    }

    async fn save(&self) {
        let data = self.state.read().await.clone();
        let _ = atomic_write_json(&self.config_dir.join(GATEWAY_FILE), &data).await;
    }

    pub async fn id(&self) -> String {
        self.state.read().await.id.clone()
    }

    pub async fn set_id(&self, id: String) {
        self.state.write().await.id = id;
        self.save().await;
    }

    pub async fn password(&self) -> String {
        self.state.read().await.password.clone()
    }

    pub async fn set_password(&self, password: String) {
        self.state.write().await.password = password;
        self.save().await;
    }

    pub async fn http_endpoint(&self) -> String {
        self.state.read().await.http_endpoint.clone()
    }

    /// `"default"` resolves to the canonical default URL, per SPEC_FULL §4.C.
    pub async fn set_http_endpoint(&self, value: &str) {
        let resolved = if value.eq_ignore_ascii_case("default") {
            DEFAULT_HTTP_ENDPOINT.to_string()
        } else {
            value.to_string()
        };
        self.state.write().await.http_endpoint = resolved;
        self.save().await;
    }

    /// Idempotent: generates and persists a v4 UUID on first access; every
    /// later call (including across a process restart) returns the same
    /// value. S5 in SPEC_FULL §8 (UUID idempotence).
    pub async fn get_data_char_uuid(&self) -> UuidWords {
        self.get_or_generate(|data| &mut data.data_char_uuid).await
    }

    pub async fn get_settings_char_uuid(&self) -> UuidWords {
        self.get_or_generate(|data| &mut data.settings_char_uuid).await
    }

    async fn get_or_generate(&self, field: impl Fn(&mut GatewayData) -> &mut UuidWords) -> UuidWords {
        let mut state = self.state.write().await;
        let current = *field(&mut state);
        if current != [0, 0, 0, 0] {
            return current;
        }
        let generated = generate_uuid_words();
        *field(&mut state) = generated;
        drop(state);
        self.save().await;
        generated
    }

    pub async fn as_json(&self) -> serde_json::Value {
        let state = self.state.read().await;
        serde_json::json!({
            "id": state.id,
            "http_endpoint": state.http_endpoint,
            "data_char_uuid": crate::codec::uuid_words_to_string(&state.data_char_uuid),
            "settings_char_uuid": crate::codec::uuid_words_to_string(&state.settings_char_uuid),
        })
    }
}

fn generate_uuid_words() -> UuidWords {
    crate::codec::uuid_bytes_to_words(uuid::Uuid::new_v4().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn uuid_is_idempotent_within_process() {
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfig::load(dir.path()).await.unwrap();
        let first = config.get_data_char_uuid().await;
        let second = config.get_data_char_uuid().await;
        assert_eq!(first, second);
    }

    // S5 — UUID idempotence across a process restart.
    #[tokio::test]
    async fn uuid_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let first = {
            let config = GatewayConfig::load(dir.path()).await.unwrap();
            config.get_data_char_uuid().await
        };
        let second = {
            let config = GatewayConfig::load(dir.path()).await.unwrap();
            config.get_data_char_uuid().await
        };
        assert_eq!(first, second);
        assert_ne!(first, [0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn data_and_settings_uuids_differ() {
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfig::load(dir.path()).await.unwrap();
        let data_uuid = config.get_data_char_uuid().await;
        let settings_uuid = config.get_settings_char_uuid().await;
        assert_ne!(data_uuid, settings_uuid);
    }

    #[tokio::test]
    async fn default_sentinel_resolves_to_canonical_url() {
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfig::load(dir.path()).await.unwrap();
        config.set_http_endpoint("https://example.test").await;
        config.set_http_endpoint("default").await;
        assert_eq!(config.http_endpoint().await, DEFAULT_HTTP_ENDPOINT);
    }

    #[tokio::test]
    async fn fresh_config_defaults_to_canonical_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfig::load(dir.path()).await.unwrap();
        assert_eq!(config.http_endpoint().await, DEFAULT_HTTP_ENDPOINT);
    }
}
