//! Sync configuration. A closed, enumerated struct per the "duck-typed
//! configuration" redesign flag: unknown fields are rejected by `serde` (no
//! `#[serde(flatten)]`/catch-all map anywhere in this shape).

use serde::{Deserialize, Serialize};

/// Which transport backend a [`crate::engine::ClientSyncEngine`] talks to.
/// The file/webdav backends are realized by `opsync-file-adapter`
/// implementing [`crate::transport::SyncTransport`] the same as the server
/// backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Backend {
    Server,
    File,
    Webdav,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EncryptionConfig {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl EncryptionConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            password: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SyncConfig {
    pub backend: Backend,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub encryption: EncryptionConfig,
    pub sync_interval_min: u32,
    pub is_compression_enabled: bool,
}

impl SyncConfig {
    /// Two configs "detect a provider change" (§4.8) when the backend or the
    /// base URL differs; the engine treats that as a migration trigger. A
    /// change to the encryption setting or password is also a clean-slate
    /// trigger (§4.6): "toggling encryption (enable, disable, change
    /// password) performs a clean slate," so it must compare equal to
    /// `false` here too, not just the transport identity.
    pub fn is_same_provider(&self, other: &SyncConfig) -> bool {
        self.backend == other.backend
            && self.base_url == other.base_url
            && self.encryption == other.encryption
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_fields() {
        let json = r#"{"backend":"server","encryption":{"enabled":false},"syncIntervalMin":5,"isCompressionEnabled":false,"bogus":1}"#;
        assert!(serde_json::from_str::<SyncConfig>(json).is_err());
    }

    #[test]
    fn provider_change_detected_on_backend_switch() {
        let a = SyncConfig {
            backend: Backend::Server,
            base_url: Some("https://a.example".into()),
            api_key: None,
            encryption: EncryptionConfig::disabled(),
            sync_interval_min: 5,
            is_compression_enabled: false,
        };
        let mut b = a.clone();
        b.backend = Backend::File;
        assert!(!a.is_same_provider(&b));
    }

    #[test]
    fn provider_change_detected_on_encryption_toggle_or_password_change() {
        let a = SyncConfig {
            backend: Backend::Server,
            base_url: Some("https://a.example".into()),
            api_key: None,
            encryption: EncryptionConfig::disabled(),
            sync_interval_min: 5,
            is_compression_enabled: false,
        };

        let mut enabled = a.clone();
        enabled.encryption = EncryptionConfig {
            enabled: true,
            password: Some("hunter2".into()),
        };
        assert!(!a.is_same_provider(&enabled));

        let mut different_password = enabled.clone();
        different_password.encryption.password = Some("hunter3".into());
        assert!(!enabled.is_same_provider(&different_password));
    }
}
