//! Security settings: at-rest encryption key lifecycle and cephx.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The default rotation schedule applied when none is declared.
pub const DEFAULT_KEY_ROTATION_SCHEDULE: &str = "@weekly";

/// Security settings for the cluster.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecuritySpec {
    /// Periodic rotation of per-OSD LUKS keys.
    #[serde(default)]
    pub key_rotation: KeyRotationSpec,
    /// External KMS used to store per-OSD encryption keys.
    #[serde(default)]
    pub key_management_service: KeyManagementServiceSpec,
    /// cephx key lifecycle for the OSD daemons.
    #[serde(default)]
    pub cephx: CephxSpec,
}

/// Periodic LUKS key rotation settings.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KeyRotationSpec {
    /// Enable scheduled key rotation for encrypted OSDs.
    #[serde(default)]
    pub enabled: bool,
    /// Cron schedule for rotation jobs, defaults to `@weekly`.
    #[serde(default)]
    pub schedule: Option<String>,
}

impl KeyRotationSpec {
    /// The declared schedule, or the weekly default.
    pub fn schedule(&self) -> &str {
        self.schedule.as_deref().filter(|s| !s.is_empty()).unwrap_or(DEFAULT_KEY_ROTATION_SCHEDULE)
    }
}

/// Connection details for an external key management service.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KeyManagementServiceSpec {
    /// Provider selector plus opaque provider-specific key/value pairs.
    #[serde(default)]
    pub connection_details: BTreeMap<String, String>,
    /// Name of the secret holding the KMS access token.
    #[serde(default)]
    pub token_secret_name: Option<String>,
}

impl KeyManagementServiceSpec {
    /// Indicates if a KMS is configured.
    pub fn is_enabled(&self) -> bool {
        !self.connection_details.is_empty()
    }

    /// The declared provider name, if any.
    pub fn provider(&self) -> Option<&str> {
        self.connection_details.get("KMS_PROVIDER").map(String::as_str)
    }
}

/// cephx key lifecycle settings for OSD daemons.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CephxSpec {
    /// Rotation policy for OSD daemon keys.
    #[serde(default)]
    pub key_rotation_policy: CephxKeyRotationPolicy,
    /// Desired key generation; daemons below it are rotated on update.
    #[serde(default)]
    pub key_generation: u32,
}

impl CephxSpec {
    /// The key generation daemons should be running with.
    ///
    /// Zero when rotation is disabled, so freshly created daemons always
    /// satisfy the desired generation.
    pub fn desired_generation(&self) -> u32 {
        match self.key_rotation_policy {
            CephxKeyRotationPolicy::Disabled => 0,
            CephxKeyRotationPolicy::KeyGeneration => self.key_generation,
        }
    }
}

/// cephx key rotation policy.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum CephxKeyRotationPolicy {
    /// Never rotate daemon keys.
    Disabled,
    /// Rotate any daemon whose key generation is below `keyGeneration`.
    KeyGeneration,
}

impl Default for CephxKeyRotationPolicy {
    fn default() -> Self {
        Self::Disabled
    }
}

impl std::fmt::Display for CephxKeyRotationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Disabled => "disabled",
                Self::KeyGeneration => "keyGeneration",
            }
        )
    }
}
