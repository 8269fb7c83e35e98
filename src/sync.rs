//! Multi-device key synchronization relay.
//!
//! Moves encrypted key packages between a single user's verified devices.
//! The relay never sees key plaintext: packages are encrypted device-to-device
//! and carry an integrity hash plus a signature the receiving device checks.
//!
//! State machine per package:
//!
//! ```text
//! pending -(target reports success)-> processed
//!    |    -(target reports failure)-> failed
//!    +---------- TTL elapsed -------> expired
//! ```
//!
//! Both endpoints of a package must resolve to the same user; ownership is
//! enforced at creation and on every access through the device directory.

use crate::error::{PqRatchetError, Result};
use crate::exchange::coordinator::generate_id;
use crate::validation::Validator;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use tracing::{debug, info};

/// Lifetime of a sync package before it expires (24 hours).
pub const SYNC_PACKAGE_TTL_SECS: u64 = 24 * 60 * 60;

/// Delivery priority of a sync package.
///
/// Ordered so that `High > Medium > Low` for sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPriority {
    /// Background material (old conversation keys)
    Low,
    /// Ordinary key transfer
    Medium,
    /// Blocking material the target device needs to decrypt now
    High,
}

/// Current position of a package in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Waiting for the target device to fetch and apply it
    Pending,
    /// Target device applied the package
    Processed,
    /// Target device reported an application failure
    Failed,
    /// TTL elapsed before processing
    Expired,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Processed => "processed",
            SyncStatus::Failed => "failed",
            SyncStatus::Expired => "expired",
        };
        write!(f, "{}", name)
    }
}

/// Kind of key material a package carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncKeyType {
    /// Serialized ratchet session state
    RatchetState,
    /// A conversation's negotiated suite secrets
    ConversationKey,
    /// Long-term identity material
    IdentityKey,
}

/// Metadata supplied when creating a package.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    /// Kind of key material carried
    pub key_type: SyncKeyType,
    /// Conversation the material belongs to, when applicable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Integrity hash of the plaintext package, base64
    pub integrity_hash: String,
    /// Sending device's signature over the package, base64
    pub signature: String,
    /// Delivery priority
    pub sync_priority: SyncPriority,
}

/// An encrypted cross-device key transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySyncPackage {
    /// Package identifier
    pub package_id: String,
    /// Owning user
    pub user_id: String,
    /// Sending device
    pub from_device_id: String,
    /// Receiving device
    pub to_device_id: String,
    /// Opaque encrypted key package, base64
    pub encrypted_key_data: String,
    /// Package metadata
    pub metadata: SyncMetadata,
    /// State machine position
    pub status: SyncStatus,
    /// Failure detail reported by the target device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Creation time (unix seconds)
    pub created_at: u64,
    /// Expiry time (unix seconds)
    pub expires_at: u64,
}

impl KeySyncPackage {
    fn is_expired(&self, now: u64) -> bool {
        self.status == SyncStatus::Pending && now > self.expires_at
    }
}

/// Registry resolving devices to their owning user.
///
/// Device enrollment itself (verification ceremonies) is the identity layer's
/// concern; the directory only answers ownership questions.
#[derive(Default)]
pub struct DeviceDirectory {
    owners: RwLock<HashMap<String, String>>,
}

impl DeviceDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or re-registers) a device as owned by `user_id`.
    pub fn register_device(&self, user_id: &str, device_id: &str) -> Result<()> {
        Validator::validate_identifier("userId", user_id)?;
        Validator::validate_identifier("deviceId", device_id)?;
        let mut owners = self.owners.write().unwrap_or_else(|e| e.into_inner());
        owners.insert(device_id.to_string(), user_id.to_string());
        Ok(())
    }

    /// Returns the owner of a device, if registered.
    pub fn owner_of(&self, device_id: &str) -> Option<String> {
        let owners = self.owners.read().unwrap_or_else(|e| e.into_inner());
        owners.get(device_id).cloned()
    }

    /// Whether `user_id` owns `device_id`.
    pub fn user_owns(&self, user_id: &str, device_id: &str) -> bool {
        self.owner_of(device_id).as_deref() == Some(user_id)
    }
}

fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Relay for same-user cross-device key packages.
pub struct MultiDeviceSyncCoordinator {
    packages: RwLock<HashMap<String, KeySyncPackage>>,
    devices: std::sync::Arc<DeviceDirectory>,
}

impl MultiDeviceSyncCoordinator {
    /// Creates a coordinator over a device directory.
    pub fn new(devices: std::sync::Arc<DeviceDirectory>) -> Self {
        Self {
            packages: RwLock::new(HashMap::new()),
            devices,
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, KeySyncPackage>> {
        self.packages.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, KeySyncPackage>> {
        self.packages.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Creates a pending package from one of `user_id`'s devices to another.
    pub fn create_package(
        &self,
        user_id: &str,
        from_device_id: &str,
        to_device_id: &str,
        encrypted_key_data: String,
        metadata: SyncMetadata,
    ) -> Result<KeySyncPackage> {
        Validator::validate_identifier("userId", user_id)?;
        Validator::validate_identifier("fromDeviceId", from_device_id)?;
        Validator::validate_identifier("toDeviceId", to_device_id)?;
        Validator::validate_relay_payload("encryptedKeyData", encrypted_key_data.as_bytes())?;

        if !self.devices.user_owns(user_id, from_device_id)
            || !self.devices.user_owns(user_id, to_device_id)
        {
            return Err(PqRatchetError::DeviceOwnershipMismatch(format!(
                "{} and {} must both belong to {}",
                from_device_id, to_device_id, user_id
            )));
        }
        if from_device_id == to_device_id {
            return Err(PqRatchetError::validation(
                "source and target device must differ",
            ));
        }

        let now = now_secs();
        let package = KeySyncPackage {
            package_id: generate_id(),
            user_id: user_id.to_string(),
            from_device_id: from_device_id.to_string(),
            to_device_id: to_device_id.to_string(),
            encrypted_key_data,
            metadata,
            status: SyncStatus::Pending,
            error_message: None,
            created_at: now,
            expires_at: now + SYNC_PACKAGE_TTL_SECS,
        };

        self.write()
            .insert(package.package_id.clone(), package.clone());
        info!(
            package_id = %package.package_id,
            priority = ?package.metadata.sync_priority,
            "created key sync package"
        );
        Ok(package)
    }

    /// Lists pending packages for a device, highest priority first, then
    /// oldest first. Expired packages are excluded.
    pub fn list_pending(&self, device_id: &str, user_id: &str) -> Result<Vec<KeySyncPackage>> {
        if !self.devices.user_owns(user_id, device_id) {
            return Err(PqRatchetError::ExchangeUnauthorized(format!(
                "{} does not own device {}",
                user_id, device_id
            )));
        }

        let now = now_secs();
        let packages = self.read();
        let mut pending: Vec<KeySyncPackage> = packages
            .values()
            .filter(|p| {
                p.to_device_id == device_id
                    && p.status == SyncStatus::Pending
                    && !p.is_expired(now)
            })
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            b.metadata
                .sync_priority
                .cmp(&a.metadata.sync_priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(pending)
    }

    /// Records the target device's processing outcome.
    pub fn mark_processed(
        &self,
        package_id: &str,
        user_id: &str,
        success: bool,
        error_message: Option<String>,
    ) -> Result<KeySyncPackage> {
        let mut packages = self.write();
        let package = packages
            .get_mut(package_id)
            .ok_or_else(|| PqRatchetError::PackageNotFound(package_id.to_string()))?;

        if !self.devices.user_owns(user_id, &package.to_device_id) {
            return Err(PqRatchetError::ExchangeUnauthorized(format!(
                "{} does not own the destination device",
                user_id
            )));
        }

        let now = now_secs();
        if package.is_expired(now) {
            package.status = SyncStatus::Expired;
            return Ok(package.clone());
        }

        package.status = if success {
            SyncStatus::Processed
        } else {
            SyncStatus::Failed
        };
        package.error_message = error_message;

        debug!(package_id, status = %package.status, "marked sync package");
        Ok(package.clone())
    }

    /// Removes expired packages, returning how many were dropped.
    pub fn cleanup_expired(&self) -> usize {
        let now = now_secs();
        let mut packages = self.write();
        let before = packages.len();
        packages.retain(|_, p| !p.is_expired(now));
        let removed = before - packages.len();
        if removed > 0 {
            info!(removed, "cleaned up expired sync packages");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn metadata(priority: SyncPriority) -> SyncMetadata {
        SyncMetadata {
            key_type: SyncKeyType::ConversationKey,
            conversation_id: Some("conv-1".into()),
            integrity_hash: "aGFzaA==".into(),
            signature: "c2ln".into(),
            sync_priority: priority,
        }
    }

    fn coordinator() -> (MultiDeviceSyncCoordinator, Arc<DeviceDirectory>) {
        let devices = Arc::new(DeviceDirectory::new());
        devices.register_device("alice", "phone").unwrap();
        devices.register_device("alice", "laptop").unwrap();
        devices.register_device("bob", "tablet").unwrap();
        (MultiDeviceSyncCoordinator::new(devices.clone()), devices)
    }

    #[test]
    fn test_create_and_process() {
        let (coord, _) = coordinator();

        let package = coord
            .create_package(
                "alice",
                "phone",
                "laptop",
                "ZGF0YQ==".into(),
                metadata(SyncPriority::Medium),
            )
            .unwrap();
        assert_eq!(package.status, SyncStatus::Pending);

        let updated = coord
            .mark_processed(&package.package_id, "alice", true, None)
            .unwrap();
        assert_eq!(updated.status, SyncStatus::Processed);
    }

    #[test]
    fn test_failure_keeps_error_message() {
        let (coord, _) = coordinator();

        let package = coord
            .create_package(
                "alice",
                "phone",
                "laptop",
                "ZGF0YQ==".into(),
                metadata(SyncPriority::Low),
            )
            .unwrap();

        let updated = coord
            .mark_processed(
                &package.package_id,
                "alice",
                false,
                Some("signature mismatch".into()),
            )
            .unwrap();
        assert_eq!(updated.status, SyncStatus::Failed);
        assert_eq!(updated.error_message.as_deref(), Some("signature mismatch"));
    }

    #[test]
    fn test_cross_user_devices_are_rejected() {
        let (coord, _) = coordinator();

        let err = coord
            .create_package(
                "alice",
                "phone",
                "tablet",
                "ZGF0YQ==".into(),
                metadata(SyncPriority::High),
            )
            .unwrap_err();
        assert!(matches!(err, PqRatchetError::DeviceOwnershipMismatch(_)));
    }

    #[test]
    fn test_unregistered_device_is_rejected() {
        let (coord, _) = coordinator();

        let err = coord
            .create_package(
                "alice",
                "phone",
                "ghost",
                "ZGF0YQ==".into(),
                metadata(SyncPriority::High),
            )
            .unwrap_err();
        assert!(matches!(err, PqRatchetError::DeviceOwnershipMismatch(_)));
    }

    #[test]
    fn test_listing_requires_device_ownership() {
        let (coord, _) = coordinator();

        assert!(coord.list_pending("laptop", "bob").is_err());
        assert!(coord.list_pending("laptop", "alice").unwrap().is_empty());
    }

    #[test]
    fn test_listing_orders_by_priority_then_age() {
        let (coord, _) = coordinator();

        let low = coord
            .create_package("alice", "phone", "laptop", "YQ==".into(), metadata(SyncPriority::Low))
            .unwrap();
        let high = coord
            .create_package("alice", "phone", "laptop", "Yg==".into(), metadata(SyncPriority::High))
            .unwrap();
        let medium = coord
            .create_package("alice", "phone", "laptop", "Yw==".into(), metadata(SyncPriority::Medium))
            .unwrap();

        let pending = coord.list_pending("laptop", "alice").unwrap();
        let ids: Vec<&str> = pending.iter().map(|p| p.package_id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                high.package_id.as_str(),
                medium.package_id.as_str(),
                low.package_id.as_str()
            ]
        );
    }

    #[test]
    fn test_mark_processed_requires_destination_owner() {
        let (coord, _) = coordinator();

        let package = coord
            .create_package(
                "alice",
                "phone",
                "laptop",
                "ZGF0YQ==".into(),
                metadata(SyncPriority::Medium),
            )
            .unwrap();

        let err = coord
            .mark_processed(&package.package_id, "bob", true, None)
            .unwrap_err();
        assert!(matches!(err, PqRatchetError::ExchangeUnauthorized(_)));

        assert!(matches!(
            coord.mark_processed("missing", "alice", true, None).unwrap_err(),
            PqRatchetError::PackageNotFound(_)
        ));
    }

    #[test]
    fn test_expired_packages_are_hidden_and_swept() {
        let (coord, _) = coordinator();

        let package = coord
            .create_package(
                "alice",
                "phone",
                "laptop",
                "ZGF0YQ==".into(),
                metadata(SyncPriority::Medium),
            )
            .unwrap();

        coord.write().get_mut(&package.package_id).unwrap().expires_at = 1;

        assert!(coord.list_pending("laptop", "alice").unwrap().is_empty());
        assert_eq!(coord.cleanup_expired(), 1);
        assert_eq!(coord.cleanup_expired(), 0);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(SyncPriority::High > SyncPriority::Medium);
        assert!(SyncPriority::Medium > SyncPriority::Low);
    }
}
