//! Core storage resource types: volumes, snapshots, instance identity,
//! local devices, transactions, and routes.
//!
//! These types form the data model shared by the context chain, the task
//! engine, and the dispatch layer.  They are all [`Serialize`]/
//! [`Deserialize`] so task results can be carried as opaque JSON and handed
//! to validators or a transport layer unchanged.

use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Opaque, unique identifier for a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VolumeId(pub String);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Volumes & snapshots
// ---------------------------------------------------------------------------

/// Full metadata for a volume known to a backend service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Volume {
    /// Unique volume identifier, assigned by the backend.
    pub id: String,
    /// Human-readable volume name.
    pub name: String,
    /// Provisioned size in bytes.
    pub size: u64,
    /// Availability zone the volume lives in, if the backend has zones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,
    /// Provisioned IOPS, if the backend supports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iops: Option<i64>,
    /// Backend-specific volume type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_type: Option<String>,
    /// Backend-reported status string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Instances the volume is attached to.
    #[serde(default)]
    pub attachments: Vec<VolumeAttachment>,
    /// Backend-specific free-form fields.
    #[serde(default)]
    pub fields: HashMap<String, String>,
}

/// One attachment of a volume to an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeAttachment {
    /// The attached volume.
    pub volume_id: String,
    /// Identity of the instance the volume is attached to.
    pub instance_id: InstanceId,
    /// OS device name on the instance, e.g. `/dev/xvdb`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    /// Mount point, if the device is mounted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<String>,
    /// Backend-reported attachment status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Point-in-time snapshot of a volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    /// Unique snapshot identifier, assigned by the backend.
    pub id: String,
    /// Human-readable snapshot name.
    pub name: String,
    /// The volume the snapshot was taken from.
    pub volume_id: String,
    /// Size of the source volume in bytes.
    pub size: u64,
    /// Backend-reported status string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Backend-specific free-form fields.
    #[serde(default)]
    pub fields: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Instance identity & local devices
// ---------------------------------------------------------------------------

/// Identity of the compute instance issuing storage operations, as resolved
/// for one particular driver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceId {
    /// Driver-scoped instance identifier.
    pub id: String,
    /// Name of the driver this identity belongs to.
    pub driver: String,
    /// Driver-specific metadata.
    #[serde(default)]
    pub fields: HashMap<String, String>,
}

/// Instance identities keyed by lowercased driver name.
pub type InstanceIdMap = HashMap<String, InstanceId>;

/// The local device mappings discovered on an instance for one driver.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalDevices {
    /// Name of the driver these devices belong to.
    pub driver: String,
    /// Volume-or-target identifier to OS device path.
    #[serde(default)]
    pub device_map: HashMap<String, String>,
}

/// Local device mappings keyed by lowercased driver name.
pub type LocalDevicesMap = HashMap<String, LocalDevices>;

// ---------------------------------------------------------------------------
// Transactions & routes
// ---------------------------------------------------------------------------

/// Identity of one logical request-scoped transaction.
///
/// Transactions are generated locally and bound to a context by
/// [`Context::require_tx`](crate::context::Context::require_tx); they carry
/// no external state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    /// Unique transaction identifier.
    pub id: Uuid,
    /// When the transaction was created.
    pub created: SystemTime,
}

impl Transaction {
    /// Allocate a fresh transaction identity.
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            created: SystemTime::now(),
        }
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.id)
    }
}

/// The transport route an inbound request matched, as bound to the context
/// by the (external) routing layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestRoute {
    /// Route name, e.g. `volumesForService`.
    pub name: String,
    /// Transport method, e.g. `GET`.
    pub method: String,
    /// Matched path pattern.
    pub path: String,
}

// ---------------------------------------------------------------------------
// Operation options
// ---------------------------------------------------------------------------

/// Options for listing volumes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumesOpts {
    /// Restrict results to volumes attached to the context's instance, and
    /// include only those attachments.
    #[serde(default)]
    pub attachments: bool,
    /// Restrict results to volumes whose name equals this value,
    /// case-insensitively.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_eq: Option<String>,
    /// Driver-specific options, forwarded opaquely.
    #[serde(default)]
    pub opts: HashMap<String, serde_json::Value>,
}

/// Options for inspecting a single volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeInspectOpts {
    /// Include attachment information filtered to the context's instance.
    #[serde(default)]
    pub attachments: bool,
    /// Look the volume up by name instead of by identifier.
    #[serde(default)]
    pub by_name: bool,
    /// Driver-specific options, forwarded opaquely.
    #[serde(default)]
    pub opts: HashMap<String, serde_json::Value>,
}

/// Options for creating a volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeCreateOpts {
    /// Desired availability zone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,
    /// Desired provisioned IOPS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iops: Option<i64>,
    /// Desired size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Desired backend-specific volume type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_type: Option<String>,
    /// Driver-specific options, forwarded opaquely.
    #[serde(default)]
    pub opts: HashMap<String, serde_json::Value>,
}

/// Options for attaching a volume to the context's instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeAttachOpts {
    /// Next available device name proposed by the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_device: Option<String>,
    /// Force the attachment even if the backend reports the volume busy.
    #[serde(default)]
    pub force: bool,
    /// Driver-specific options, forwarded opaquely.
    #[serde(default)]
    pub opts: HashMap<String, serde_json::Value>,
}

/// Options for detaching a volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeDetachOpts {
    /// Force the detachment even if the backend reports the volume busy.
    #[serde(default)]
    pub force: bool,
    /// Driver-specific options, forwarded opaquely.
    #[serde(default)]
    pub opts: HashMap<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Result shapes
// ---------------------------------------------------------------------------

/// Volumes keyed by volume identifier.
pub type VolumeMap = HashMap<String, Volume>;

/// Per-service volume maps keyed by service name.
pub type ServiceVolumeMap = HashMap<String, VolumeMap>;

/// Response to a volume attach operation: the updated volume plus the
/// driver's attachment token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeAttachResponse {
    /// The volume after the attach.
    pub volume: Volume,
    /// Driver-issued token identifying the attachment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attach_token: Option<String>,
}
