//! Session, kernel and agent snapshots consumed by the scheduler

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::slot::ResourceSlot;

/// Agent identifier (e.g., "i-001")
pub type AgentId = String;

/// Owner key used for fairness accounting
pub type AccessKey = String;

/// Session identifier
pub type SessionId = Uuid;

/// Kernel identifier
pub type KernelId = Uuid;

/// Default CPU architecture of kernels and agents
pub const DEFAULT_ARCHITECTURE: &str = "x86_64";

fn default_architecture() -> String {
    DEFAULT_ARCHITECTURE.to_string()
}

fn default_cluster_role() -> String {
    "main".to_string()
}

fn default_cluster_size() -> u32 {
    1
}

/// Session type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    #[default]
    Interactive,
    Batch,
    Inference,
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionType::Interactive => write!(f, "interactive"),
            SessionType::Batch => write!(f, "batch"),
            SessionType::Inference => write!(f, "inference"),
        }
    }
}

/// How the kernels of a session are spread over agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterMode {
    /// All kernels on one agent
    #[default]
    SingleNode,
    /// Each kernel may land on a different agent
    MultiNode,
}

impl fmt::Display for ClusterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterMode::SingleNode => write!(f, "single-node"),
            ClusterMode::MultiNode => write!(f, "multi-node"),
        }
    }
}

/// Lifecycle state of a session as seen by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Scheduled,
    Cancelled,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Pending => write!(f, "PENDING"),
            SessionStatus::Scheduled => write!(f, "SCHEDULED"),
            SessionStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Outcome of a single predicate check, kept in the scheduler status data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredicateRecord {
    /// Predicate name
    pub name: String,
    /// Reason for failure, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

/// Bookkeeping the scheduler keeps on a pending session between ticks
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStatusData {
    /// Number of passes in which the session could not be scheduled
    #[serde(default)]
    pub retries: u32,
    /// Last time a pass looked at this session
    #[serde(default)]
    pub last_try: Option<DateTime<Utc>>,
    /// Human-readable reason the session is still pending
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub failed_predicates: Vec<PredicateRecord>,
    #[serde(default)]
    pub passed_predicates: Vec<PredicateRecord>,
}

/// Free-form status data attached to a session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusData {
    #[serde(default)]
    pub scheduler: Option<SchedulerStatusData>,
}

impl StatusData {
    /// Retry count, or `None` if the scheduler never touched this session
    pub fn retries(&self) -> Option<u32> {
        self.scheduler.as_ref().map(|s| s.retries)
    }

    /// Scheduler section, created on first use
    pub fn scheduler_mut(&mut self) -> &mut SchedulerStatusData {
        self.scheduler.get_or_insert_with(SchedulerStatusData::default)
    }
}

/// A kernel (container) belonging to a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelInfo {
    #[serde(default = "Uuid::new_v4")]
    pub id: KernelId,
    /// Image reference
    #[serde(default)]
    pub image: String,
    /// CPU architecture the image is built for
    #[serde(default = "default_architecture")]
    pub architecture: String,
    /// Slots requested by this kernel
    pub requested_slots: ResourceSlot,
    /// Role within the cluster ("main", "sub")
    #[serde(default = "default_cluster_role")]
    pub cluster_role: String,
    /// Index within the role
    #[serde(default)]
    pub cluster_idx: u32,
    /// Manually designated agent
    #[serde(default)]
    pub agent_id: Option<AgentId>,
}

impl KernelInfo {
    pub fn new(requested_slots: ResourceSlot) -> Self {
        Self {
            id: Uuid::new_v4(),
            image: String::new(),
            architecture: default_architecture(),
            requested_slots,
            cluster_role: default_cluster_role(),
            cluster_idx: 0,
            agent_id: None,
        }
    }
}

/// A session waiting to be scheduled
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSession {
    #[serde(default = "Uuid::new_v4")]
    pub id: SessionId,
    #[serde(default)]
    pub name: String,
    pub access_key: AccessKey,
    #[serde(default)]
    pub session_type: SessionType,
    #[serde(default)]
    pub cluster_mode: ClusterMode,
    #[serde(default = "default_cluster_size")]
    pub cluster_size: u32,
    #[serde(default)]
    pub scaling_group: String,
    /// Total slots requested by all kernels
    pub requested_slots: ResourceSlot,
    #[serde(default)]
    pub kernels: Vec<KernelInfo>,
    #[serde(default)]
    pub status_data: StatusData,
    /// Reserved start time of a batch session
    #[serde(default)]
    pub starts_at: Option<DateTime<FixedOffset>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl PendingSession {
    /// Create a single-kernel session requesting `requested_slots`
    pub fn new(access_key: impl Into<AccessKey>, requested_slots: ResourceSlot) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: String::new(),
            access_key: access_key.into(),
            session_type: SessionType::default(),
            cluster_mode: ClusterMode::default(),
            cluster_size: 1,
            scaling_group: String::new(),
            kernels: vec![KernelInfo::new(requested_slots.clone())],
            requested_slots,
            status_data: StatusData::default(),
            starts_at: None,
            created_at: Utc::now(),
        }
    }

    /// Make sure the session has at least one kernel carrying its whole request
    pub fn ensure_main_kernel(&mut self) {
        if self.kernels.is_empty() {
            self.kernels
                .push(KernelInfo::new(self.requested_slots.clone()));
        }
    }

    /// Agent the main kernel was manually pinned to
    pub fn designated_agent(&self) -> Option<&AgentId> {
        self.kernels.first().and_then(|k| k.agent_id.as_ref())
    }

    /// Scheduler retry count, if the session has been tried before
    pub fn retries(&self) -> Option<u32> {
        self.status_data.retries()
    }
}

/// A session that already holds resources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistingSession {
    #[serde(default = "Uuid::new_v4")]
    pub id: SessionId,
    pub access_key: AccessKey,
    #[serde(default)]
    pub scaling_group: String,
    /// Slots currently held by the session
    pub occupying_slots: ResourceSlot,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl ExistingSession {
    pub fn new(access_key: impl Into<AccessKey>, occupying_slots: ResourceSlot) -> Self {
        Self {
            id: Uuid::new_v4(),
            access_key: access_key.into(),
            scaling_group: String::new(),
            occupying_slots,
            created_at: Utc::now(),
        }
    }
}

/// Snapshot of an agent's capacity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentContext {
    pub id: AgentId,
    #[serde(default)]
    pub addr: String,
    #[serde(default = "default_architecture")]
    pub architecture: String,
    #[serde(default)]
    pub scaling_group: String,
    pub available_slots: ResourceSlot,
    #[serde(default)]
    pub occupied_slots: ResourceSlot,
}

impl AgentContext {
    pub fn new(id: impl Into<AgentId>, available_slots: ResourceSlot) -> Self {
        Self {
            id: id.into(),
            addr: String::new(),
            architecture: default_architecture(),
            scaling_group: String::new(),
            available_slots,
            occupied_slots: ResourceSlot::new(),
        }
    }

    /// Capacity not yet occupied
    pub fn free_slots(&self) -> ResourceSlot {
        &self.available_slots - &self.occupied_slots
    }
}
