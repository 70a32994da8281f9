//! 副本集状态报告

use crate::config::MemberId;
use crate::node::{HealthStatus, NodeRole};
use crate::oplog::OpTime;
use serde::Serialize;

/// 单个成员的状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberStatus {
    pub id: MemberId,
    pub role: NodeRole,
    pub term: u64,
    /// 最后应用的 optime
    pub optime: OpTime,
    /// 当前同步源
    pub syncing_to: Option<MemberId>,
    pub health: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub config_version: u64,
}

/// 副本集状态
#[derive(Debug, Clone, Serialize)]
pub struct ReplSetStatus {
    pub set: String,
    pub version: u64,
    /// 任期最高的主节点
    pub primary: Option<MemberId>,
    pub members: Vec<MemberStatus>,
    pub total_nodes: usize,
    pub healthy_nodes: usize,
}

impl ReplSetStatus {
    pub fn new(set: String, version: u64, mut members: Vec<MemberStatus>) -> Self {
        members.sort_by_key(|m| m.id);
        let primary = members
            .iter()
            .filter(|m| m.role == NodeRole::Primary)
            .max_by_key(|m| m.term)
            .map(|m| m.id);
        let healthy_nodes = members
            .iter()
            .filter(|m| m.health == HealthStatus::Healthy)
            .count();
        Self {
            set,
            version,
            primary,
            total_nodes: members.len(),
            healthy_nodes,
            members,
        }
    }

    pub fn member(&self, id: MemberId) -> Option<&MemberStatus> {
        self.members.iter().find(|m| m.id == id)
    }
}
