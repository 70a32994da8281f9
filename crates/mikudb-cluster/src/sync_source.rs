//! 同步源选择
//!
//! 候选者必须同时满足:
//! 1. 可达
//! 2. 最后 optime 不落后于请求者的应用位置
//! 3. 持有请求者需要的全部命名空间(见 [`filter_covers`])
//! 4. 持有数据、健康、不处于回滚中
//!
//! 满足条件时优先选择主节点,否则选择 optime 最新的从节点,相同时取较小 ID。

use crate::config::MemberId;
use crate::error::{ClusterError, ClusterResult};
use crate::filter::{filter_covers, NamespaceFilter};
use crate::node::{HealthStatus, NodeRole, PeerView};
use crate::oplog::OpTime;

/// 发起选源的一方
#[derive(Debug, Clone)]
pub struct SourceRequest {
    pub id: MemberId,
    pub last_applied: OpTime,
    pub filter: Option<NamespaceFilter>,
}

/// 判断候选者是否可作为同步源,不可用时返回原因
pub fn check_eligible(req: &SourceRequest, candidate: &PeerView) -> Result<(), String> {
    if candidate.id == req.id {
        return Err(format!("{} cannot sync from itself", req.id));
    }
    if !candidate.up {
        return Err(format!("{} is unreachable", candidate.id));
    }
    if !candidate.data_bearing {
        return Err(format!("{} holds no data", candidate.id));
    }
    if candidate.health != HealthStatus::Healthy {
        return Err(format!("{} is not healthy", candidate.id));
    }
    if candidate.role == NodeRole::Rollback {
        return Err(format!("{} is in rollback", candidate.id));
    }
    if candidate.last_optime < req.last_applied {
        return Err(format!(
            "{} is behind: {} < {}",
            candidate.id, candidate.last_optime, req.last_applied
        ));
    }
    if !filter_covers(req.filter.as_ref(), candidate.filter.as_ref()) {
        return Err(format!(
            "{} does not hold every namespace {} replicates",
            candidate.id, req.id
        ));
    }
    Ok(())
}

pub fn is_eligible(req: &SourceRequest, candidate: &PeerView) -> bool {
    check_eligible(req, candidate).is_ok()
}

/// 选择同步源
pub fn choose(req: &SourceRequest, peers: &[PeerView]) -> ClusterResult<MemberId> {
    let eligible: Vec<&PeerView> = peers.iter().filter(|p| is_eligible(req, p)).collect();

    if let Some(primary) = eligible.iter().find(|p| p.role == NodeRole::Primary) {
        return Ok(primary.id);
    }
    eligible
        .iter()
        .max_by(|a, b| a.last_optime.cmp(&b.last_optime).then(b.id.cmp(&a.id)))
        .map(|p| p.id)
        .ok_or_else(|| {
            ClusterError::SourceIneligible(format!(
                "no member can serve {} at {}",
                req.id, req.last_applied
            ))
        })
}

/// 当前同步源是否应当放弃
///
/// 源失效时放弃;源是从节点而存在合格主节点时也放弃,改从主节点同步。
/// 指定的同步源只在失效时放弃。
pub fn should_switch(
    req: &SourceRequest,
    current: MemberId,
    forced: bool,
    peers: &[PeerView],
) -> Option<String> {
    let Some(view) = peers.iter().find(|p| p.id == current) else {
        return Some(format!("{} is no longer a member", current));
    };
    if let Err(reason) = check_eligible(req, view) {
        return Some(reason);
    }
    if forced || view.role == NodeRole::Primary {
        return None;
    }
    peers
        .iter()
        .find(|p| p.role == NodeRole::Primary && is_eligible(req, p))
        .map(|p| format!("primary {} is available", p.id))
}
