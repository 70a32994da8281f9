//! 副本集节点
//!
//! 每个节点独占自己的 [`NodeState`],角色转换只在状态写锁下发生。客户端写入
//! 在同一把锁下完成角色检查与追加,因此与角色转换是原子的。

use crate::config::{MemberConfig, MemberId, ReplicaSetConfig};
use crate::error::{ClusterError, ClusterResult};
use crate::filter::{self, NamespaceFilter};
use crate::oplog::{OpTime, Oplog, OplogEntry, Operation};
use crate::status::MemberStatus;
use crate::storage::StorageApplier;
use mikudb_common::{Namespace, ObjectId, ADMIN_DB};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// 节点角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeRole {
    /// 主节点,唯一接受客户端写入
    Primary,
    /// 从节点
    Secondary,
    /// 仲裁者,只投票
    Arbiter,
    /// 正在回滚分叉的历史
    Rollback,
}

/// 健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// 健康
    Healthy,
    /// 发生致命复制错误,需要移出副本集重建
    Failed,
}

/// 回滚进度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackPhase {
    /// 尚未开始或已被中止,需要(重新)选择回滚源
    Pending,
    /// 正在从回滚源取回文档
    Fetching { source: MemberId },
    /// 已截断,正在从源追赶
    CatchingUp { source: MemberId },
}

/// 心跳响应中携带的节点信息
#[derive(Debug, Clone)]
pub struct Heartbeat {
    pub id: MemberId,
    pub role: NodeRole,
    pub term: u64,
    pub last_optime: OpTime,
    pub health: HealthStatus,
    pub filter: Option<NamespaceFilter>,
    pub data_bearing: bool,
    pub priority: u32,
}

/// 对端在本节点眼中的状态
#[derive(Debug, Clone)]
pub struct PeerView {
    pub id: MemberId,
    pub role: NodeRole,
    pub term: u64,
    pub last_optime: OpTime,
    pub health: HealthStatus,
    pub filter: Option<NamespaceFilter>,
    pub data_bearing: bool,
    pub priority: u32,
    /// 连续错过的心跳轮数
    pub missed: u32,
    /// 心跳窗口内可见
    pub up: bool,
}

impl PeerView {
    fn from_heartbeat(hb: Heartbeat) -> Self {
        Self {
            id: hb.id,
            role: hb.role,
            term: hb.term,
            last_optime: hb.last_optime,
            health: hb.health,
            filter: hb.filter,
            data_bearing: hb.data_bearing,
            priority: hb.priority,
            missed: 0,
            up: true,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.up && self.role == NodeRole::Primary
    }
}

/// 选票请求
#[derive(Debug, Clone, Copy)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate: MemberId,
    pub last_optime: OpTime,
    /// 预投票:只询问是否会投票,不改变任何状态
    pub dry_run: bool,
}

/// 选票响应
#[derive(Debug, Clone, Copy)]
pub struct VoteResponse {
    pub voter: MemberId,
    pub term: u64,
    pub granted: bool,
    pub reason: &'static str,
}

/// 找不到同步源时的退避
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SourceBackoff {
    failures: u32,
    skip_rounds: u32,
}

/// 节点可变状态
#[derive(Debug)]
pub struct NodeState {
    pub role: NodeRole,
    pub current_term: u64,
    pub voted_for: Option<(u64, MemberId)>,
    pub last_applied: OpTime,
    pub sync_source: Option<MemberId>,
    pub forced_sync_source: Option<MemberId>,
    pub health: HealthStatus,
    pub fatal_error: Option<ClusterError>,
    pub rollback: RollbackPhase,
    pub peers: BTreeMap<MemberId, PeerView>,
    pub rounds_without_primary: u32,
    pub rounds_without_majority: u32,
    pub config_version: u64,
    /// 主节点在当前任期内分配的最后一个计数
    next_counter: u64,
    pub(crate) backoff: SourceBackoff,
}

/// 副本集中的一个节点
pub struct ReplNode {
    id: MemberId,
    /// 同时持有两把锁时先取 `member` 再取 `state`
    member: RwLock<MemberConfig>,
    oplog: Arc<Oplog>,
    storage: Arc<dyn StorageApplier>,
    state: RwLock<NodeState>,
}

impl ReplNode {
    /// 创建节点
    pub fn new(member: MemberConfig, config_version: u64, storage: Arc<dyn StorageApplier>) -> Self {
        let role = if member.arbiter_only {
            NodeRole::Arbiter
        } else {
            NodeRole::Secondary
        };
        info!("Creating replica set member {} as {:?}", member.id, role);
        Self {
            id: member.id,
            oplog: Arc::new(Oplog::new(member.id)),
            member: RwLock::new(member),
            storage,
            state: RwLock::new(NodeState {
                role,
                current_term: 0,
                voted_for: None,
                last_applied: OpTime::ZERO,
                sync_source: None,
                forced_sync_source: None,
                health: HealthStatus::Healthy,
                fatal_error: None,
                rollback: RollbackPhase::Pending,
                peers: BTreeMap::new(),
                rounds_without_primary: 0,
                rounds_without_majority: 0,
                config_version,
                next_counter: 0,
                backoff: SourceBackoff::default(),
            }),
        }
    }

    pub fn id(&self) -> MemberId {
        self.id
    }

    pub fn oplog(&self) -> &Arc<Oplog> {
        &self.oplog
    }

    pub fn storage(&self) -> &Arc<dyn StorageApplier> {
        &self.storage
    }

    pub fn member_config(&self) -> MemberConfig {
        self.member.read().clone()
    }

    pub fn filter(&self) -> Option<NamespaceFilter> {
        self.member.read().filter.clone()
    }

    pub fn is_data_bearing(&self) -> bool {
        self.member.read().is_data_bearing()
    }

    pub fn is_electable(&self) -> bool {
        self.member.read().is_electable()
    }

    pub fn role(&self) -> NodeRole {
        self.state.read().role
    }

    pub fn term(&self) -> u64 {
        self.state.read().current_term
    }

    pub fn last_applied(&self) -> OpTime {
        self.state.read().last_applied
    }

    pub fn health(&self) -> HealthStatus {
        self.state.read().health
    }

    pub fn is_healthy(&self) -> bool {
        self.health() == HealthStatus::Healthy
    }

    pub fn sync_source(&self) -> Option<MemberId> {
        self.state.read().sync_source
    }

    pub fn rollback_phase(&self) -> Option<RollbackPhase> {
        let st = self.state.read();
        (st.role == NodeRole::Rollback).then_some(st.rollback)
    }

    pub fn forced_sync_source(&self) -> Option<MemberId> {
        self.state.read().forced_sync_source
    }

    pub fn fatal_error(&self) -> Option<ClusterError> {
        self.state.read().fatal_error.clone()
    }

    /// 对端视图快照
    pub fn peer_views(&self) -> Vec<PeerView> {
        self.state.read().peers.values().cloned().collect()
    }

    pub fn peer_view(&self, id: MemberId) -> Option<PeerView> {
        self.state.read().peers.get(&id).cloned()
    }

    /// 状态报告
    pub fn status(&self) -> MemberStatus {
        let st = self.state.read();
        MemberStatus {
            id: self.id,
            role: st.role,
            term: st.current_term,
            optime: st.last_applied,
            syncing_to: st.sync_source,
            health: st.health,
            error: st.fatal_error.as_ref().map(|e| e.to_string()),
            config_version: st.config_version,
        }
    }

    /// 采用更高版本的配置
    pub fn adopt_config(&self, config: &ReplicaSetConfig) {
        let mut member = self.member.write();
        let mut st = self.state.write();
        if config.version <= st.config_version {
            return;
        }
        if let Some(m) = config.member(self.id) {
            *member = m.clone();
        }
        debug!(
            "Node {} adopted config version {} (was {})",
            self.id, config.version, st.config_version
        );
        st.config_version = config.version;
        st.peers.retain(|id, _| config.member(*id).is_some());
    }

    // ---- 心跳与任期 ----

    /// 构造心跳响应
    pub fn heartbeat(&self) -> Heartbeat {
        let member = self.member.read();
        let st = self.state.read();
        Heartbeat {
            id: self.id,
            role: st.role,
            term: st.current_term,
            last_optime: self.oplog.last_optime(),
            health: st.health,
            filter: member.filter.clone(),
            data_bearing: member.is_data_bearing(),
            priority: member.priority,
        }
    }

    /// 观察到一个任期;更高的任期会使主节点降级。返回是否发生降级。
    pub fn observe_term(&self, term: u64) -> bool {
        let mut st = self.state.write();
        self.observe_term_locked(&mut st, term)
    }

    fn observe_term_locked(&self, st: &mut NodeState, term: u64) -> bool {
        if term <= st.current_term {
            return false;
        }
        debug!("Node {} advancing term {} -> {}", self.id, st.current_term, term);
        st.current_term = term;
        if st.role == NodeRole::Primary {
            info!("Node {} stepping down: observed higher term {}", self.id, term);
            st.role = NodeRole::Secondary;
            st.rounds_without_majority = 0;
            return true;
        }
        false
    }

    /// 记录一次成功的心跳
    pub fn record_heartbeat(&self, hb: Heartbeat) {
        let term = hb.term;
        let mut st = self.state.write();
        st.peers.insert(hb.id, PeerView::from_heartbeat(hb));
        self.observe_term_locked(&mut st, term);
    }

    /// 记录一次错过的心跳,连续错过 `timeout` 轮后视为失联
    pub fn record_missed_heartbeat(&self, peer: MemberId, timeout: u32) {
        let mut st = self.state.write();
        if let Some(view) = st.peers.get_mut(&peer) {
            view.missed = view.missed.saturating_add(1);
            if view.up && view.missed >= timeout {
                debug!("Node {} lost contact with {}", self.id, peer);
                view.up = false;
            }
        }
    }

    /// 每轮心跳后更新选举计时。主节点看不到多数成员超过 `timeout` 轮时降级。
    ///
    /// 返回本轮是否发生降级。
    pub fn update_election_timers(&self, majority: usize, timeout: u32) -> bool {
        let mut st = self.state.write();
        let visible = 1 + st.peers.values().filter(|p| p.up).count();
        let sees_primary = st.role == NodeRole::Primary || st.peers.values().any(PeerView::is_primary);

        if sees_primary {
            st.rounds_without_primary = 0;
        } else {
            st.rounds_without_primary = st.rounds_without_primary.saturating_add(1);
        }

        if st.role != NodeRole::Primary {
            st.rounds_without_majority = 0;
            return false;
        }
        if visible >= majority {
            st.rounds_without_majority = 0;
            return false;
        }
        st.rounds_without_majority += 1;
        if st.rounds_without_majority >= timeout {
            warn!(
                "Node {} stepping down: sees {} of {} required members",
                self.id, visible, majority
            );
            st.role = NodeRole::Secondary;
            st.rounds_without_majority = 0;
            return true;
        }
        false
    }

    // ---- 选举 ----

    /// 处理选票请求
    pub fn handle_vote_request(&self, req: VoteRequest) -> VoteResponse {
        let data_bearing = self.is_data_bearing();
        let mut st = self.state.write();
        let deny = |st: &NodeState, reason: &'static str| VoteResponse {
            voter: self.id,
            term: st.current_term,
            granted: false,
            reason,
        };

        if st.health == HealthStatus::Failed {
            return deny(&st, "voter failed");
        }
        if req.term < st.current_term {
            return deny(&st, "stale term");
        }
        if let Some((term, voted)) = st.voted_for {
            if term == req.term && voted != req.candidate {
                return deny(&st, "already voted in term");
            }
        }
        if st.role == NodeRole::Primary {
            return deny(&st, "voter is primary");
        }
        if st
            .peers
            .values()
            .any(|p| p.is_primary() && p.id != req.candidate && p.term >= st.current_term)
        {
            return deny(&st, "voter sees a primary");
        }
        if data_bearing && self.oplog.last_optime() > req.last_optime {
            return deny(&st, "candidate oplog behind voter");
        }

        if !req.dry_run {
            self.observe_term_locked(&mut st, req.term);
            st.voted_for = Some((req.term, req.candidate));
            debug!("Node {} voted for {} in term {}", self.id, req.candidate, req.term);
        }
        VoteResponse {
            voter: self.id,
            term: st.current_term,
            granted: true,
            reason: "granted",
        }
    }

    /// 是否满足参选条件
    pub fn should_stand(&self, timeout: u32) -> bool {
        let member = self.member.read();
        if !member.is_electable() {
            return false;
        }
        let st = self.state.read();
        if st.role != NodeRole::Secondary || st.health != HealthStatus::Healthy {
            return false;
        }
        if st.rounds_without_primary < timeout {
            return false;
        }
        if st.peers.values().any(PeerView::is_primary) {
            return false;
        }
        let mine = self.oplog.last_optime();
        // 更高优先级且日志不落后的成员应当先当选
        !st.peers.values().any(|p| {
            p.up && p.data_bearing
                && p.health == HealthStatus::Healthy
                && p.priority > member.priority
                && p.last_optime >= mine
        })
    }

    /// 开始一次真实选举:任期加一并投票给自己,返回新任期
    pub fn start_candidacy(&self) -> u64 {
        let mut st = self.state.write();
        st.current_term += 1;
        st.voted_for = Some((st.current_term, self.id));
        info!("Node {} standing for election in term {}", self.id, st.current_term);
        st.current_term
    }

    /// 当选主节点并写入 Noop 条目
    ///
    /// 若任期已变化或角色已不是 Secondary,返回 false。
    pub fn become_primary(&self, term: u64) -> ClusterResult<bool> {
        let filter = self.filter();
        let mut st = self.state.write();
        if st.current_term != term || st.role != NodeRole::Secondary {
            return Ok(false);
        }
        st.role = NodeRole::Primary;
        st.sync_source = None;
        st.forced_sync_source = None;
        st.rounds_without_majority = 0;
        st.next_counter = 0;
        info!("Node {} became PRIMARY in term {}", self.id, term);
        self.append_local(&mut st, filter.as_ref(), admin_namespace()?, Operation::Noop {
            msg: "new primary".to_string(),
        })?;
        Ok(true)
    }

    // ---- 写入路径 ----

    /// 主节点接受客户端写入
    pub fn submit(&self, ns: Namespace, op: Operation) -> ClusterResult<Arc<OplogEntry>> {
        let filter = self.filter();
        let mut st = self.state.write();
        if st.role != NodeRole::Primary {
            return Err(ClusterError::NotPrimary(self.id));
        }
        self.append_local(&mut st, filter.as_ref(), ns, op)
    }

    fn append_local(
        &self,
        st: &mut NodeState,
        filter: Option<&NamespaceFilter>,
        ns: Namespace,
        op: Operation,
    ) -> ClusterResult<Arc<OplogEntry>> {
        let optime = OpTime::new(st.current_term, st.next_counter + 1);
        let entry = Arc::new(OplogEntry::new(optime, ns, op));
        self.oplog.append(entry.clone())?;
        st.next_counter += 1;
        self.apply_to_storage(st, filter, &entry)?;
        st.last_applied = optime;
        Ok(entry)
    }

    /// 应用来自复制链路的一批条目,返回实际应用的条目数
    ///
    /// 按 optime 去重;被过滤的命名空间只追加到 oplog 并推进位置。
    pub fn apply_batch(&self, source: MemberId, batch: &[Arc<OplogEntry>]) -> ClusterResult<usize> {
        let filter = self.filter();
        let mut st = self.state.write();
        let accepting = match st.role {
            NodeRole::Secondary => true,
            NodeRole::Rollback => {
                matches!(st.rollback, RollbackPhase::CatchingUp { source: s } if s == source)
            }
            NodeRole::Primary | NodeRole::Arbiter => false,
        };
        if !accepting || st.health == HealthStatus::Failed {
            return Err(ClusterError::SourceIneligible(format!(
                "node {} is not accepting replicated entries in {:?}",
                self.id, st.role
            )));
        }
        if st.sync_source != Some(source) {
            return Err(ClusterError::SourceIneligible(format!(
                "node {} no longer syncs from {}",
                self.id, source
            )));
        }

        let mut applied = 0;
        for entry in batch {
            if entry.optime <= st.last_applied {
                continue;
            }
            self.oplog.append(entry.clone())?;
            self.apply_to_storage(&mut st, filter.as_ref(), entry)?;
            st.last_applied = entry.optime;
            applied += 1;
        }
        Ok(applied)
    }

    fn apply_to_storage(
        &self,
        st: &mut NodeState,
        filter: Option<&NamespaceFilter>,
        entry: &OplogEntry,
    ) -> ClusterResult<()> {
        if !filter::permits(filter, &entry.ns) {
            return Ok(());
        }
        if let Err(e) = self.storage.apply(entry) {
            let err = ClusterError::ApplyError {
                optime: entry.optime,
                ns: entry.ns.to_string(),
                reason: e.to_string(),
            };
            error!("Node {} halting replication: {}", self.id, err);
            st.health = HealthStatus::Failed;
            st.fatal_error = Some(err.clone());
            st.sync_source = None;
            return Err(err);
        }
        Ok(())
    }

    /// 为回滚源提供文档当前版本
    ///
    /// 本节点必须持有该命名空间的数据。
    pub fn fetch_document(&self, ns: &Namespace, id: &ObjectId) -> ClusterResult<Option<Value>> {
        let member = self.member.read();
        if !member.is_data_bearing() || !filter::permits(member.filter.as_ref(), ns) {
            return Err(ClusterError::SourceIneligible(format!(
                "node {} does not hold data for {}",
                self.id, ns
            )));
        }
        Ok(self.storage.find(ns, id))
    }

    // ---- 同步源与回滚状态 ----

    pub fn set_sync_source(&self, source: Option<MemberId>) {
        self.state.write().sync_source = source;
    }

    pub fn set_forced_sync_source(&self, source: Option<MemberId>) {
        self.state.write().forced_sync_source = source;
    }

    /// 选源失败后的退避判断:返回 true 表示本轮应跳过
    pub(crate) fn source_backoff_pending(&self) -> bool {
        let mut st = self.state.write();
        if st.backoff.skip_rounds > 0 {
            st.backoff.skip_rounds -= 1;
            return true;
        }
        false
    }

    pub(crate) fn record_source_failure(&self, max_rounds: u32) {
        let mut st = self.state.write();
        st.backoff.failures = st.backoff.failures.saturating_add(1);
        let exp = st.backoff.failures.min(16);
        st.backoff.skip_rounds = (1u32 << exp).saturating_sub(1).min(max_rounds);
    }

    pub(crate) fn reset_source_backoff(&self) {
        self.state.write().backoff = SourceBackoff::default();
    }

    /// Secondary -> Rollback
    pub fn enter_rollback(&self, source: MemberId) -> bool {
        let mut st = self.state.write();
        if st.role != NodeRole::Secondary {
            return false;
        }
        warn!(
            "Node {} entering ROLLBACK: diverged from {} at {}",
            self.id, source, st.last_applied
        );
        st.role = NodeRole::Rollback;
        st.rollback = RollbackPhase::Pending;
        st.sync_source = None;
        true
    }

    pub(crate) fn set_rollback_phase(&self, phase: RollbackPhase) {
        let mut st = self.state.write();
        if st.role == NodeRole::Rollback {
            st.rollback = phase;
        }
    }

    /// 回滚截断后把应用位置重置到共同点
    pub(crate) fn reset_applied(&self, optime: OpTime) {
        let mut st = self.state.write();
        st.last_applied = optime;
    }

    /// Rollback -> Secondary
    pub fn finish_rollback(&self) -> bool {
        let mut st = self.state.write();
        if st.role != NodeRole::Rollback {
            return false;
        }
        info!("Node {} finished rollback at {}, now SECONDARY", self.id, st.last_applied);
        st.role = NodeRole::Secondary;
        st.rollback = RollbackPhase::Pending;
        true
    }

    /// 标记致命错误,停止复制
    pub fn mark_fatal(&self, err: ClusterError) {
        let mut st = self.state.write();
        error!("Node {} marked FAILED: {}", self.id, err);
        st.health = HealthStatus::Failed;
        st.fatal_error = Some(err);
        st.sync_source = None;
    }
}

/// 协议元数据使用的命名空间
pub fn admin_namespace() -> ClusterResult<Namespace> {
    Ok(Namespace::new(ADMIN_DB, "system.replset")?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    fn node(member: MemberConfig) -> ReplNode {
        ReplNode::new(member, 1, Arc::new(MemoryStorage::new()))
    }

    fn ns(s: &str) -> Namespace {
        Namespace::parse(s).unwrap()
    }

    fn make_primary(n: &ReplNode) -> u64 {
        let term = n.start_candidacy();
        assert!(n.become_primary(term).unwrap());
        term
    }

    #[test]
    fn test_roles_at_startup() {
        assert_eq!(node(MemberConfig::new(0)).role(), NodeRole::Secondary);
        assert_eq!(node(MemberConfig::new(1).arbiter()).role(), NodeRole::Arbiter);
    }

    #[test]
    fn test_only_primary_accepts_writes() {
        let n = node(MemberConfig::new(0));
        let op = Operation::Insert { id: ObjectId::new(), doc: json!({}) };
        assert_eq!(
            n.submit(ns("a.b"), op.clone()).unwrap_err(),
            ClusterError::NotPrimary(MemberId(0))
        );

        let term = make_primary(&n);
        let entry = n.submit(ns("a.b"), op).unwrap();
        // Noop 占用 counter 1
        assert_eq!(entry.optime, OpTime::new(term, 2));
        assert_eq!(n.last_applied(), entry.optime);
        assert_eq!(n.storage().count(&ns("a.b")), 1);
    }

    #[test]
    fn test_higher_term_steps_down_primary() {
        let n = node(MemberConfig::new(0));
        let term = make_primary(&n);
        assert!(!n.observe_term(term));
        assert!(n.observe_term(term + 1));
        assert_eq!(n.role(), NodeRole::Secondary);
        assert_eq!(n.term(), term + 1);
    }

    #[test]
    fn test_filtered_apply_advances_without_storing() {
        let primary = node(MemberConfig::new(0));
        make_primary(&primary);
        let filtered = node(MemberConfig::new(2).priority(0).filtered(["included"]));
        filtered.set_sync_source(Some(MemberId(0)));

        primary
            .submit(ns("included.included"), Operation::Insert { id: ObjectId::new(), doc: json!({"n": 0}) })
            .unwrap();
        primary
            .submit(ns("excluded.excluded"), Operation::Insert { id: ObjectId::new(), doc: json!({"n": 0}) })
            .unwrap();

        let batch = primary.oplog().entries_after(OpTime::ZERO, 10);
        assert_eq!(filtered.apply_batch(MemberId(0), &batch).unwrap(), 3);
        // 重复投递被去重
        assert_eq!(filtered.apply_batch(MemberId(0), &batch).unwrap(), 0);

        assert_eq!(filtered.last_applied(), primary.last_applied());
        assert_eq!(filtered.oplog().len(), 3);
        assert_eq!(filtered.storage().count(&ns("included.included")), 1);
        assert_eq!(filtered.storage().count(&ns("excluded.excluded")), 0);
    }

    #[test]
    fn test_apply_rejects_unexpected_source() {
        let primary = node(MemberConfig::new(0));
        make_primary(&primary);
        let secondary = node(MemberConfig::new(1));
        secondary.set_sync_source(Some(MemberId(5)));
        let batch = primary.oplog().entries_after(OpTime::ZERO, 10);
        assert!(matches!(
            secondary.apply_batch(MemberId(0), &batch),
            Err(ClusterError::SourceIneligible(_))
        ));
    }

    #[test]
    fn test_apply_error_is_fatal() {
        let primary = node(MemberConfig::new(0));
        make_primary(&primary);
        primary
            .submit(ns("a.b"), Operation::Insert { id: ObjectId::new(), doc: json!({}) })
            .unwrap();

        let storage = Arc::new(MemoryStorage::new());
        storage.inject_failure(ns("a.b"));
        let secondary = ReplNode::new(MemberConfig::new(1), 1, storage);
        secondary.set_sync_source(Some(MemberId(0)));

        let batch = primary.oplog().entries_after(OpTime::ZERO, 10);
        let err = secondary.apply_batch(MemberId(0), &batch).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(secondary.health(), HealthStatus::Failed);
        assert!(secondary.status().error.is_some());
        // 只应用了失败前的 Noop
        assert_eq!(secondary.last_applied(), OpTime::new(1, 1));
    }

    #[test]
    fn test_vote_rules() {
        let voter = node(MemberConfig::new(1));
        let req = VoteRequest {
            term: 1,
            candidate: MemberId(0),
            last_optime: OpTime::ZERO,
            dry_run: true,
        };
        assert!(voter.handle_vote_request(req).granted);
        // 预投票不改变状态
        assert_eq!(voter.term(), 0);

        let real = VoteRequest { dry_run: false, ..req };
        assert!(voter.handle_vote_request(real).granted);
        assert_eq!(voter.term(), 1);

        let other = VoteRequest { candidate: MemberId(2), ..real };
        let resp = voter.handle_vote_request(other);
        assert!(!resp.granted);
        assert_eq!(resp.reason, "already voted in term");

        let stale = VoteRequest { term: 0, ..other };
        assert!(!voter.handle_vote_request(stale).granted);
    }

    #[test]
    fn test_vote_denied_to_candidate_behind() {
        let primary = node(MemberConfig::new(0));
        make_primary(&primary);
        let voter = node(MemberConfig::new(1));
        voter.set_sync_source(Some(MemberId(0)));
        voter
            .apply_batch(MemberId(0), &primary.oplog().entries_after(OpTime::ZERO, 10))
            .unwrap();

        let req = VoteRequest {
            term: 5,
            candidate: MemberId(2),
            last_optime: OpTime::ZERO,
            dry_run: false,
        };
        let resp = voter.handle_vote_request(req);
        assert!(!resp.granted);
        assert_eq!(resp.reason, "candidate oplog behind voter");
    }

    #[test]
    fn test_primary_steps_down_without_majority() {
        let n = node(MemberConfig::new(0));
        make_primary(&n);
        assert!(!n.update_election_timers(2, 2));
        assert!(n.update_election_timers(2, 2));
        assert_eq!(n.role(), NodeRole::Secondary);
    }

    #[test]
    fn test_rollback_transitions() {
        let n = node(MemberConfig::new(1));
        assert!(n.enter_rollback(MemberId(0)));
        assert_eq!(n.role(), NodeRole::Rollback);
        assert_eq!(n.rollback_phase(), Some(RollbackPhase::Pending));
        assert!(!n.enter_rollback(MemberId(0)));
        assert!(n.finish_rollback());
        assert_eq!(n.role(), NodeRole::Secondary);
        assert_eq!(n.rollback_phase(), None);
    }

    #[test]
    fn test_fetch_document_respects_filter() {
        let n = node(MemberConfig::new(2).priority(0).filtered(["included"]));
        let id = ObjectId::new();
        assert!(n.fetch_document(&ns("included.x"), &id).unwrap().is_none());
        assert!(n.fetch_document(&ns("excluded.x"), &id).is_err());
    }

    #[test]
    fn test_adopt_config_while_peers_heartbeat() {
        let n = Arc::new(node(MemberConfig::new(0)));
        let worker = n.clone();
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            std::thread::scope(|s| {
                for _ in 0..3 {
                    s.spawn(|| {
                        for _ in 0..20_000 {
                            worker.heartbeat();
                            worker.should_stand(3);
                        }
                    });
                }
                s.spawn(|| {
                    for version in 2..20_002u64 {
                        let mut config = ReplicaSetConfig::new(
                            "rs",
                            vec![MemberConfig::new(0), MemberConfig::new(1)],
                        );
                        config.version = version;
                        worker.adopt_config(&config);
                    }
                });
            });
            let _ = done_tx.send(());
        });

        done_rx
            .recv_timeout(std::time::Duration::from_secs(30))
            .expect("heartbeat and adopt_config blocked each other");
        assert_eq!(n.status().config_version, 20_001);
    }
}
