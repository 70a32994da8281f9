//! 副本集注册表与确定性驱动
//!
//! [`ReplicaSet`] 按 `MemberId` 持有全部节点、可达性图与复制链路。节点之间
//! 不互相引用,所有跨节点交互都经过这里按 ID 查找。
//!
//! `tick()` 推进一轮:
//! 1. 每个节点向可达成员发心跳,更新选举计时,必要时参选
//! 2. 每个持有数据的节点维护同步源,需要时执行回滚
//! 3. 泵送所有打开的链路直到源没有新条目
//!
//! 异步运行时见 [`crate::runtime`],它复用同一组单节点步骤。

use crate::config::{ClusterConfig, ElectionConfig, MemberId, ReplicaSetConfig, ReplicationConfig};
use crate::election;
use crate::error::{ClusterError, ClusterResult};
use crate::link::{LinkHandle, LinkSettings};
use crate::membership::{InMemoryMembership, MembershipService};
use crate::network::Network;
use crate::node::{admin_namespace, NodeRole, PeerView, ReplNode, RollbackPhase};
use crate::oplog::{OpTime, OplogEntry, Operation};
use crate::rollback::{RollbackCoordinator, RollbackReport};
use crate::status::{MemberStatus, ReplSetStatus};
use crate::storage::{MemoryStorage, StorageApplier};
use crate::sync_source::{self, SourceRequest};
use crate::write_concern::{WriteAck, WriteConcern};
use dashmap::DashMap;
use mikudb_common::Namespace;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

type StorageFactory = Box<dyn Fn(MemberId) -> Arc<dyn StorageApplier> + Send + Sync>;

/// 副本集
pub struct ReplicaSet {
    election: ElectionConfig,
    replication: ReplicationConfig,
    membership: Arc<dyn MembershipService>,
    network: Arc<Network>,
    nodes: DashMap<MemberId, Arc<ReplNode>>,
    /// 按目标节点索引,每个节点同时最多一条入链
    links: DashMap<MemberId, Arc<LinkHandle>>,
    /// 每个成员最近一次完成的回滚
    rollbacks: DashMap<MemberId, RollbackReport>,
    storage_factory: StorageFactory,
    round: AtomicU64,
}

impl ReplicaSet {
    /// 以内存存储创建副本集
    pub fn new(config: ClusterConfig) -> ClusterResult<Self> {
        Self::with_storage(config, |_| Arc::new(MemoryStorage::new()) as Arc<dyn StorageApplier>)
    }

    /// 为每个成员用 `storage` 创建存储
    pub fn with_storage<F>(config: ClusterConfig, storage: F) -> ClusterResult<Self>
    where
        F: Fn(MemberId) -> Arc<dyn StorageApplier> + Send + Sync + 'static,
    {
        config.validate()?;
        let membership: Arc<dyn MembershipService> =
            Arc::new(InMemoryMembership::new(config.replica_set.clone())?);
        let set = Self {
            election: config.election,
            replication: config.replication,
            membership,
            network: Arc::new(Network::new()),
            nodes: DashMap::new(),
            links: DashMap::new(),
            rollbacks: DashMap::new(),
            storage_factory: Box::new(storage),
            round: AtomicU64::new(0),
        };
        let rs = set.membership.current_config();
        for member in &rs.members {
            set.spawn_node(member.id, &rs);
        }
        info!(
            "Replica set {} created with {} members",
            rs.name,
            rs.members.len()
        );
        Ok(set)
    }

    fn spawn_node(&self, id: MemberId, config: &ReplicaSetConfig) {
        if let Some(member) = config.member(id) {
            let storage = (self.storage_factory)(id);
            let node = Arc::new(ReplNode::new(member.clone(), config.version, storage));
            self.nodes.insert(id, node);
        }
    }

    // ---- 访问 ----

    pub fn node(&self, id: MemberId) -> ClusterResult<Arc<ReplNode>> {
        self.nodes
            .get(&id)
            .map(|n| n.value().clone())
            .ok_or(ClusterError::NodeNotFound(id))
    }

    /// 按 ID 排序的成员
    pub fn member_ids(&self) -> Vec<MemberId> {
        let mut ids: Vec<MemberId> = self.nodes.iter().map(|n| *n.key()).collect();
        ids.sort();
        ids
    }

    pub fn config(&self) -> Arc<ReplicaSetConfig> {
        self.membership.current_config()
    }

    pub fn membership(&self) -> &Arc<dyn MembershipService> {
        &self.membership
    }

    pub fn network(&self) -> &Arc<Network> {
        &self.network
    }

    pub fn election_config(&self) -> &ElectionConfig {
        &self.election
    }

    pub fn replication_config(&self) -> &ReplicationConfig {
        &self.replication
    }

    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            batch_size: self.replication.batch_size,
            catchup_lag: self.replication.catchup_lag_entries,
            idle_poll: self.election.heartbeat_interval(),
        }
    }

    pub fn link(&self, destination: MemberId) -> Option<Arc<LinkHandle>> {
        self.links.get(&destination).map(|l| l.value().clone())
    }

    /// 已完成的轮数
    pub fn round(&self) -> u64 {
        self.round.load(Ordering::Relaxed)
    }

    /// 任期最高的健康主节点
    pub fn primary(&self) -> Option<MemberId> {
        self.nodes
            .iter()
            .filter(|n| n.is_healthy() && n.role() == NodeRole::Primary)
            .max_by_key(|n| (n.term(), std::cmp::Reverse(n.id())))
            .map(|n| n.id())
    }

    // ---- 网络 ----

    /// 把成员与其他所有成员隔离
    pub fn isolate(&self, id: MemberId) {
        self.network.isolate(id, self.member_ids());
    }

    /// 恢复成员与 `others` 的连接
    pub fn reconnect(&self, id: MemberId, others: &[MemberId]) {
        for other in others {
            self.network.reconnect(id, *other);
        }
    }

    pub fn partition(&self, groups: &[&[MemberId]]) {
        self.network.partition(groups);
    }

    pub fn heal(&self) {
        self.network.heal();
    }

    // ---- 单节点步骤 ----

    /// 一轮心跳与选举
    pub fn heartbeat_node(&self, id: MemberId) -> ClusterResult<()> {
        let node = self.node(id)?;
        let config = self.membership.current_config();
        node.adopt_config(&config);
        let timeout = self.election.election_timeout_heartbeats;

        let mut reachable = Vec::new();
        for peer_id in config.member_ids().filter(|p| *p != id) {
            let Some(peer) = self.nodes.get(&peer_id).map(|p| p.value().clone()) else {
                continue;
            };
            if self.network.can_reach(id, peer_id) {
                peer.observe_term(node.term());
                node.record_heartbeat(peer.heartbeat());
                reachable.push(peer);
            } else {
                node.record_missed_heartbeat(peer_id, timeout);
            }
        }

        node.update_election_timers(config.majority(), timeout);
        if node.should_stand(timeout) {
            election::run_election(&node, &reachable, &config, timeout)?;
        }
        Ok(())
    }

    /// 同步源维护,返回本轮新打开的链路
    pub fn maintain_sync(&self, id: MemberId) -> ClusterResult<Option<Arc<LinkHandle>>> {
        let node = self.node(id)?;
        if !node.is_data_bearing() || !node.is_healthy() {
            self.drop_link(&node);
            return Ok(None);
        }
        match node.role() {
            NodeRole::Primary | NodeRole::Arbiter => {
                self.drop_link(&node);
                Ok(None)
            }
            NodeRole::Rollback => self.maintain_rollback(&node),
            NodeRole::Secondary => self.maintain_secondary(&node),
        }
    }

    fn maintain_secondary(&self, node: &Arc<ReplNode>) -> ClusterResult<Option<Arc<LinkHandle>>> {
        if let Some(link) = self.link(node.id()) {
            if !link.is_closed() {
                let forced = node.forced_sync_source() == Some(link.source());
                let views = self.reachable_views(node);
                match sync_source::should_switch(&self.source_request(node), link.source(), forced, &views) {
                    None => return Ok(None),
                    Some(reason) => {
                        info!(
                            "Node {} leaving sync source {}: {}",
                            node.id(),
                            link.source(),
                            reason
                        );
                        if forced {
                            node.set_forced_sync_source(None);
                        }
                    }
                }
            }
            self.drop_link(node);
        }

        if node.source_backoff_pending() {
            return Ok(None);
        }
        let source_id = match self.select_source(node) {
            Ok(source) => source,
            Err(e) => {
                debug!("Node {}: {}", node.id(), e);
                node.record_source_failure(self.replication.source_retry_max_rounds);
                return Ok(None);
            }
        };
        node.reset_source_backoff();
        let source = self.node(source_id)?;
        Ok(Some(self.open_link(&source, node, node.last_applied())))
    }

    fn maintain_rollback(&self, node: &Arc<ReplNode>) -> ClusterResult<Option<Arc<LinkHandle>>> {
        match node.rollback_phase() {
            Some(RollbackPhase::CatchingUp { source }) => {
                if let Some(link) = self.link(node.id()) {
                    if !link.is_closed() && link.source() == source {
                        return Ok(None);
                    }
                }
                self.drop_link(node);
                // 截断已完成,任何合格的源都可以继续追赶
                let source_id = match self.select_source(node) {
                    Ok(s) => s,
                    Err(e) => {
                        debug!("Node {} cannot resume catch-up: {}", node.id(), e);
                        return Ok(None);
                    }
                };
                node.set_rollback_phase(RollbackPhase::CatchingUp { source: source_id });
                let source = self.node(source_id)?;
                Ok(Some(self.open_link(&source, node, node.last_applied())))
            }
            Some(RollbackPhase::Pending) | Some(RollbackPhase::Fetching { .. }) => {
                self.drop_link(node);
                let source_id = match self.select_source(node) {
                    Ok(s) => s,
                    Err(e) => {
                        debug!("Node {} has no rollback source: {}", node.id(), e);
                        return Ok(None);
                    }
                };
                let source = self.node(source_id)?;
                match RollbackCoordinator::new(node, &source, &self.network).run() {
                    Ok(report) => {
                        let from = report.common_point;
                        self.rollbacks.insert(node.id(), report);
                        Ok(Some(self.open_link(&source, node, from)))
                    }
                    Err(e) if e.is_fatal() => {
                        node.mark_fatal(e);
                        Ok(None)
                    }
                    Err(e) => {
                        warn!("Node {} rollback against {} failed: {}", node.id(), source_id, e);
                        Ok(None)
                    }
                }
            }
            None => Ok(None),
        }
    }

    fn source_request(&self, node: &ReplNode) -> SourceRequest {
        SourceRequest {
            id: node.id(),
            last_applied: node.last_applied(),
            filter: node.filter(),
        }
    }

    /// 心跳视图,叠加当前网络可达性
    fn reachable_views(&self, node: &ReplNode) -> Vec<PeerView> {
        node.peer_views()
            .into_iter()
            .map(|mut v| {
                v.up = v.up && self.network.can_reach(node.id(), v.id);
                v
            })
            .collect()
    }

    fn select_source(&self, node: &ReplNode) -> ClusterResult<MemberId> {
        let req = self.source_request(node);
        let views = self.reachable_views(node);
        if let Some(forced) = node.forced_sync_source() {
            match views.iter().find(|v| v.id == forced) {
                Some(view) if sync_source::is_eligible(&req, view) => return Ok(forced),
                _ => {
                    warn!(
                        "Node {} dropping forced sync source {}: no longer eligible",
                        node.id(),
                        forced
                    );
                    node.set_forced_sync_source(None);
                }
            }
        }
        sync_source::choose(&req, &views)
    }

    fn open_link(&self, source: &ReplNode, destination: &ReplNode, from: OpTime) -> Arc<LinkHandle> {
        self.drop_link(destination);
        let link = LinkHandle::open(source, destination, from);
        self.links.insert(destination.id(), link.clone());
        link
    }

    fn drop_link(&self, node: &ReplNode) {
        if let Some((_, link)) = self.links.remove(&node.id()) {
            link.close();
        }
        node.set_sync_source(None);
    }

    /// 处理链路报告的错误
    pub fn on_link_error(&self, link: &Arc<LinkHandle>, err: &ClusterError) {
        let Ok(node) = self.node(link.destination()) else {
            return;
        };
        match err {
            ClusterError::Diverged { .. } => match node.role() {
                NodeRole::Secondary => {
                    node.enter_rollback(link.source());
                }
                NodeRole::Rollback => node.set_rollback_phase(RollbackPhase::Pending),
                _ => {}
            },
            e if e.is_fatal() => {}
            e => debug!(
                "Link {} -> {} stopped: {}",
                link.source(),
                link.destination(),
                e
            ),
        }
        self.links
            .remove_if(&link.destination(), |_, current| Arc::ptr_eq(current, link));
    }

    /// 泵送所有链路
    pub fn pump_links(&self) {
        let settings = self.link_settings();
        let mut links: Vec<Arc<LinkHandle>> = self.links.iter().map(|l| l.value().clone()).collect();
        links.sort_by_key(|l| l.destination());
        for link in links {
            let Ok(destination) = self.node(link.destination()) else {
                link.close();
                continue;
            };
            if let Err(e) = link.drain(&destination, &self.network, &settings) {
                self.on_link_error(&link, &e);
            }
        }
    }

    /// 推进一轮
    pub fn tick(&self) -> ClusterResult<()> {
        let ids = self.member_ids();
        for id in &ids {
            self.heartbeat_node(*id)?;
        }
        for id in &ids {
            self.maintain_sync(*id)?;
        }
        self.pump_links();
        self.round.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// 推进直到条件成立,最多 `max_rounds` 轮,返回实际轮数
    pub fn run_until<F>(&self, mut cond: F, max_rounds: usize) -> ClusterResult<usize>
    where
        F: FnMut(&Self) -> bool,
    {
        for round in 0..=max_rounds {
            if cond(self) {
                return Ok(round);
            }
            if round < max_rounds {
                self.tick()?;
            }
        }
        Err(ClusterError::Timeout(format!(
            "condition not reached after {} rounds",
            max_rounds
        )))
    }

    // ---- 写入 ----

    /// 写入当前主节点,不等待复制
    pub fn submit(&self, ns: Namespace, op: Operation) -> ClusterResult<Arc<OplogEntry>> {
        let primary = self.primary().ok_or(ClusterError::NoPrimary)?;
        self.node(primary)?.submit(ns, op)
    }

    /// 写入并按写确认等待复制
    pub fn write(&self, ns: Namespace, op: Operation, concern: &WriteConcern) -> ClusterResult<WriteAck> {
        let entry = self.submit(ns, op)?;
        self.await_write_concern(&entry, concern)
    }

    /// 持有该条目(相同指纹)的健康成员进度
    pub fn progress_for(&self, entry: &OplogEntry) -> HashMap<MemberId, OpTime> {
        self.nodes
            .iter()
            .filter(|n| n.is_healthy())
            .filter(|n| {
                n.oplog()
                    .find(entry.optime)
                    .map(|e| e.same_as(entry))
                    .unwrap_or(false)
            })
            .filter(|n| n.last_applied() >= entry.optime)
            .map(|n| (n.id(), n.last_applied()))
            .collect()
    }

    /// 写确认需要的确认数;超过持有数据的成员数时立即失败
    pub fn required_acks(&self, optime: OpTime, concern: &WriteConcern) -> ClusterResult<usize> {
        let config = self.membership.current_config();
        let required = concern.required(&config);
        let data_members = config.members.iter().filter(|m| m.is_data_bearing()).count();
        if required > data_members {
            return Err(ClusterError::WriteConcernFailed {
                optime,
                reason: format!(
                    "requires {} acknowledgements but only {} members hold data",
                    required, data_members
                ),
                wtimeout: false,
            });
        }
        Ok(required)
    }

    /// 已确认该条目的持有数据成员数
    pub fn acknowledgements(&self, entry: &OplogEntry) -> usize {
        let config = self.membership.current_config();
        WriteConcern::acknowledged(&config, entry.optime, &self.progress_for(entry))
    }

    /// 按写确认推进轮次,预算由 `wtimeout` 与心跳间隔换算
    pub fn await_write_concern(&self, entry: &OplogEntry, concern: &WriteConcern) -> ClusterResult<WriteAck> {
        let required = self.required_acks(entry.optime, concern)?;
        let interval = self.election.heartbeat_interval_ms.max(1);
        let budget = (concern.wtimeout_ms / interval).max(1);
        let mut acked = 0;
        for _ in 0..=budget {
            acked = self.acknowledgements(entry);
            if acked >= required {
                return Ok(WriteAck {
                    optime: entry.optime,
                    acknowledged_by: acked,
                });
            }
            self.tick()?;
        }
        warn!(
            "Write concern {:?} timed out at {}: {} of {} acknowledged",
            concern.w, entry.optime, acked, required
        );
        Err(ClusterError::WriteConcernFailed {
            optime: entry.optime,
            reason: format!("{} of {} members acknowledged", acked, required),
            wtimeout: true,
        })
    }

    /// 等待所有与主节点可达的健康数据成员应用主节点的最后条目
    pub fn await_replication(&self, max_rounds: usize) -> ClusterResult<usize> {
        self.run_until(|set| set.replication_complete(), max_rounds)
    }

    pub fn replication_complete(&self) -> bool {
        let Some(primary) = self.primary().and_then(|id| self.node(id).ok()) else {
            return false;
        };
        let Some(last) = primary.oplog().last_entry() else {
            return true;
        };
        self.nodes.iter().all(|n| {
            !n.is_data_bearing()
                || !n.is_healthy()
                || !self.network.can_reach(primary.id(), n.id())
                || n.oplog()
                    .find(last.optime)
                    .map(|e| e.same_as(&last) && n.last_applied() >= last.optime)
                    .unwrap_or(false)
        })
    }

    // ---- 管理 ----

    /// 指定同步源
    ///
    /// 目标必须满足与自动选源相同的条件,否则保留当前同步源。
    pub fn sync_from(&self, id: MemberId, target: MemberId) -> ClusterResult<()> {
        let node = self.node(id)?;
        self.node(target)?;
        let req = self.source_request(&node);
        let views = self.reachable_views(&node);
        let view = views.iter().find(|v| v.id == target).ok_or_else(|| {
            ClusterError::SourceIneligible(format!("{} has not heard from {}", id, target))
        })?;
        sync_source::check_eligible(&req, view).map_err(ClusterError::SourceIneligible)?;

        info!("Node {} forced to sync from {}", id, target);
        node.set_forced_sync_source(Some(target));
        if let Some(link) = self.link(id) {
            if link.source() != target {
                self.drop_link(&node);
            }
        }
        Ok(())
    }

    /// 提交新配置;新增成员从空日志开始初始同步
    pub fn reconfig(&self, config: ReplicaSetConfig) -> ClusterResult<()> {
        let primary = self.node(self.primary().ok_or(ClusterError::NoPrimary)?)?;
        self.membership.propose_reconfig(config.clone())?;

        for member in &config.members {
            if !self.nodes.contains_key(&member.id) {
                info!("Adding member {} to replica set {}", member.id, config.name);
                self.spawn_node(member.id, &config);
            }
        }
        let removed: Vec<MemberId> = self
            .member_ids()
            .into_iter()
            .filter(|id| config.member(*id).is_none())
            .collect();
        for id in removed {
            if let Some((_, node)) = self.nodes.remove(&id) {
                info!("Removing member {} from replica set {}", id, config.name);
                self.drop_link(&node);
            }
        }

        primary.adopt_config(&config);
        primary.submit(
            admin_namespace()?,
            Operation::Noop {
                msg: format!("reconfig to version {}", config.version),
            },
        )?;
        Ok(())
    }

    // ---- 观察 ----

    pub fn status(&self) -> ReplSetStatus {
        let config = self.membership.current_config();
        let members: Vec<MemberStatus> = self.nodes.iter().map(|n| n.status()).collect();
        ReplSetStatus::new(config.name.clone(), config.version, members)
    }

    pub fn member_status(&self, id: MemberId) -> ClusterResult<MemberStatus> {
        Ok(self.node(id)?.status())
    }

    /// 成员最近一次完成的回滚
    pub fn last_rollback(&self, id: MemberId) -> Option<RollbackReport> {
        self.rollbacks.get(&id).map(|r| r.value().clone())
    }

    /// 成员在命名空间中的文档数
    pub fn count(&self, id: MemberId, ns: &Namespace) -> ClusterResult<usize> {
        Ok(self.node(id)?.storage().count(ns))
    }

    /// 比较两个成员的 oplog;`include_noops` 为 false 时只比较数据条目
    pub fn oplogs_match(&self, a: MemberId, b: MemberId, include_noops: bool) -> ClusterResult<bool> {
        let pick = |id: MemberId| -> ClusterResult<Vec<Arc<OplogEntry>>> {
            Ok(self
                .node(id)?
                .oplog()
                .snapshot()
                .into_iter()
                .filter(|e| include_noops || !e.op.is_noop())
                .collect())
        };
        let (left, right) = (pick(a)?, pick(b)?);
        Ok(left.len() == right.len() && left.iter().zip(&right).all(|(l, r)| l.same_as(r)))
    }

    /// 所有持有数据的成员 oplog 是否完全一致
    pub fn all_oplogs_match(&self) -> ClusterResult<bool> {
        let ids: Vec<MemberId> = self
            .member_ids()
            .into_iter()
            .filter(|id| self.node(*id).map(|n| n.is_data_bearing()).unwrap_or(false))
            .collect();
        let Some((first, rest)) = ids.split_first() else {
            return Ok(true);
        };
        for id in rest {
            if !self.oplogs_match(*first, *id, true)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// 关闭所有链路
    pub fn close_links(&self) {
        for link in self.links.iter() {
            link.close();
        }
        self.links.clear();
    }
}
