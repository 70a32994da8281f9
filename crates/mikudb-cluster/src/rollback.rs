//! 回滚协调
//!
//! 节点发现自己的历史与同步源分叉后,撤销共同点之后只存在于本地的条目:
//!
//! 1. 在两份日志的稳定快照上从后向前寻找共同点
//! 2. 收集本地独有条目触及的文档,只保留本节点过滤器允许的命名空间
//! 3. 逐个向源取回这些文档的当前版本,每次取回前确认源仍然可用
//! 4. 截断 oplog,写回取到的版本(源上不存在即删除),重置应用位置
//!
//! 之后节点从共同点开始尾随源,追上后回到 Secondary。第 4 步之前任何失败
//! 都不会改动本地状态,节点保持 Rollback 并可换源重试。

use crate::config::MemberId;
use crate::error::{ClusterError, ClusterResult};
use crate::filter;
use crate::network::Network;
use crate::node::{ReplNode, RollbackPhase};
use crate::oplog::{OpTime, OplogEntry};
use mikudb_common::{Namespace, ObjectId};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 共同点查找结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommonPoint {
    /// 本地应用位置在源上完全相同,无需回滚
    InSync(OpTime),
    /// 本地在 `optime` 之后有 `local_only` 条独有条目
    Diverged { optime: OpTime, local_only: usize },
}

impl CommonPoint {
    pub fn optime(&self) -> OpTime {
        match self {
            Self::InSync(t) | Self::Diverged { optime: t, .. } => *t,
        }
    }
}

/// 在两份日志快照上寻找共同点
///
/// 只考虑不超过 `last_applied` 的本地条目。本地为空时共同点是日志起点;
/// 本地有条目而没有任何一条与源相同时返回 `NoCommonPoint`。
pub fn find_common_point(
    local: &[Arc<OplogEntry>],
    last_applied: OpTime,
    source: &[Arc<OplogEntry>],
    source_id: MemberId,
) -> ClusterResult<CommonPoint> {
    let upto = local.partition_point(|e| e.optime <= last_applied);
    let local = &local[..upto];

    for (idx, entry) in local.iter().enumerate().rev() {
        let found = source
            .binary_search_by(|s| s.optime.cmp(&entry.optime))
            .ok()
            .map(|pos| source[pos].same_as(entry))
            .unwrap_or(false);
        if found {
            let local_only = local.len() - idx - 1;
            return Ok(if local_only == 0 {
                CommonPoint::InSync(entry.optime)
            } else {
                CommonPoint::Diverged {
                    optime: entry.optime,
                    local_only,
                }
            });
        }
    }

    if local.is_empty() {
        return Ok(CommonPoint::InSync(OpTime::ZERO));
    }
    Err(ClusterError::NoCommonPoint {
        source_id,
        local: last_applied,
    })
}

/// 回滚报告
#[derive(Debug, Clone, Default)]
pub struct RollbackReport {
    pub common_point: OpTime,
    /// 被截断的本地条目数
    pub truncated: usize,
    /// 从源取回(或删除)的文档
    pub refetched: Vec<(Namespace, ObjectId)>,
    /// 因不在过滤器内而跳过的本地条目数
    pub skipped_filtered: usize,
}

/// 回滚协调器
pub struct RollbackCoordinator<'a> {
    node: &'a ReplNode,
    source: &'a ReplNode,
    network: &'a Network,
}

impl<'a> RollbackCoordinator<'a> {
    pub fn new(node: &'a ReplNode, source: &'a ReplNode, network: &'a Network) -> Self {
        Self {
            node,
            source,
            network,
        }
    }

    /// 执行回滚
    ///
    /// 成功后节点处于 `CatchingUp` 阶段,等待链路从共同点追赶。
    pub fn run(&self) -> ClusterResult<RollbackReport> {
        let node_id = self.node.id();
        let source_id = self.source.id();
        self.ensure_source_usable()?;
        self.node
            .set_rollback_phase(RollbackPhase::Fetching { source: source_id });

        let local = self.node.oplog().snapshot();
        let remote = self.source.oplog().snapshot();
        let last_applied = self.node.last_applied();

        let common = match find_common_point(&local, last_applied, &remote, source_id) {
            Ok(common) => common,
            Err(e) => {
                self.node.set_rollback_phase(RollbackPhase::Pending);
                return Err(e);
            }
        };
        info!(
            "Node {} rolling back against {}: common point {:?}",
            node_id, source_id, common
        );

        let common_point = common.optime();
        let mut report = RollbackReport {
            common_point,
            ..Default::default()
        };

        let node_filter = self.node.filter();
        let mut touched: BTreeSet<(Namespace, ObjectId)> = BTreeSet::new();
        for entry in local.iter().filter(|e| e.optime > common_point && e.optime <= last_applied) {
            let Some(id) = entry.op.document_id() else {
                continue;
            };
            if filter::permits(node_filter.as_ref(), &entry.ns) {
                touched.insert((entry.ns.clone(), id));
            } else {
                report.skipped_filtered += 1;
            }
        }

        let mut fetched: Vec<(Namespace, ObjectId, Option<Value>)> = Vec::with_capacity(touched.len());
        for (ns, id) in touched {
            if let Err(e) = self.ensure_source_usable() {
                self.node.set_rollback_phase(RollbackPhase::Pending);
                return Err(e);
            }
            let doc = match self.source.fetch_document(&ns, &id) {
                Ok(doc) => doc,
                Err(e) => {
                    self.node.set_rollback_phase(RollbackPhase::Pending);
                    return Err(ClusterError::RollbackAborted(e.to_string()));
                }
            };
            debug!(
                "Node {} refetched {} {} from {}: {}",
                node_id,
                ns,
                id,
                source_id,
                if doc.is_some() { "present" } else { "absent" }
            );
            fetched.push((ns, id, doc));
        }

        let removed = self.node.oplog().truncate_after(common_point);
        report.truncated = removed.len();
        let storage = self.node.storage();
        for (ns, id, doc) in fetched {
            storage.restore(&ns, id, doc);
            report.refetched.push((ns, id));
        }
        self.node.reset_applied(common_point);
        self.node
            .set_rollback_phase(RollbackPhase::CatchingUp { source: source_id });

        info!(
            "Node {} rolled back {} entries to {}, refetched {} documents, skipped {} filtered",
            node_id,
            report.truncated,
            common_point,
            report.refetched.len(),
            report.skipped_filtered
        );
        Ok(report)
    }

    fn ensure_source_usable(&self) -> ClusterResult<()> {
        let source_id = self.source.id();
        if !self.network.can_reach(self.node.id(), source_id) {
            warn!("Rollback source {} became unreachable", source_id);
            return Err(ClusterError::RollbackAborted(format!(
                "source {} unreachable",
                source_id
            )));
        }
        if !self.source.is_healthy() || self.source.rollback_phase().is_some() {
            return Err(ClusterError::RollbackAborted(format!(
                "source {} is no longer eligible",
                source_id
            )));
        }
        if !filter::filter_covers(self.node.filter().as_ref(), self.source.filter().as_ref()) {
            return Err(ClusterError::RollbackAborted(format!(
                "source {} does not cover {}",
                source_id,
                self.node.id()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemberConfig;
    use crate::node::NodeRole;
    use crate::oplog::Operation;
    use crate::storage::{MemoryStorage, StorageApplier};
    use serde_json::json;

    fn e(term: u64, counter: u64, tag: &str) -> Arc<OplogEntry> {
        Arc::new(OplogEntry::new(
            OpTime::new(term, counter),
            Namespace::parse("a.b").unwrap(),
            Operation::Noop { msg: tag.to_string() },
        ))
    }

    #[test]
    fn test_common_point_walk_back() {
        let shared = vec![e(1, 1, "x"), e(1, 2, "y")];
        let mut local = shared.clone();
        local.extend([e(2, 1, "local"), e(2, 2, "local")]);
        let mut source = shared.clone();
        source.extend([e(3, 1, "remote")]);

        let cp = find_common_point(&local, OpTime::new(2, 2), &source, MemberId(0)).unwrap();
        assert_eq!(cp, CommonPoint::Diverged { optime: OpTime::new(1, 2), local_only: 2 });

        let cp = find_common_point(&shared, OpTime::new(1, 2), &source, MemberId(0)).unwrap();
        assert_eq!(cp, CommonPoint::InSync(OpTime::new(1, 2)));
    }

    #[test]
    fn test_same_optime_different_entry_is_not_common() {
        let local = vec![e(1, 1, "x"), e(2, 1, "local")];
        let source = vec![local[0].clone(), e(2, 1, "remote")];
        let cp = find_common_point(&local, OpTime::new(2, 1), &source, MemberId(0)).unwrap();
        assert_eq!(cp.optime(), OpTime::new(1, 1));
    }

    #[test]
    fn test_no_common_point() {
        let local = vec![e(1, 1, "a")];
        let source = vec![e(1, 1, "b")];
        let err = find_common_point(&local, OpTime::new(1, 1), &source, MemberId(3)).unwrap_err();
        assert_eq!(
            err,
            ClusterError::NoCommonPoint { source_id: MemberId(3), local: OpTime::new(1, 1) }
        );
        assert!(err.is_fatal());

        let cp = find_common_point(&[], OpTime::ZERO, &source, MemberId(3)).unwrap();
        assert_eq!(cp, CommonPoint::InSync(OpTime::ZERO));
    }

    fn primary(id: u32, term: u64) -> ReplNode {
        let n = ReplNode::new(MemberConfig::new(id), 1, Arc::new(MemoryStorage::new()));
        n.observe_term(term - 1);
        let t = n.start_candidacy();
        n.become_primary(t).unwrap();
        n
    }

    fn follow(dest: &ReplNode, src: &ReplNode) {
        dest.set_sync_source(Some(src.id()));
        dest.apply_batch(src.id(), &src.oplog().snapshot()).unwrap();
    }

    #[test]
    fn test_rollback_restores_source_documents() {
        let ns = Namespace::parse("a.b").unwrap();
        let winner = primary(0, 1);
        let shared_id = ObjectId::new();
        winner
            .submit(ns.clone(), Operation::Insert { id: shared_id, doc: json!({"v": 1}) })
            .unwrap();

        let loser = ReplNode::new(MemberConfig::new(1), 1, Arc::new(MemoryStorage::new()));
        follow(&loser, &winner);
        let common = loser.last_applied();

        // loser 在任期 2 成为主节点并写入,winner 在任期 3 写入
        loser.observe_term(1);
        let t = loser.start_candidacy();
        loser.become_primary(t).unwrap();
        let orphan = ObjectId::new();
        loser
            .submit(ns.clone(), Operation::Insert { id: orphan, doc: json!({"v": 0}) })
            .unwrap();
        loser
            .submit(ns.clone(), Operation::Update { id: shared_id, doc: json!({"v": 2}) })
            .unwrap();
        loser.observe_term(3);
        assert!(loser.enter_rollback(MemberId(0)));

        winner.observe_term(2);
        let t = winner.start_candidacy();
        winner.become_primary(t).unwrap();
        winner
            .submit(ns.clone(), Operation::Update { id: shared_id, doc: json!({"v": 3}) })
            .unwrap();

        let net = Network::new();
        let report = RollbackCoordinator::new(&loser, &winner, &net).run().unwrap();
        assert_eq!(report.common_point, common);
        assert_eq!(report.truncated, 3);
        assert_eq!(report.refetched.len(), 2);
        assert_eq!(loser.last_applied(), common);
        assert_eq!(loser.storage().find(&ns, &orphan), None);
        assert_eq!(loser.storage().find(&ns, &shared_id), Some(json!({"v": 3})));
        assert_eq!(
            loser.rollback_phase(),
            Some(RollbackPhase::CatchingUp { source: MemberId(0) })
        );

        // 再次寻找共同点时已经同步
        let cp = find_common_point(
            &loser.oplog().snapshot(),
            loser.last_applied(),
            &winner.oplog().snapshot(),
            MemberId(0),
        )
        .unwrap();
        assert_eq!(cp, CommonPoint::InSync(common));
    }

    #[test]
    fn test_rollback_aborts_when_source_unreachable() {
        let winner = primary(0, 1);
        let loser = ReplNode::new(MemberConfig::new(1), 1, Arc::new(MemoryStorage::new()));
        follow(&loser, &winner);
        assert!(loser.enter_rollback(MemberId(0)));
        let before = loser.oplog().len();

        let net = Network::new();
        net.disconnect(MemberId(0), MemberId(1));
        let err = RollbackCoordinator::new(&loser, &winner, &net).run().unwrap_err();
        assert!(matches!(err, ClusterError::RollbackAborted(_)));
        assert_eq!(loser.role(), NodeRole::Rollback);
        assert_eq!(loser.rollback_phase(), Some(RollbackPhase::Pending));
        assert_eq!(loser.oplog().len(), before);
    }

    /// 第一次被读取文档后切断与 `peer` 的连接
    struct CutAfterFirstFind {
        inner: MemoryStorage,
        network: Arc<Network>,
        owner: MemberId,
        peer: MemberId,
    }

    impl StorageApplier for CutAfterFirstFind {
        fn apply(&self, entry: &OplogEntry) -> Result<(), crate::storage::StorageApplyError> {
            self.inner.apply(entry)
        }

        fn find(&self, ns: &Namespace, id: &ObjectId) -> Option<Value> {
            self.network.disconnect(self.owner, self.peer);
            self.inner.find(ns, id)
        }

        fn restore(&self, ns: &Namespace, id: ObjectId, doc: Option<Value>) {
            self.inner.restore(ns, id, doc)
        }

        fn count(&self, ns: &Namespace) -> usize {
            self.inner.count(ns)
        }

        fn documents(&self, ns: &Namespace) -> Vec<(ObjectId, Value)> {
            self.inner.documents(ns)
        }
    }

    #[test]
    fn test_rollback_aborts_when_source_lost_between_fetches() {
        let ns = Namespace::parse("a.b").unwrap();
        let net = Arc::new(Network::new());
        let winner = ReplNode::new(
            MemberConfig::new(0),
            1,
            Arc::new(CutAfterFirstFind {
                inner: MemoryStorage::new(),
                network: net.clone(),
                owner: MemberId(0),
                peer: MemberId(1),
            }),
        );
        let t = winner.start_candidacy();
        winner.become_primary(t).unwrap();

        let loser = ReplNode::new(MemberConfig::new(1), 1, Arc::new(MemoryStorage::new()));
        follow(&loser, &winner);

        loser.observe_term(1);
        let t = loser.start_candidacy();
        loser.become_primary(t).unwrap();
        for v in 0..2 {
            loser
                .submit(ns.clone(), Operation::Insert { id: ObjectId::new(), doc: json!({"v": v}) })
                .unwrap();
        }
        loser.observe_term(3);
        assert!(loser.enter_rollback(MemberId(0)));
        let before = loser.oplog().len();
        let applied = loser.last_applied();

        winner.observe_term(2);
        let t = winner.start_candidacy();
        winner.become_primary(t).unwrap();

        let err = RollbackCoordinator::new(&loser, &winner, &net).run().unwrap_err();
        assert!(matches!(err, ClusterError::RollbackAborted(_)));
        assert!(!net.can_reach(MemberId(0), MemberId(1)));
        assert_eq!(loser.role(), NodeRole::Rollback);
        assert_eq!(loser.rollback_phase(), Some(RollbackPhase::Pending));
        assert_eq!(loser.oplog().len(), before);
        assert_eq!(loser.last_applied(), applied);
        assert_eq!(loser.storage().count(&ns), 2);
    }
}
