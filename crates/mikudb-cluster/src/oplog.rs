//! 操作日志(oplog)存储
//!
//! 每个节点持有一份只追加、全序的 oplog。条目按 [`OpTime`] `(term, counter)`
//! 字典序排列,只能追加,或在回滚时从尾部截断。
//!
//! 读写模型:
//! - 追加与截断持有写锁,互相排斥
//! - 尾随读取每批只短暂持有读锁,可以与追加并发
//! - 回滚寻找共同点时使用 [`Oplog::snapshot`] 得到稳定快照

use crate::error::{ClusterError, ClusterResult};
use crate::MemberId;
use chrono::{DateTime, Utc};
use mikudb_common::{Namespace, ObjectId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};
use xxhash_rust::xxh3::Xxh3;

/// 逻辑时间戳 `(term, counter)`
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct OpTime {
    pub term: u64,
    pub counter: u64,
}

impl OpTime {
    /// 早于任何真实条目的位置
    pub const ZERO: OpTime = OpTime { term: 0, counter: 0 };

    pub fn new(term: u64, counter: u64) -> Self {
        Self { term, counter }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.term, self.counter)
    }
}

/// 条目携带的操作
///
/// `Update` 为整文档替换,回滚时需要从同步源取回前像。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Operation {
    #[serde(rename = "i")]
    Insert { id: ObjectId, doc: Value },
    #[serde(rename = "u")]
    Update { id: ObjectId, doc: Value },
    #[serde(rename = "d")]
    Delete { id: ObjectId },
    #[serde(rename = "n")]
    Noop { msg: String },
}

impl Operation {
    /// 操作类型的单字符代码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Insert { .. } => "i",
            Self::Update { .. } => "u",
            Self::Delete { .. } => "d",
            Self::Noop { .. } => "n",
        }
    }

    /// 操作涉及的文档 ID,Noop 没有
    pub fn document_id(&self) -> Option<ObjectId> {
        match self {
            Self::Insert { id, .. } | Self::Update { id, .. } | Self::Delete { id } => Some(*id),
            Self::Noop { .. } => None,
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, Self::Noop { .. })
    }
}

/// oplog 条目
///
/// 创建后不可变。`fingerprint` 覆盖条目的全部内容,用于判断两份日志中
/// 同一 optime 的条目是否真正相同。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OplogEntry {
    pub optime: OpTime,
    pub writer_term: u64,
    pub wall: DateTime<Utc>,
    pub ns: Namespace,
    pub op: Operation,
    fingerprint: u64,
}

impl OplogEntry {
    pub fn new(optime: OpTime, ns: Namespace, op: Operation) -> Self {
        Self::with_wall(optime, optime.term, Utc::now(), ns, op)
    }

    pub fn with_wall(
        optime: OpTime,
        writer_term: u64,
        wall: DateTime<Utc>,
        ns: Namespace,
        op: Operation,
    ) -> Self {
        let fingerprint = compute_fingerprint(optime, writer_term, &wall, &ns, &op);
        Self {
            optime,
            writer_term,
            wall,
            ns,
            op,
            fingerprint,
        }
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// 与另一条目在 optime 和内容上是否完全相同
    pub fn same_as(&self, other: &OplogEntry) -> bool {
        self.optime == other.optime && self.fingerprint == other.fingerprint
    }
}

impl fmt::Display for OplogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.optime, self.op.code(), self.ns)
    }
}

fn compute_fingerprint(
    optime: OpTime,
    writer_term: u64,
    wall: &DateTime<Utc>,
    ns: &Namespace,
    op: &Operation,
) -> u64 {
    let mut hasher = Xxh3::new();
    hasher.update(&optime.term.to_le_bytes());
    hasher.update(&optime.counter.to_le_bytes());
    hasher.update(&writer_term.to_le_bytes());
    hasher.update(&wall.timestamp_millis().to_le_bytes());
    hasher.update(ns.to_string().as_bytes());
    hasher.update(op.code().as_bytes());
    match op {
        Operation::Insert { id, doc } | Operation::Update { id, doc } => {
            hasher.update(id.as_bytes());
            hasher.update(doc.to_string().as_bytes());
        }
        Operation::Delete { id } => hasher.update(id.as_bytes()),
        Operation::Noop { msg } => hasher.update(msg.as_bytes()),
    }
    hasher.digest()
}

struct OplogInner {
    entries: Vec<Arc<OplogEntry>>,
    highest_term: u64,
}

impl OplogInner {
    fn position_of(&self, optime: OpTime) -> Result<usize, usize> {
        self.entries.binary_search_by(|e| e.optime.cmp(&optime))
    }
}

/// 单个节点的 oplog
pub struct Oplog {
    owner: MemberId,
    inner: RwLock<OplogInner>,
    last_tx: watch::Sender<OpTime>,
}

impl Oplog {
    pub fn new(owner: MemberId) -> Self {
        let (last_tx, _) = watch::channel(OpTime::ZERO);
        Self {
            owner,
            inner: RwLock::new(OplogInner {
                entries: Vec::new(),
                highest_term: 0,
            }),
            last_tx,
        }
    }

    pub fn owner(&self) -> MemberId {
        self.owner
    }

    /// 追加条目,返回其位置
    ///
    /// 写入者任期低于已记录的最高任期时返回 `TermConflict`,
    /// optime 未严格递增时返回 `OutOfOrder`。
    pub fn append(&self, entry: Arc<OplogEntry>) -> ClusterResult<usize> {
        let mut inner = self.inner.write();
        if entry.writer_term < inner.highest_term {
            warn!(
                "Node {} rejected entry {} from stale writer term {} (log term {})",
                self.owner, entry.optime, entry.writer_term, inner.highest_term
            );
            return Err(ClusterError::TermConflict {
                entry_term: entry.writer_term,
                log_term: inner.highest_term,
            });
        }
        if let Some(last) = inner.entries.last() {
            if entry.optime <= last.optime {
                return Err(ClusterError::OutOfOrder {
                    optime: entry.optime,
                    last: last.optime,
                });
            }
        }
        let optime = entry.optime;
        inner.highest_term = inner.highest_term.max(entry.writer_term);
        inner.entries.push(entry);
        let position = inner.entries.len() - 1;
        drop(inner);

        self.last_tx.send_replace(optime);
        Ok(position)
    }

    pub fn last_optime(&self) -> OpTime {
        self.inner
            .read()
            .entries
            .last()
            .map(|e| e.optime)
            .unwrap_or(OpTime::ZERO)
    }

    pub fn last_entry(&self) -> Option<Arc<OplogEntry>> {
        self.inner.read().entries.last().cloned()
    }

    pub fn highest_term(&self) -> u64 {
        self.inner.read().highest_term
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    pub fn find(&self, optime: OpTime) -> Option<Arc<OplogEntry>> {
        let inner = self.inner.read();
        inner
            .position_of(optime)
            .ok()
            .map(|pos| inner.entries[pos].clone())
    }

    /// 是否包含 optime 与指纹都相同的条目;`OpTime::ZERO` 视为总是存在
    pub fn contains(&self, optime: OpTime, fingerprint: u64) -> bool {
        if optime.is_zero() {
            return true;
        }
        self.find(optime)
            .map(|e| e.fingerprint() == fingerprint)
            .unwrap_or(false)
    }

    /// 返回严格晚于 `after` 的最多 `limit` 个条目
    pub fn entries_after(&self, after: OpTime, limit: usize) -> Vec<Arc<OplogEntry>> {
        let inner = self.inner.read();
        let start = match inner.position_of(after) {
            Ok(pos) => pos + 1,
            Err(pos) => pos,
        };
        inner.entries[start..]
            .iter()
            .take(limit)
            .cloned()
            .collect()
    }

    /// 严格晚于 `after` 的条目数量
    pub fn count_after(&self, after: OpTime) -> usize {
        let inner = self.inner.read();
        let start = match inner.position_of(after) {
            Ok(pos) => pos + 1,
            Err(pos) => pos,
        };
        inner.entries.len() - start
    }

    /// 从 `after` 之后开始尾随读取
    ///
    /// `anchor` 是读取方在 `after` 处条目的指纹;每批读取前都会校验本日志
    /// 仍然持有相同的条目,否则报告分叉。
    pub fn read_from(self: &Arc<Self>, after: OpTime, anchor: Option<u64>) -> OplogCursor {
        OplogCursor {
            oplog: Arc::clone(self),
            last: after,
            anchor,
        }
    }

    /// 丢弃 `optime` 之后的所有条目,返回被丢弃的条目(按日志顺序)
    ///
    /// 仅供回滚使用,不可逆。
    pub fn truncate_after(&self, optime: OpTime) -> Vec<Arc<OplogEntry>> {
        let mut inner = self.inner.write();
        let keep = match inner.position_of(optime) {
            Ok(pos) => pos + 1,
            Err(pos) => pos,
        };
        let removed = inner.entries.split_off(keep);
        inner.highest_term = inner
            .entries
            .iter()
            .map(|e| e.writer_term)
            .max()
            .unwrap_or(0);
        let last = inner.entries.last().map(|e| e.optime).unwrap_or(OpTime::ZERO);
        drop(inner);

        if !removed.is_empty() {
            debug!(
                "Node {} truncated {} entries after {}",
                self.owner,
                removed.len(),
                optime
            );
        }
        self.last_tx.send_replace(last);
        removed
    }

    /// 整个日志的稳定快照
    pub fn snapshot(&self) -> Vec<Arc<OplogEntry>> {
        self.inner.read().entries.clone()
    }

    /// 订阅最后 optime 的变化,异步应用循环用它在追加时被唤醒
    pub fn subscribe(&self) -> watch::Receiver<OpTime> {
        self.last_tx.subscribe()
    }
}

/// oplog 尾随游标
///
/// 可重启:游标只记录位置,任何时候都可以基于同一位置重新打开。
pub struct OplogCursor {
    oplog: Arc<Oplog>,
    last: OpTime,
    anchor: Option<u64>,
}

impl OplogCursor {
    /// 读取下一批条目
    ///
    /// 如果源日志不再持有游标位置上的同一条目,返回 `Diverged`。
    pub fn next_batch(&mut self, limit: usize) -> ClusterResult<Vec<Arc<OplogEntry>>> {
        if let Some(anchor) = self.anchor {
            if !self.oplog.contains(self.last, anchor) {
                return Err(ClusterError::Diverged {
                    source_id: self.oplog.owner(),
                    local: self.last,
                });
            }
        }
        let batch = self.oplog.entries_after(self.last, limit);
        if let Some(last) = batch.last() {
            self.last = last.optime;
            self.anchor = Some(last.fingerprint());
        }
        Ok(batch)
    }

    pub fn position(&self) -> OpTime {
        self.last
    }

    /// 源日志在游标之后剩余的条目数
    pub fn remaining(&self) -> usize {
        self.oplog.count_after(self.last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ns(s: &str) -> Namespace {
        Namespace::parse(s).unwrap()
    }

    fn insert(term: u64, counter: u64) -> Arc<OplogEntry> {
        Arc::new(OplogEntry::new(
            OpTime::new(term, counter),
            ns("included.included"),
            Operation::Insert {
                id: ObjectId::new(),
                doc: json!({"n": counter}),
            },
        ))
    }

    #[test]
    fn test_optime_ordering_is_lexicographic() {
        assert!(OpTime::new(1, 100) < OpTime::new(2, 1));
        assert!(OpTime::new(2, 1) < OpTime::new(2, 2));
        assert!(OpTime::ZERO < OpTime::new(0, 1));
    }

    #[test]
    fn test_append_and_read() {
        let oplog = Oplog::new(MemberId(0));
        assert_eq!(oplog.append(insert(1, 1)).unwrap(), 0);
        assert_eq!(oplog.append(insert(1, 2)).unwrap(), 1);
        assert_eq!(oplog.last_optime(), OpTime::new(1, 2));
        assert_eq!(oplog.entries_after(OpTime::ZERO, 10).len(), 2);
        assert_eq!(oplog.entries_after(OpTime::new(1, 1), 10).len(), 1);
        assert_eq!(oplog.count_after(OpTime::new(1, 2)), 0);
    }

    #[test]
    fn test_append_rejects_stale_term() {
        let oplog = Oplog::new(MemberId(0));
        oplog.append(insert(2, 1)).unwrap();
        let err = oplog.append(insert(1, 5)).unwrap_err();
        assert_eq!(
            err,
            ClusterError::TermConflict {
                entry_term: 1,
                log_term: 2
            }
        );
    }

    #[test]
    fn test_append_rejects_out_of_order() {
        let oplog = Oplog::new(MemberId(0));
        oplog.append(insert(1, 2)).unwrap();
        assert!(matches!(
            oplog.append(insert(1, 2)),
            Err(ClusterError::OutOfOrder { .. })
        ));
    }

    #[test]
    fn test_truncate_after() {
        let oplog = Oplog::new(MemberId(0));
        for c in 1..=3 {
            oplog.append(insert(1, c)).unwrap();
        }
        oplog.append(insert(2, 1)).unwrap();

        let removed = oplog.truncate_after(OpTime::new(1, 2));
        assert_eq!(removed.len(), 2);
        assert_eq!(removed[0].optime, OpTime::new(1, 3));
        assert_eq!(oplog.last_optime(), OpTime::new(1, 2));
        assert_eq!(oplog.highest_term(), 1);

        // 截断后可以接受新任期的条目
        oplog.append(insert(3, 1)).unwrap();
        assert_eq!(oplog.len(), 3);
    }

    #[test]
    fn test_cursor_detects_divergence() {
        let source = Arc::new(Oplog::new(MemberId(1)));
        let shared = insert(1, 1);
        source.append(shared.clone()).unwrap();
        source.append(insert(1, 2)).unwrap();

        let mut cursor = source.read_from(shared.optime, Some(shared.fingerprint()));
        assert_eq!(cursor.next_batch(10).unwrap().len(), 1);
        assert_eq!(cursor.position(), OpTime::new(1, 2));

        // 读取方持有一个源日志中不存在的条目
        let foreign = insert(1, 2);
        let mut cursor = source.read_from(foreign.optime, Some(foreign.fingerprint()));
        assert!(matches!(
            cursor.next_batch(10),
            Err(ClusterError::Diverged { .. })
        ));
    }

    #[test]
    fn test_fingerprint_covers_content() {
        let id = ObjectId::new();
        let wall = Utc::now();
        let a = OplogEntry::with_wall(
            OpTime::new(1, 1),
            1,
            wall,
            ns("a.b"),
            Operation::Insert { id, doc: json!({"n": 1}) },
        );
        let b = OplogEntry::with_wall(
            OpTime::new(1, 1),
            1,
            wall,
            ns("a.b"),
            Operation::Insert { id, doc: json!({"n": 2}) },
        );
        assert!(!a.same_as(&b));
        assert!(a.same_as(&a.clone()));
    }

    #[tokio::test]
    async fn test_subscribe_sees_appends() {
        let oplog = Oplog::new(MemberId(0));
        let mut rx = oplog.subscribe();
        oplog.append(insert(1, 1)).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), OpTime::new(1, 1));
    }
}
