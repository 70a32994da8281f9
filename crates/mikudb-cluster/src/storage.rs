//! 存储应用接口
//!
//! 复制引擎把每个允许的 oplog 条目交给 [`StorageApplier`]。应用是幂等的:
//! 插入与更新都按整文档覆盖,删除不存在的文档不报错,这样至少一次投递
//! 和回滚后的重新应用都不会出错。

use crate::oplog::{OplogEntry, Operation};
use dashmap::{DashMap, DashSet};
use mikudb_common::{Namespace, ObjectId};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tracing::trace;

/// 存储应用失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct StorageApplyError(pub String);

/// 外部存储应用函数
pub trait StorageApplier: Send + Sync {
    /// 应用一个条目
    fn apply(&self, entry: &OplogEntry) -> Result<(), StorageApplyError>;

    /// 读取文档当前版本,回滚时由同步源提供
    fn find(&self, ns: &Namespace, id: &ObjectId) -> Option<Value>;

    /// 回滚撤销:写回取到的版本,`None` 表示删除
    fn restore(&self, ns: &Namespace, id: ObjectId, doc: Option<Value>);

    /// 命名空间内的文档数
    fn count(&self, ns: &Namespace) -> usize;

    /// 命名空间内的全部文档,按 ID 排序
    fn documents(&self, ns: &Namespace) -> Vec<(ObjectId, Value)>;
}

/// 内存存储
#[derive(Default)]
pub struct MemoryStorage {
    collections: DashMap<Namespace, HashMap<ObjectId, Value>>,
    failing: DashSet<Namespace>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// 让该命名空间上的后续应用失败,用于演练致命应用错误
    pub fn inject_failure(&self, ns: Namespace) {
        self.failing.insert(ns);
    }

    pub fn clear_failure(&self, ns: &Namespace) {
        self.failing.remove(ns);
    }

    /// 当前持有文档的命名空间
    pub fn namespaces(&self) -> Vec<Namespace> {
        let mut out: Vec<Namespace> = self
            .collections
            .iter()
            .filter(|c| !c.value().is_empty())
            .map(|c| c.key().clone())
            .collect();
        out.sort();
        out
    }
}

impl StorageApplier for MemoryStorage {
    fn apply(&self, entry: &OplogEntry) -> Result<(), StorageApplyError> {
        if self.failing.contains(&entry.ns) {
            return Err(StorageApplyError(format!(
                "storage refused write to {}",
                entry.ns
            )));
        }
        trace!("Applying {}", entry);
        match &entry.op {
            Operation::Insert { id, doc } | Operation::Update { id, doc } => {
                self.collections
                    .entry(entry.ns.clone())
                    .or_default()
                    .insert(*id, doc.clone());
            }
            Operation::Delete { id } => {
                if let Some(mut coll) = self.collections.get_mut(&entry.ns) {
                    coll.remove(id);
                }
            }
            Operation::Noop { .. } => {}
        }
        Ok(())
    }

    fn find(&self, ns: &Namespace, id: &ObjectId) -> Option<Value> {
        self.collections.get(ns).and_then(|c| c.get(id).cloned())
    }

    fn restore(&self, ns: &Namespace, id: ObjectId, doc: Option<Value>) {
        match doc {
            Some(doc) => {
                self.collections.entry(ns.clone()).or_default().insert(id, doc);
            }
            None => {
                if let Some(mut coll) = self.collections.get_mut(ns) {
                    coll.remove(&id);
                }
            }
        }
    }

    fn count(&self, ns: &Namespace) -> usize {
        self.collections.get(ns).map(|c| c.len()).unwrap_or(0)
    }

    fn documents(&self, ns: &Namespace) -> Vec<(ObjectId, Value)> {
        let mut docs: Vec<(ObjectId, Value)> = self
            .collections
            .get(ns)
            .map(|c| c.iter().map(|(k, v)| (*k, v.clone())).collect())
            .unwrap_or_default();
        docs.sort_by(|a, b| a.0.cmp(&b.0));
        docs
    }
}
