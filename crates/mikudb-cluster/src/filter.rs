//! 命名空间过滤器
//!
//! 过滤节点只为允许列表中的命名空间保存数据。模式有两种:
//! - `db`: 覆盖整个数据库
//! - `db.coll`: 精确匹配一个集合
//!
//! 承载协议元数据的管理命名空间(`admin.*`、`local.*`)总是被允许。

use mikudb_common::{Namespace, ADMIN_DB, LOCAL_DB};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// 命名空间允许列表
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct NamespaceFilter {
    patterns: BTreeSet<String>,
}

impl NamespaceFilter {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(String::as_str)
    }

    /// 命名空间是否被允许
    pub fn permits(&self, ns: &Namespace) -> bool {
        if ns.is_admin() {
            return true;
        }
        let db = ns.db().as_str();
        self.patterns.iter().any(|p| match p.split_once('.') {
            Some((pdb, pcoll)) => pdb == db && pcoll == ns.coll().as_str(),
            None => p == db,
        })
    }

    /// 单个模式是否被本过滤器覆盖
    fn covers_pattern(&self, pattern: &str) -> bool {
        let db = pattern.split_once('.').map(|(db, _)| db).unwrap_or(pattern);
        if db == ADMIN_DB || db == LOCAL_DB {
            return true;
        }
        self.patterns.contains(pattern) || self.patterns.contains(db)
    }

    /// 本过滤器允许的全部命名空间是否都被 `other` 允许
    pub fn is_subset_of(&self, other: &NamespaceFilter) -> bool {
        self.patterns().all(|p| other.covers_pattern(p))
    }
}

/// `None` 表示完整副本
///
/// 请求方需要的命名空间是否都能由候选方提供。
pub fn filter_covers(requester: Option<&NamespaceFilter>, candidate: Option<&NamespaceFilter>) -> bool {
    match (requester, candidate) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(req), Some(cand)) => req.is_subset_of(cand),
    }
}

/// 按节点过滤器判断命名空间,`None` 表示完整副本
pub fn permits(filter: Option<&NamespaceFilter>, ns: &Namespace) -> bool {
    filter.map(|f| f.permits(ns)).unwrap_or(true)
}

impl From<Vec<String>> for NamespaceFilter {
    fn from(patterns: Vec<String>) -> Self {
        Self::new(patterns)
    }
}

impl From<NamespaceFilter> for Vec<String> {
    fn from(filter: NamespaceFilter) -> Self {
        filter.patterns.into_iter().collect()
    }
}

impl fmt::Display for NamespaceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<&str> = self.patterns().collect();
        write!(f, "[{}]", joined.join(", "))
    }
}
