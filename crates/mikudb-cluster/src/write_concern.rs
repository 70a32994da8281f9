//! 写确认
//!
//! 写确认在主节点追加之后,根据各成员的复制进度判断。过滤节点也计入确认:
//! 它们会推进自己的复制位置,即使不保存被过滤命名空间的数据。

use crate::config::{MemberId, ReplicaSetConfig};
use crate::oplog::OpTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// 需要的确认数量
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteAcks {
    /// 至少 N 个持有数据的成员
    Nodes(usize),
    /// 多数成员
    Majority,
}

/// 写确认级别 `{w, j, wtimeout}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteConcern {
    pub w: WriteAcks,
    /// 要求确认的成员已把条目写入 oplog
    ///
    /// oplog 常驻内存,计入确认的成员都已追加并应用该条目,因此 `j` 总是满足,
    /// 不改变所需的确认数。
    #[serde(default)]
    pub journal: bool,
    #[serde(default = "default_wtimeout_ms")]
    pub wtimeout_ms: u64,
}

fn default_wtimeout_ms() -> u64 { 60_000 }

impl Default for WriteConcern {
    fn default() -> Self {
        Self {
            w: WriteAcks::Nodes(1),
            journal: false,
            wtimeout_ms: default_wtimeout_ms(),
        }
    }
}

impl WriteConcern {
    pub fn nodes(n: usize) -> Self {
        Self {
            w: WriteAcks::Nodes(n),
            ..Default::default()
        }
    }

    pub fn majority() -> Self {
        Self {
            w: WriteAcks::Majority,
            ..Default::default()
        }
    }

    pub fn journaled(mut self, journal: bool) -> Self {
        self.journal = journal;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.wtimeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.wtimeout_ms)
    }

    /// 在给定配置下需要的确认数
    pub fn required(&self, config: &ReplicaSetConfig) -> usize {
        match self.w {
            WriteAcks::Nodes(n) => n,
            WriteAcks::Majority => config.write_majority(),
        }
    }

    /// 已应用到 `optime` 的持有数据成员数量
    pub fn acknowledged(
        config: &ReplicaSetConfig,
        optime: OpTime,
        progress: &HashMap<MemberId, OpTime>,
    ) -> usize {
        config
            .members
            .iter()
            .filter(|m| m.is_data_bearing())
            .filter(|m| progress.get(&m.id).map(|p| *p >= optime).unwrap_or(false))
            .count()
    }

    pub fn is_satisfied(
        &self,
        config: &ReplicaSetConfig,
        optime: OpTime,
        progress: &HashMap<MemberId, OpTime>,
    ) -> bool {
        Self::acknowledged(config, optime, progress) >= self.required(config)
    }
}

/// 写入被确认
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteAck {
    pub optime: OpTime,
    pub acknowledged_by: usize,
}
