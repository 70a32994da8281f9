//! 集群配置管理
//!
//! 配置分三部分:
//! - `ReplicaSetConfig`: 带版本的成员列表(优先级、仲裁者、命名空间过滤器)
//! - `ElectionConfig`: 心跳与选举超时
//! - `ReplicationConfig`: 批量大小、追赶容忍度、同步源重试退避、默认写确认
//!
//! 支持从 TOML 文件加载。

use crate::error::{ClusterError, ClusterResult};
use crate::filter::NamespaceFilter;
use crate::write_concern::WriteConcern;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// 成员的稳定标识
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MemberId(pub u32);

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 单个成员配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberConfig {
    pub id: MemberId,
    /// 成员地址,仅用于展示
    #[serde(default)]
    pub host: String,
    /// 选举优先级,0 表示永不成为主节点 (默认: 1)
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// 仅投票,不持有数据
    #[serde(default)]
    pub arbiter_only: bool,
    /// 命名空间过滤器,`None` 表示完整副本
    #[serde(default)]
    pub filter: Option<NamespaceFilter>,
}

fn default_priority() -> u32 { 1 }

impl MemberConfig {
    pub fn new(id: u32) -> Self {
        Self {
            id: MemberId(id),
            host: format!("node{}", id),
            priority: default_priority(),
            arbiter_only: false,
            filter: None,
        }
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn arbiter(mut self) -> Self {
        self.arbiter_only = true;
        self.priority = 0;
        self
    }

    pub fn filtered<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter = Some(NamespaceFilter::new(patterns));
        self
    }

    /// 能否参选主节点
    pub fn is_electable(&self) -> bool {
        !self.arbiter_only && self.priority > 0
    }

    pub fn is_data_bearing(&self) -> bool {
        !self.arbiter_only
    }
}

/// 副本集配置
///
/// 只读快照,重新配置时生成新版本。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaSetConfig {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u64,
    pub members: Vec<MemberConfig>,
}

fn default_version() -> u64 { 1 }

impl ReplicaSetConfig {
    pub fn new(name: impl Into<String>, members: Vec<MemberConfig>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            members,
        }
    }

    /// 校验配置
    pub fn validate(&self) -> ClusterResult<()> {
        if self.name.is_empty() {
            return Err(ClusterError::Config("Replica set name cannot be empty".into()));
        }
        if self.members.is_empty() {
            return Err(ClusterError::Config("Replica set has no members".into()));
        }
        let mut seen = HashSet::new();
        for m in &self.members {
            if !seen.insert(m.id) {
                return Err(ClusterError::Config(format!("Duplicate member id {}", m.id)));
            }
            if m.arbiter_only && m.priority > 0 {
                return Err(ClusterError::Config(format!(
                    "Arbiter {} must have priority 0",
                    m.id
                )));
            }
            if m.filter.is_some() && m.priority > 0 {
                return Err(ClusterError::Config(format!(
                    "Filtered member {} must have priority 0",
                    m.id
                )));
            }
            if m.arbiter_only && m.filter.is_some() {
                return Err(ClusterError::Config(format!(
                    "Arbiter {} cannot carry a namespace filter",
                    m.id
                )));
            }
        }
        if !self.members.iter().any(MemberConfig::is_electable) {
            return Err(ClusterError::Config("No electable member in config".into()));
        }
        Ok(())
    }

    pub fn member(&self, id: MemberId) -> Option<&MemberConfig> {
        self.members.iter().find(|m| m.id == id)
    }

    pub fn member_ids(&self) -> impl Iterator<Item = MemberId> + '_ {
        self.members.iter().map(|m| m.id)
    }

    /// 投票成员数(所有成员都投票,包括仲裁者)
    pub fn voting_members(&self) -> usize {
        self.members.len()
    }

    /// 选举所需多数
    pub fn majority(&self) -> usize {
        self.voting_members() / 2 + 1
    }

    /// 写确认的多数:投票多数,不超过持有数据的成员数
    pub fn write_majority(&self) -> usize {
        let data = self.members.iter().filter(|m| m.is_data_bearing()).count();
        self.majority().min(data)
    }
}

/// 选举配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// 心跳间隔 (毫秒)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// 连续错过多少轮心跳视为对端失联,同时作为选举超时
    #[serde(default = "default_election_timeout_heartbeats")]
    pub election_timeout_heartbeats: u32,
}

fn default_heartbeat_interval() -> u64 { 100 }
fn default_election_timeout_heartbeats() -> u32 { 3 }

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval(),
            election_timeout_heartbeats: default_election_timeout_heartbeats(),
        }
    }
}

impl ElectionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// 复制配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// 每批拉取的最大条目数
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// 回滚后判定追上同步源时允许落后的条目数
    #[serde(default)]
    pub catchup_lag_entries: usize,
    /// 找不到同步源时的最大退避轮数
    #[serde(default = "default_source_retry_max_rounds")]
    pub source_retry_max_rounds: u32,
    /// 默认写确认
    #[serde(default)]
    pub write_concern: WriteConcern,
}

fn default_batch_size() -> usize { 64 }
fn default_source_retry_max_rounds() -> u32 { 16 }

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            catchup_lag_entries: 0,
            source_retry_max_rounds: default_source_retry_max_rounds(),
            write_concern: WriteConcern::default(),
        }
    }
}

/// 集群配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub replica_set: ReplicaSetConfig,
    #[serde(default)]
    pub election: ElectionConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
}

impl ClusterConfig {
    pub fn new(replica_set: ReplicaSetConfig) -> Self {
        Self {
            replica_set,
            election: ElectionConfig::default(),
            replication: ReplicationConfig::default(),
        }
    }

    /// 从 TOML 文件加载配置
    pub fn load(path: impl AsRef<Path>) -> ClusterResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ClusterError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// 解析 TOML 字符串并校验
    pub fn from_toml_str(content: &str) -> ClusterResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ClusterError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> ClusterResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ClusterError::Config(format!("Failed to serialize config: {}", e)))
    }

    pub fn validate(&self) -> ClusterResult<()> {
        self.replica_set.validate()?;
        if self.election.election_timeout_heartbeats == 0 {
            return Err(ClusterError::Config(
                "election_timeout_heartbeats must be at least 1".into(),
            ));
        }
        if self.replication.batch_size == 0 {
            return Err(ClusterError::Config("batch_size must be at least 1".into()));
        }
        Ok(())
    }
}
