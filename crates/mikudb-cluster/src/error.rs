//! 集群错误类型定义

use crate::oplog::OpTime;
use crate::MemberId;
use thiserror::Error;

/// 集群操作错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    /// 写入者任期落后于日志中已记录的最高任期
    #[error("Term conflict: entry term {entry_term} is behind log term {log_term}")]
    TermConflict { entry_term: u64, log_term: u64 },

    /// 追加的 optime 没有严格递增
    #[error("Out of order append: {optime} is not after {last}")]
    OutOfOrder { optime: OpTime, last: OpTime },

    /// 本地日志与同步源没有共同前缀,需要全量重建
    #[error("No common point with sync source {source_id}, local optime {local}")]
    NoCommonPoint { source_id: MemberId, local: OpTime },

    /// 写确认未在超时内满足;写入已在主节点本地持久化
    #[error("Write concern failed at {optime}: {reason}")]
    WriteConcernFailed {
        optime: OpTime,
        reason: String,
        wtimeout: bool,
    },

    /// 本地应用已允许的条目失败
    #[error("Apply error at {optime} on {ns}: {reason}")]
    ApplyError {
        optime: OpTime,
        ns: String,
        reason: String,
    },

    /// 没有可用的同步源
    #[error("No eligible sync source: {0}")]
    SourceIneligible(String),

    /// 同步源不包含本地最后应用的条目
    #[error("Sync source {source_id} diverged from local optime {local}")]
    Diverged { source_id: MemberId, local: OpTime },

    /// 回滚中途同步源失效,回滚被中止
    #[error("Rollback aborted: {0}")]
    RollbackAborted(String),

    /// 非主节点拒绝客户端写入
    #[error("Not primary: node {0}")]
    NotPrimary(MemberId),

    /// 副本集当前没有主节点
    #[error("No primary available")]
    NoPrimary,

    /// 重新配置的版本冲突
    #[error("Config version conflict: current {current}, proposed {proposed}")]
    VersionConflict { current: u64, proposed: u64 },

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// 节点未找到
    #[error("Node not found: {0}")]
    NodeNotFound(MemberId),

    /// 超时错误
    #[error("Timeout: {0}")]
    Timeout(String),

    /// 内部错误
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClusterError {
    /// 是否为需要把节点移出副本集的致命错误
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::NoCommonPoint { .. } | Self::ApplyError { .. })
    }
}

impl From<mikudb_common::MikuError> for ClusterError {
    fn from(e: mikudb_common::MikuError) -> Self {
        Self::Config(e.to_string())
    }
}

/// 集群操作结果类型
pub type ClusterResult<T> = Result<T, ClusterError>;
