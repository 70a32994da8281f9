//! MikuDB 副本集复制引擎
//!
//! 一个副本集由若干成员组成,同一时刻至多一个主节点接受写入,写入以
//! oplog 条目的形式复制到其他成员:
//! - **Oplog**: 每个节点一份追加式日志,按 `(term, counter)` 全序
//! - **命名空间过滤**: 过滤节点只把允许的命名空间交给存储,但仍复制完整日志
//! - **复制链路**: 尾随源 oplog,分批应用,按 optime 去重
//! - **选举**: 心跳驱动,预投票避免少数派抬高任期
//! - **同步源选择**: 优先主节点,过滤节点不会成为需要更多命名空间的成员的源
//! - **回滚**: 分叉后找到共同点,取回源上的文档版本,截断并重新追赶
//!
//! [`ReplicaSet`] 是确定性驱动,按轮推进;[`ReplSetRuntime`] 在 tokio 上
//! 以心跳任务与链路任务驱动同一组步骤。

pub mod config;
pub mod election;
pub mod error;
pub mod filter;
pub mod link;
pub mod membership;
pub mod network;
pub mod node;
pub mod oplog;
pub mod replset;
pub mod rollback;
pub mod runtime;
pub mod status;
pub mod storage;
pub mod sync_source;
pub mod write_concern;

pub use config::{
    ClusterConfig, ElectionConfig, MemberConfig, MemberId, ReplicaSetConfig, ReplicationConfig,
};
pub use error::{ClusterError, ClusterResult};
pub use filter::NamespaceFilter;
pub use link::{LinkHandle, LinkSettings, PumpOutcome};
pub use membership::{InMemoryMembership, MembershipService};
pub use network::Network;
pub use node::{HealthStatus, NodeRole, ReplNode, RollbackPhase};
pub use oplog::{OpTime, Oplog, OplogCursor, OplogEntry, Operation};
pub use replset::ReplicaSet;
pub use rollback::{CommonPoint, RollbackCoordinator, RollbackReport};
pub use runtime::ReplSetRuntime;
pub use status::{MemberStatus, ReplSetStatus};
pub use storage::{MemoryStorage, StorageApplier, StorageApplyError};
pub use write_concern::{WriteAck, WriteAcks, WriteConcern};
