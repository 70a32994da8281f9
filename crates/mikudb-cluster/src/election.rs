//! 主节点选举
//!
//! 选举分两步:先以 `dry_run` 询问可达投票者是否会投票,拿到多数后才真正
//! 增加任期。少数派中的节点因此不会反复抬高任期,分区恢复后也不会把健康
//! 的主节点赶下台。
//!
//! 投票者拒绝的情况:
//! - 请求任期落后
//! - 本任期已投给其他候选者
//! - 自己是主节点,或仍能看到一个健康的主节点
//! - 候选者的 oplog 落后于自己

use crate::config::ReplicaSetConfig;
use crate::error::ClusterResult;
use crate::node::{ReplNode, VoteRequest};
use std::sync::Arc;
use tracing::{debug, info};

/// 一次选举尝试的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// 当选
    Won { term: u64 },
    /// 真实投票未获多数
    Lost { term: u64, votes: usize, needed: usize },
    /// 预投票未获多数,任期未变化
    DryRunFailed { votes: usize, needed: usize },
    /// 不满足参选条件
    NotEligible,
}

/// 发起一次选举
///
/// `voters` 是候选者当前能联系到的其他成员。
pub fn run_election(
    candidate: &ReplNode,
    voters: &[Arc<ReplNode>],
    config: &ReplicaSetConfig,
    timeout: u32,
) -> ClusterResult<ElectionOutcome> {
    if !candidate.should_stand(timeout) {
        return Ok(ElectionOutcome::NotEligible);
    }
    let needed = config.majority();
    let last_optime = candidate.oplog().last_optime();

    let dry = VoteRequest {
        term: candidate.term() + 1,
        candidate: candidate.id(),
        last_optime,
        dry_run: true,
    };
    let votes = 1 + collect_votes(voters, dry);
    if votes < needed {
        debug!(
            "Node {} pre-vote failed: {} of {} votes",
            candidate.id(),
            votes,
            needed
        );
        return Ok(ElectionOutcome::DryRunFailed { votes, needed });
    }

    let term = candidate.start_candidacy();
    let req = VoteRequest {
        term,
        dry_run: false,
        ..dry
    };
    let mut votes = 1;
    for voter in voters {
        let resp = voter.handle_vote_request(req);
        if resp.granted {
            votes += 1;
        } else if resp.term > term {
            candidate.observe_term(resp.term);
        }
    }

    if votes >= needed && candidate.become_primary(term)? {
        info!(
            "Node {} won election for term {} with {} of {} votes",
            candidate.id(),
            term,
            votes,
            config.voting_members()
        );
        return Ok(ElectionOutcome::Won { term });
    }
    info!(
        "Node {} lost election for term {}: {} of {} votes",
        candidate.id(),
        term,
        votes,
        needed
    );
    Ok(ElectionOutcome::Lost { term, votes, needed })
}

fn collect_votes(voters: &[Arc<ReplNode>], req: VoteRequest) -> usize {
    voters
        .iter()
        .map(|v| v.handle_vote_request(req))
        .filter(|resp| resp.granted)
        .count()
}
