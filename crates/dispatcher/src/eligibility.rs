//! 候选Worker资格判定
//!
//! `evaluate` 是纯函数：输入任务、候选Worker、该Worker针对任务签名的连通性历史和
//! 决策上下文，按顺序短路判定，并把结论写入当前的选择记录批次。
//!
//! 1. 作用域/标签匹配
//! 2. 白名单：签名内全部条件近期验证成功，且未开启重新验证开关，直接接受
//! 3. 需要验证：暂时接受，等待一次能力探测；近期验证失败（黑名单）则拒绝

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dispatch_core::models::{
    ConnectionResult, SelectionLogBatch, SelectionOutcome, Task, Worker, NG_ABSTRACTION_KEY,
};
use dispatch_core::traits::ConnectionResultRepository;
use dispatch_core::{DecisionContext, DispatchResult};
use tracing::debug;

/// 单个候选Worker的判定结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept(String),
    /// 暂时接受，分配前需要一次能力验证
    NeedsValidation,
    Reject(String),
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept(_))
    }
}

/// Worker针对任务签名的历史验证状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryStatus {
    Whitelisted,
    Blacklisted,
    Unknown,
}

/// 根据连通性历史判断白名单/黑名单
///
/// 白名单要求签名内每个条件都有有效期内的成功记录；
/// 任一条件有有效期内的失败记录即为黑名单。
pub fn classify_history(
    signature: &[String],
    history: &[ConnectionResult],
    ctx: &DecisionContext,
) -> HistoryStatus {
    let latest: HashMap<&str, &ConnectionResult> = history
        .iter()
        .filter(|r| signature.iter().any(|c| c == &r.criteria))
        .fold(HashMap::new(), |mut acc, r| {
            let entry = acc.entry(r.criteria.as_str()).or_insert(r);
            if r.last_updated_at > entry.last_updated_at {
                *entry = r;
            }
            acc
        });

    let blacklisted = latest
        .values()
        .any(|r| !r.validated && r.last_updated_at > ctx.now - ctx.blacklist_ttl);
    if blacklisted {
        return HistoryStatus::Blacklisted;
    }

    let whitelisted = signature.iter().all(|criteria| {
        latest
            .get(criteria.as_str())
            .map(|r| r.validated && r.last_updated_at > ctx.now - ctx.whitelist_ttl)
            .unwrap_or(false)
    });
    if whitelisted {
        HistoryStatus::Whitelisted
    } else {
        HistoryStatus::Unknown
    }
}

/// 是否需要走验证流程
pub fn should_validate(status: HistoryStatus, ctx: &DecisionContext) -> bool {
    match status {
        HistoryStatus::Unknown => true,
        HistoryStatus::Whitelisted => ctx.revalidate_whitelisted,
        HistoryStatus::Blacklisted => false,
    }
}

/// 作用域与标签匹配，返回第一个不满足的原因
///
/// Worker未声明的作用域维度视为不受限。
pub fn scope_mismatch(task: &Task, worker: &Worker) -> Option<String> {
    if let Some(selector) = task.selectors.iter().find(|s| !worker.has_tag(s)) {
        return Some(format!("缺少标签 {selector}"));
    }

    task.setup_abstractions
        .iter()
        .filter(|(key, _)| key.as_str() != NG_ABSTRACTION_KEY)
        .find_map(|(key, value)| match worker.scopes.get(key) {
            Some(scoped) if scoped != value => {
                Some(format!("作用域 {key}={scoped} 与任务要求 {value} 不符"))
            }
            _ => None,
        })
}

/// 判定单个候选Worker并记录原因
pub fn evaluate(
    task: &Task,
    worker: &Worker,
    history: &[ConnectionResult],
    ctx: &DecisionContext,
    batch: &mut SelectionLogBatch,
) -> Verdict {
    let verdict = decide(task, worker, history, ctx);
    match &verdict {
        Verdict::Accept(reason) => batch.accept(&worker.id, reason.clone()),
        Verdict::Reject(reason) => batch.reject(&worker.id, reason.clone()),
        Verdict::NeedsValidation => {
            batch.record(&worker.id, SelectionOutcome::Info, "需要验证能力条件")
        }
    }
    debug!("任务 {} 候选Worker {}: {:?}", task.id, worker.id, verdict);
    verdict
}

fn decide(
    task: &Task,
    worker: &Worker,
    history: &[ConnectionResult],
    ctx: &DecisionContext,
) -> Verdict {
    if !worker.is_enabled() {
        return Verdict::Reject("Worker已禁用".to_string());
    }
    if task.is_pinned_elsewhere(&worker.id) {
        return Verdict::Reject("任务固定在其他Worker".to_string());
    }
    if task.has_tried(&worker.id) {
        return Verdict::Reject("已尝试过该任务".to_string());
    }
    if let Some(reason) = scope_mismatch(task, worker) {
        return Verdict::Reject(reason);
    }

    let signature = task.signature();
    if signature.is_empty() {
        return Verdict::Accept("无需验证能力条件".to_string());
    }

    let status = classify_history(&signature, history, ctx);
    if status == HistoryStatus::Whitelisted && !ctx.revalidate_whitelisted {
        return Verdict::Accept("白名单".to_string());
    }
    if should_validate(status, ctx) {
        Verdict::NeedsValidation
    } else {
        Verdict::Reject("黑名单：近期验证失败".to_string())
    }
}

/// 能力探测：确认Worker能否满足任务的全部能力条件
#[async_trait]
pub trait CapabilityProbe: Send + Sync {
    async fn probe(&self, task: &Task, worker: &Worker) -> DispatchResult<bool>;
}

/// 按连通性历史做的服务端探测
///
/// 签名内任一条件最近一次结果为失败即不通过；没有历史时放行，
/// 真正的验证在Worker领取任务时完成。
pub struct ConnectionHistoryProbe {
    results: Arc<dyn ConnectionResultRepository>,
}

impl ConnectionHistoryProbe {
    pub fn new(results: Arc<dyn ConnectionResultRepository>) -> Self {
        Self { results }
    }
}

#[async_trait]
impl CapabilityProbe for ConnectionHistoryProbe {
    async fn probe(&self, task: &Task, worker: &Worker) -> DispatchResult<bool> {
        let history = self
            .results
            .list(&task.tenant_id, &worker.id, &task.signature())
            .await?;

        let mut latest: HashMap<&str, &ConnectionResult> = HashMap::new();
        for result in &history {
            let entry = latest.entry(result.criteria.as_str()).or_insert(result);
            if result.last_updated_at > entry.last_updated_at {
                *entry = result;
            }
        }
        Ok(latest.values().all(|r| r.validated))
    }
}

/// 候选Worker及其连通性历史
#[derive(Debug, Clone)]
pub struct Candidate {
    pub worker: Worker,
    pub history: Vec<ConnectionResult>,
}

/// 两阶段选择：依次判定候选，需要验证的先探测，探测失败继续下一个
pub async fn select_candidate(
    task: &Task,
    candidates: &[Candidate],
    ctx: &DecisionContext,
    probe: &dyn CapabilityProbe,
    batch: &mut SelectionLogBatch,
) -> DispatchResult<Option<Worker>> {
    for candidate in candidates {
        match evaluate(task, &candidate.worker, &candidate.history, ctx, batch) {
            Verdict::Accept(_) => return Ok(Some(candidate.worker.clone())),
            Verdict::Reject(_) => continue,
            Verdict::NeedsValidation => {
                if probe.probe(task, &candidate.worker).await? {
                    batch.accept(&candidate.worker.id, "验证通过");
                    return Ok(Some(candidate.worker.clone()));
                }
                batch.reject(&candidate.worker.id, "验证失败");
            }
        }
    }
    Ok(None)
}

/// 读取Worker针对任务签名的连通性历史
pub async fn load_history(
    results: &dyn ConnectionResultRepository,
    task: &Task,
    worker_id: &str,
) -> DispatchResult<Vec<ConnectionResult>> {
    let signature = task.signature();
    if signature.is_empty() {
        return Ok(Vec::new());
    }
    results.list(&task.tenant_id, worker_id, &signature).await
}
