use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const ACCEPTED: &str = "Accepted";
pub const REJECTED: &str = "Rejected";
pub const SELECTED: &str = "Selected";
pub const DISCONNECTED: &str = "Disconnected";
pub const INFO: &str = "Info";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SelectionOutcome {
    Accepted,
    Rejected,
    Selected,
    Disconnected,
    Info,
}

impl SelectionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionOutcome::Accepted => ACCEPTED,
            SelectionOutcome::Rejected => REJECTED,
            SelectionOutcome::Selected => SELECTED,
            SelectionOutcome::Disconnected => DISCONNECTED,
            SelectionOutcome::Info => INFO,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            ACCEPTED => Some(SelectionOutcome::Accepted),
            REJECTED => Some(SelectionOutcome::Rejected),
            SELECTED => Some(SelectionOutcome::Selected),
            DISCONNECTED => Some(SelectionOutcome::Disconnected),
            INFO => Some(SelectionOutcome::Info),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectionLogEntry {
    pub worker_id: String,
    pub outcome: SelectionOutcome,
    pub reason: String,
    pub logged_at: DateTime<Utc>,
}

/// 一次分发尝试的选择记录，封存前可追加
#[derive(Debug, Clone)]
pub struct SelectionLogBatch {
    id: String,
    tenant_id: String,
    task_id: String,
    attempt: i32,
    entries: Vec<SelectionLogEntry>,
}

impl SelectionLogBatch {
    pub fn new(tenant_id: impl Into<String>, task_id: impl Into<String>, attempt: i32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            task_id: task_id.into(),
            attempt,
            entries: Vec::new(),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn attempt(&self) -> i32 {
        self.attempt
    }

    pub fn entries(&self) -> &[SelectionLogEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn record(&mut self, worker_id: &str, outcome: SelectionOutcome, reason: impl Into<String>) {
        self.entries.push(SelectionLogEntry {
            worker_id: worker_id.to_string(),
            outcome,
            reason: reason.into(),
            logged_at: Utc::now(),
        });
    }

    pub fn accept(&mut self, worker_id: &str, reason: impl Into<String>) {
        self.record(worker_id, SelectionOutcome::Accepted, reason);
    }

    pub fn reject(&mut self, worker_id: &str, reason: impl Into<String>) {
        self.record(worker_id, SelectionOutcome::Rejected, reason);
    }

    /// 最后一条针对该Worker的记录
    pub fn last_for(&self, worker_id: &str) -> Option<&SelectionLogEntry> {
        self.entries.iter().rev().find(|e| e.worker_id == worker_id)
    }

    /// 同一次分发尝试中已封存过相同判定（Worker、结果、原因都一致）
    pub fn repeats(&self, log: &SelectionLog) -> bool {
        log.task_id == self.task_id
            && log.attempt == self.attempt
            && self.entries.iter().all(|entry| {
                log.entries.iter().any(|sealed| {
                    sealed.worker_id == entry.worker_id
                        && sealed.outcome == entry.outcome
                        && sealed.reason == entry.reason
                })
            })
    }

    /// 封存后不可再修改
    pub fn seal(self, now: DateTime<Utc>) -> SelectionLog {
        SelectionLog {
            batch_id: self.id,
            tenant_id: self.tenant_id,
            task_id: self.task_id,
            attempt: self.attempt,
            entries: self.entries,
            sealed_at: now,
        }
    }
}

/// 已封存的选择记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectionLog {
    pub batch_id: String,
    pub tenant_id: String,
    pub task_id: String,
    pub attempt: i32,
    pub entries: Vec<SelectionLogEntry>,
    pub sealed_at: DateTime<Utc>,
}

/// Worker对某个能力条件的验证结果，白名单/黑名单依据
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionResult {
    pub tenant_id: String,
    pub worker_id: String,
    pub criteria: String,
    pub validated: bool,
    pub last_updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_keeps_duplicates_in_order() {
        let mut batch = SelectionLogBatch::new("t", "task-1", 0);
        batch.reject("w1", "missing selector");
        batch.reject("w1", "missing selector");
        batch.accept("w2", "whitelisted");
        assert_eq!(batch.entries().len(), 3);
        assert_eq!(batch.last_for("w2").unwrap().outcome, SelectionOutcome::Accepted);
    }

    #[test]
    fn test_seal_moves_entries() {
        let mut batch = SelectionLogBatch::new("t", "task-1", 2);
        batch.accept("w1", "ok");
        let sealed = batch.seal(Utc::now());
        assert_eq!(sealed.attempt, 2);
        assert_eq!(sealed.entries.len(), 1);
        assert_eq!(sealed.task_id, "task-1");
    }

    #[test]
    fn test_outcome_parse() {
        for outcome in [
            SelectionOutcome::Accepted,
            SelectionOutcome::Rejected,
            SelectionOutcome::Selected,
            SelectionOutcome::Disconnected,
            SelectionOutcome::Info,
        ] {
            assert_eq!(SelectionOutcome::parse(outcome.as_str()), Some(outcome));
        }
    }
}
