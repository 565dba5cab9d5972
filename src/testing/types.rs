//! 探测协调器的状态与事件类型

use serde::{Deserialize, Serialize};

/// 代理组探测状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ProbeStatus {
    #[default]
    Idle,
    Testing,
    Completed,
    Failed,
    Cancelled,
}

impl ProbeStatus {
    /// 是否为终态（可再次进入 Testing）
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProbeStatus::Completed | ProbeStatus::Failed | ProbeStatus::Cancelled
        )
    }
}

/// 单个代理组的探测状态，每次状态转换整体替换
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProbeState {
    pub status: ProbeStatus,
    pub started_at_ms: i64,
    pub ended_at_ms: i64,
    pub last_success_at_ms: i64,
    pub retry_count: u32,
    pub error: Option<String>,
    pub cancelled: bool,
}

impl ProbeState {
    pub fn testing(started_at_ms: i64) -> Self {
        Self {
            status: ProbeStatus::Testing,
            started_at_ms,
            ..Self::default()
        }
    }

    /// 耗时（毫秒），未结束时为 0
    pub fn duration(&self) -> i64 {
        if self.ended_at_ms > self.started_at_ms {
            self.ended_at_ms - self.started_at_ms
        } else {
            0
        }
    }
}

/// 一次探测结束后发布的事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub group_name: String,
    pub success: bool,
    pub duration_ms: i64,
    pub error: Option<String>,
}

/// 在途探测的排队快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// 等待并发许可的组数
    pub queued_count: usize,
    /// 持有许可、正在探测的组数
    pub testing_count: usize,
    pub max_concurrent: usize,
}

/// 探测统计
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TestStatistics {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub testing: usize,
    pub queued: usize,
    pub success_rate: f32,
}

/// 探测优先级（目前不影响调度顺序）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}
