//! 请求生命周期阶段
//!
//! 每个被接纳的请求按 Classifying → SelectingModel → Executing → Reflecting → Done 推进，
//! Failed 为吸收态，任何阶段都可进入；Queued 表示暂无可用端点、已转入离线队列等待。

use serde::{Deserialize, Serialize};

/// 请求阶段（同时用于事件流中的 status_update）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPhase {
    /// 防抖窗口内等待合并
    Buffering,
    Classifying,
    SelectingModel,
    /// 无可用端点，已入离线队列
    Queued,
    Executing,
    Reflecting,
    Done,
    Failed,
}

impl RequestPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestPhase::Done | RequestPhase::Failed)
    }
}

impl std::fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RequestPhase::Buffering => "buffering",
            RequestPhase::Classifying => "classifying",
            RequestPhase::SelectingModel => "selecting_model",
            RequestPhase::Queued => "queued",
            RequestPhase::Executing => "executing",
            RequestPhase::Reflecting => "reflecting",
            RequestPhase::Done => "done",
            RequestPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}
