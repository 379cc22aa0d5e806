//! 认知层：Planner（请求与解析下一条命令）、任务主循环、过程事件

pub mod events;
pub mod loop_;
pub mod planner;

pub use events::TaskEvent;
pub use loop_::{
    detect_repetition, is_completion, step_limit_reached, AutoApprove, CommandApproval,
    OrchestratorConfig, TaskEndReason, TaskOrchestrator, TaskOutcome,
};
pub use planner::{parse_response, Planner, PlannerOutput, ProposedCommand, DEFAULT_COMPLETION_PHRASE, DEFAULT_SYSTEM_PROMPT};
