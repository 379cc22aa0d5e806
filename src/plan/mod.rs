//! 计划层：结构化执行计划及其执行
//!
//! - **types**: 计划与结果的 JSON 线格式
//! - **builder**: 流畅 API 构建计划
//! - **validation**: 危险命令黑名单与计划校验
//! - **criteria**: 成功 / 失败判定评估与默认检测
//! - **executor**: 顺序执行、重试、恢复与全局判定

pub mod builder;
pub mod criteria;
pub mod executor;
pub mod types;
pub mod validation;

pub use builder::PlanBuilder;
pub use criteria::{default_success, evaluate, evaluate_all, FsProbe, LocalProbe, PathKind, SessionProbe};
pub use executor::{ExecutorConfig, PlanExecutor};
pub use types::{
    Criterion, CriterionResult, CriterionType, ExecutionPlan, PlanExecutionResult, PlanStatus,
    PlanStep, RecoveryStrategy, StepExecutionResult, StepStatus,
};
pub use validation::{dangerous_match, is_dangerous, validate_command, validate_plan};
