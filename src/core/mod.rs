//! 核心层：错误分类、失败恢复、会话监管

pub mod error;
pub mod recovery;
pub mod session_supervisor;

pub use error::AgentError;
pub use recovery::{
    classify, AttemptRunner, ErrorAnalysis, ErrorPattern, RecoveryEngine, RecoveryPlan,
};
pub use session_supervisor::SessionSupervisor;
