//! Termpilot - 交互式 Shell 会话的命令完成检测与计划执行引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、失败恢复、会话监管（任务取消）
//! - **session**: 会话适配契约、输出缓冲、提示符检测、完成检测、轮询执行
//! - **llm**: 推理服务线上格式、HTTP 传输、节流与 token 预算、推理网关、Mock
//! - **plan**: 执行计划、危险命令校验、判定评估、计划执行器
//! - **memory**: 对话记录与执行历史
//! - **react**: Planner 与对话式任务主循环
//! - **tools**: 暴露给推理服务的工具定义
//! - **observability**: 日志初始化

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod plan;
pub mod react;
pub mod session;
pub mod tools;

pub use crate::core::AgentError;
pub use plan::{ExecutionPlan, PlanExecutor};
pub use react::TaskOrchestrator;
