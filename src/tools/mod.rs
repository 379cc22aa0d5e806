//! 暴露给推理服务的工具定义

pub mod schema;

pub use schema::{
    command_parameters_schema, execute_terminal_command_tool, ExecuteTerminalCommandArgs,
    EXECUTE_TERMINAL_COMMAND,
};
