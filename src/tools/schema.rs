//! 工具调用 JSON Schema 生成（schemars 自动生成工具 Schema）
//!
//! 暴露给推理服务的只有一个工具：execute_terminal_command，参数为 `{command: string}`。

use schemars::{schema_for, JsonSchema};
use serde::Deserialize;

use crate::llm::{FunctionDefinition, ToolDefinition};

/// 工具名（与推理服务约定，不可更改）
pub const EXECUTE_TERMINAL_COMMAND: &str = "execute_terminal_command";

/// execute_terminal_command 的参数
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ExecuteTerminalCommandArgs {
    /// 要在当前终端会话中执行的单条 shell 命令
    pub command: String,
}

/// 参数的 JSON Schema（去掉 `$schema` 与 `title`，保留 properties/required）
pub fn command_parameters_schema() -> serde_json::Value {
    let schema = schema_for!(ExecuteTerminalCommandArgs);
    let mut value = serde_json::to_value(&schema).unwrap_or_else(|_| serde_json::json!({}));
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    value
}

/// 请求中携带的工具定义
pub fn execute_terminal_command_tool() -> ToolDefinition {
    ToolDefinition {
        kind: "function".to_string(),
        function: FunctionDefinition {
            name: EXECUTE_TERMINAL_COMMAND.to_string(),
            description: "Execute a single shell command in the user's terminal session and return its output."
                .to_string(),
            parameters: command_parameters_schema(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_requires_command() {
        let schema = command_parameters_schema();
        assert!(schema.get("$schema").is_none());
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["command"]["type"], "string");
        assert_eq!(schema["required"][0], "command");
    }

    #[test]
    fn test_tool_definition_wire_shape() {
        let json = serde_json::to_value(execute_terminal_command_tool()).unwrap();
        assert_eq!(json["type"], "function");
        assert_eq!(json["function"]["name"], EXECUTE_TERMINAL_COMMAND);
    }
}
