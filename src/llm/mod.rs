//! LLM 层：线上格式、客户端抽象、HTTP 传输、节流与 token 预算、推理网关、Mock

pub mod gateway;
pub mod mock;
pub mod openai;
pub mod throttle;
pub mod token_budget;
pub mod traits;
pub mod types;

pub use gateway::{parse_reset_duration, GatewayConfig, ReasoningGateway};
pub use mock::MockLlmClient;
pub use openai::{OpenAiTransport, TokenUsage};
pub use throttle::{Throttle, ThrottleConfig, ThrottlePermit};
pub use token_budget::{Admission, BudgetState, TokenBudgetLimiter, TokenEstimator, BUDGET_WINDOW};
pub use traits::{ChatTransport, LlmClient, LlmError, RawResponse};
pub use types::{
    ChatRequest, ChatResponse, Choice, FunctionCall, FunctionDefinition, ResponseMessage, ToolCall,
    ToolDefinition, Usage,
};
