//! Agent 循环层：Planner、过程事件、主循环与错误策略

pub mod events;
pub mod loop_;
pub mod planner;

pub use events::ReactEvent;
pub use loop_::{run_agent, run_agents_parallel, AgentRunError, AgentRunResult, LoopConfig, ReactSession};
pub use planner::{parse_llm_output, Planner, PlannerOutput, ToolCall};
