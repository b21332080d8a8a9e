//! Planner：调用 LLM 并解析 Tool Call
//!
//! 模型输出可以是纯文本（最终回复）、单个 JSON Tool Call 或 Tool Call 数组。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::AgentError;
use crate::llm::LlmClient;
use crate::memory::Message;

/// LLM 返回的 Tool Call（{"tool": "cat", "args": {"path": "..."}}）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlannerOutput {
    /// 直接回复用户
    Response(String),
    /// 按顺序执行的工具调用
    ToolCalls(Vec<ToolCall>),
}

/// 提取 ```json 代码块或最外层的 {...} / [...]
fn extract_json(trimmed: &str) -> Option<&str> {
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let obj = trimmed.find('{').zip(trimmed.rfind('}'));
    let arr = trimmed.find('[').zip(trimmed.rfind(']'));
    let (start, end) = match (obj, arr) {
        (Some(o), Some(a)) if a.0 < o.0 => a,
        (Some(o), _) => o,
        (None, Some(a)) => a,
        (None, None) => return None,
    };
    (start < end).then(|| &trimmed[start..=end])
}

/// 解析 LLM 输出：含有效 JSON 且 tool 非空则为 ToolCalls，否则为 Response
pub fn parse_llm_output(output: &str) -> Result<PlannerOutput, AgentError> {
    let trimmed = output.trim();
    let Some(json_str) = extract_json(trimmed) else {
        return Ok(PlannerOutput::Response(trimmed.to_string()));
    };

    let calls: Vec<ToolCall> = if json_str.starts_with('[') {
        serde_json::from_str(json_str)
    } else {
        serde_json::from_str::<ToolCall>(json_str).map(|c| vec![c])
    }
    .map_err(|e| AgentError::JsonParseError(format!("{}: {}", e, json_str)))?;

    let calls: Vec<ToolCall> = calls.into_iter().filter(|c| !c.tool.is_empty()).collect();
    if calls.is_empty() {
        Ok(PlannerOutput::Response(trimmed.to_string()))
    } else {
        Ok(PlannerOutput::ToolCalls(calls))
    }
}

/// Planner：持有 LLM 与 system prompt
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, system_prompt: impl Into<String>) -> Self {
        Self {
            llm,
            system_prompt: system_prompt.into(),
        }
    }

    pub fn base_system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub async fn plan(&self, messages: &[Message]) -> Result<String, AgentError> {
        let mut full_messages = vec![Message::system(self.system_prompt.clone())];
        full_messages.extend(messages.iter().cloned());
        self.llm.complete(&full_messages).await.map_err(AgentError::LlmError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_is_response() {
        let out = parse_llm_output("All done.").unwrap();
        assert_eq!(out, PlannerOutput::Response("All done.".into()));
    }

    #[test]
    fn test_single_call() {
        let out = parse_llm_output(r#"Let me check. {"tool": "cat", "args": {"path": "a.txt"}}"#).unwrap();
        match out {
            PlannerOutput::ToolCalls(calls) => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].tool, "cat");
                assert_eq!(calls[0].args["path"], "a.txt");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_call_array_in_code_block() {
        let raw = "```json\n[{\"tool\": \"ls\"}, {\"tool\": \"cat\", \"args\": {\"path\": \"b\"}}]\n```";
        match parse_llm_output(raw).unwrap() {
            PlannerOutput::ToolCalls(calls) => {
                let names: Vec<&str> = calls.iter().map(|c| c.tool.as_str()).collect();
                assert_eq!(names, vec!["ls", "cat"]);
                assert!(calls[0].args.is_null());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_malformed_json_is_error() {
        let err = parse_llm_output(r#"{"tool": "cat", "args": }"#).unwrap_err();
        assert!(matches!(err, AgentError::JsonParseError(_)));
    }
}
