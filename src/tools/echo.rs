//! Echo 工具（测试与演示用）

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::Tool;

/// 回显文本；可选 delay_ms 模拟慢工具，fail=true 模拟失败
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text. Args: {\"text\": \"message\", \"delay_ms\": optional, \"fail\": optional bool}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": { "type": "string" },
                "delay_ms": { "type": "integer" },
                "fail": { "type": "boolean" }
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        if let Some(ms) = args.get("delay_ms").and_then(|v| v.as_u64()) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        let text = args
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or("(empty)");
        if args.get("fail").and_then(|v| v.as_bool()).unwrap_or(false) {
            return Err(format!("echo failed: {}", text));
        }
        Ok(text.to_string())
    }
}
