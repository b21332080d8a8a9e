//! Sentinel - 安全任务编排引擎
//!
//! 模块划分：
//! - **agent**: 无头引擎运行时（按配置组装组件、创建任务、跑 Agent 回合）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 任务 / Agent 上下文、暂停与取消、执行链、检查点、错误分类与关闭管理
//! - **llm**: LLM 客户端抽象与脚本化实现
//! - **memory**: 对话日志
//! - **observability**: tracing 初始化
//! - **react**: Planner、过程事件、Agent 主循环
//! - **security**: 权限规则与评估、审批、沙箱执行、审计
//! - **tools**: 工具箱（cat、ls、write_file、shell、echo）与执行器

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod security;
pub mod tools;
