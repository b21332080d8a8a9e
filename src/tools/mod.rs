pub mod echo;
pub mod executor;
pub mod filesystem;
pub mod registry;
pub mod shell;

pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use filesystem::{CatTool, LsTool, SafeFs, WriteFileTool};
pub use registry::{Tool, ToolFuture, ToolRegistry};
pub use shell::ShellTool;
