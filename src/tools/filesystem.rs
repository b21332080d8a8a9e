//! 文件系统工具
//!
//! SafeFs 绑定 root_dir，所有路径经 resolve 校验必须在 root 下（禁止 ../ 逃逸）。
//! 工具通过 resources 声明 file_system 资源（绝对路径 + 访问类型），权限由沙箱判定。

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use crate::security::{AccessType, ResourceRequest};
use crate::tools::Tool;

/// 绑定根目录的文件系统
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    /// 词法解析路径（不要求文件存在），拒绝逃逸出根目录
    pub fn resolve(&self, path: &str) -> Result<PathBuf, String> {
        let mut resolved = self.root_dir.clone();
        for component in Path::new(path.trim_start_matches("./")).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !resolved.pop() || !resolved.starts_with(&self.root_dir) {
                        return Err(format!("Path escapes workspace: {}", path));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(format!("Absolute paths are not allowed: {}", path));
                }
            }
        }
        if resolved.starts_with(&self.root_dir) {
            Ok(resolved)
        } else {
            Err(format!("Path escapes workspace: {}", path))
        }
    }

    /// 资源标识：解析失败时退回原始字符串，让规则仍能匹配到
    pub fn resource_id(&self, path: &str) -> String {
        self.resolve(path)
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|_| path.to_string())
    }

    pub async fn read_file(&self, path: &str) -> Result<String, String> {
        let resolved = self.resolve(path)?;
        tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| format!("Read failed: {}", e))
    }

    pub async fn write_file(&self, path: &str, content: &str) -> Result<usize, String> {
        let resolved = self.resolve(path)?;
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("Create dir failed: {}", e))?;
        }
        tokio::fs::write(&resolved, content)
            .await
            .map_err(|e| format!("Write failed: {}", e))?;
        Ok(content.len())
    }

    pub async fn list_dir(&self, path: &str) -> Result<Vec<String>, String> {
        let base = if path.is_empty() || path == "." {
            self.root_dir.clone()
        } else {
            self.resolve(path)?
        };
        let mut dir = tokio::fs::read_dir(&base)
            .await
            .map_err(|e| format!("List failed: {}", e))?;
        let mut entries = Vec::new();
        while let Some(e) = dir.next_entry().await.map_err(|e| e.to_string())? {
            let name = e.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') {
                let ty = if e.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                    "/"
                } else {
                    ""
                };
                entries.push(format!("{}{}", name, ty));
            }
        }
        entries.sort();
        Ok(entries)
    }
}

fn path_arg<'a>(args: &'a Value, default: &'a str) -> &'a str {
    args.get("path").and_then(|v| v.as_str()).unwrap_or(default)
}

/// 读取文件内容
pub struct CatTool {
    fs: SafeFs,
}

impl CatTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for CatTool {
    fn name(&self) -> &str {
        "cat"
    }

    fn description(&self) -> &str {
        "Read file contents. Args: {\"path\": \"file path relative to workspace\"}"
    }

    fn resources(&self, args: &Value) -> Vec<ResourceRequest> {
        vec![ResourceRequest::file(self.fs.resource_id(path_arg(args, "")), AccessType::Read)]
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let path = path_arg(&args, "");
        tracing::debug!(path = %path, "cat tool execute");
        self.fs.read_file(path).await
    }
}

/// 列出目录
pub struct LsTool {
    fs: SafeFs,
}

impl LsTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for LsTool {
    fn name(&self) -> &str {
        "ls"
    }

    fn description(&self) -> &str {
        "List directory. Args: {\"path\": \"directory path, default '.'\"}"
    }

    fn resources(&self, args: &Value) -> Vec<ResourceRequest> {
        vec![ResourceRequest::file(self.fs.resource_id(path_arg(args, ".")), AccessType::Read)]
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let path = path_arg(&args, ".");
        tracing::debug!(path = %path, "ls tool execute");
        Ok(self.fs.list_dir(path).await?.join("\n"))
    }
}

/// 写文件
pub struct WriteFileTool {
    fs: SafeFs,
}

impl WriteFileTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write a file. Args: {\"path\": \"relative path\", \"content\": \"text\"}"
    }

    fn resources(&self, args: &Value) -> Vec<ResourceRequest> {
        vec![ResourceRequest::file(self.fs.resource_id(path_arg(args, "")), AccessType::Write)]
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let path = path_arg(&args, "");
        let content = args.get("content").and_then(|v| v.as_str()).unwrap_or("");
        let written = self.fs.write_file(path, content).await?;
        Ok(format!("wrote {} bytes to {}", written, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_rejects_escape() {
        let dir = tempfile::tempdir().unwrap();
        let fs = SafeFs::new(dir.path());
        assert!(fs.resolve("a/b.txt").is_ok());
        assert!(fs.resolve("a/../b.txt").is_ok());
        assert!(fs.resolve("../../etc/passwd").is_err());
        assert!(fs.resolve("/etc/passwd").is_err());
    }

    #[tokio::test]
    async fn test_write_then_cat() {
        let dir = tempfile::tempdir().unwrap();
        let write = WriteFileTool::new(dir.path());
        let cat = CatTool::new(dir.path());
        let args = serde_json::json!({ "path": "notes/a.txt", "content": "hello" });
        write.execute(args).await.unwrap();
        let out = cat.execute(serde_json::json!({ "path": "notes/a.txt" })).await.unwrap();
        assert_eq!(out, "hello");

        let ls = LsTool::new(dir.path());
        assert_eq!(ls.execute(serde_json::json!({})).await.unwrap(), "notes/");
    }

    #[test]
    fn test_resources_declare_access() {
        let dir = tempfile::tempdir().unwrap();
        let write = WriteFileTool::new(dir.path());
        let res = write.resources(&serde_json::json!({ "path": "x.txt" }));
        assert_eq!(res.len(), 1);
        assert_eq!(res[0].access, AccessType::Write);
        assert!(res[0].identifier.ends_with("x.txt"));
    }
}
