//! 通配符模式：`*` 匹配任意字符序列（含空、含 `/`），`?` 匹配单个字符，其余按字面匹配。
//! 转换为锚定正则后匹配。

use regex::Regex;

use crate::core::AgentError;

/// 已编译的通配模式
#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    regex: Regex,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Result<Self, AgentError> {
        let regex = Regex::new(&glob_to_regex(pattern))
            .map_err(|e| AgentError::InvalidPattern(format!("{pattern}: {e}")))?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// 是否不含通配符
    pub fn is_literal(&self) -> bool {
        !self.source.contains(['*', '?'])
    }
}

/// glob -> 锚定正则源码
pub fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    let mut literal = String::new();
    for ch in pattern.chars() {
        match ch {
            '*' | '?' => {
                out.push_str(&regex::escape(&literal));
                literal.clear();
                out.push_str(if ch == '*' { ".*" } else { "." });
            }
            _ => literal.push(ch),
        }
    }
    out.push_str(&regex::escape(&literal));
    out.push('$');
    out
}

/// 一次性匹配（模式非法时视为不匹配）
pub fn glob_match(pattern: &str, text: &str) -> bool {
    GlobPattern::new(pattern).is_ok_and(|p| p.matches(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_star_and_question() {
        assert!(glob_match("delete_*", "delete_file"));
        assert!(glob_match("delete_*", "delete_"));
        assert!(!glob_match("delete_*", "undelete_file"));
        assert!(glob_match("fil?", "file"));
        assert!(!glob_match("fil?", "files"));
    }

    #[test]
    fn test_anchored_and_escaped() {
        assert!(glob_match("/etc/*", "/etc/passwd"));
        assert!(glob_match("/etc/*", "/etc/ssh/sshd_config"));
        assert!(!glob_match("/etc/*", "/home/etc/passwd"));
        assert!(glob_match("a.b", "a.b"));
        assert!(!glob_match("a.b", "axb"));
        assert!(glob_match("https://*.example.com/*", "https://api.example.com/v1"));
    }

    #[test]
    fn test_literal_detection() {
        assert!(GlobPattern::new("navigate").unwrap().is_literal());
        assert!(!GlobPattern::new("nav*").unwrap().is_literal());
    }

    #[test]
    fn test_regex_source() {
        assert_eq!(glob_to_regex("a*b?"), "^a.*b.$");
    }
}
