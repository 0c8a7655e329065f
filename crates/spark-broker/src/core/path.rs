//! 资源路径的规范化与拆分。
//!
//! 规范形式：以单个 `/` 开头、无尾随 `/`、段内非空；空路径规范化为根 `/`。
//! 根路径保留给命名空间自身，从不作为内容资源对外服务。

use std::{borrow::ToOwned, string::String};

use crate::error::BrokerError;

/// 根路径。
pub const ROOT: &str = "/";

/// 将传输层给出的 Uri-Path 规范化。
///
/// - 折叠前导与尾随的 `/`，空输入得到 [`ROOT`]；
/// - 中间出现空段、`.` 或 `..` 时返回 [`BrokerError::Validation`]。
pub fn normalize(raw: &str) -> Result<String, BrokerError> {
    let trimmed = raw.trim_matches('/');
    if trimmed.is_empty() {
        return Ok(ROOT.to_owned());
    }
    let mut normalized = String::with_capacity(trimmed.len() + 1);
    for segment in trimmed.split('/') {
        validate_segment(segment)?;
        normalized.push('/');
        normalized.push_str(segment);
    }
    Ok(normalized)
}

/// 校验单个路径段。
pub fn validate_segment(segment: &str) -> Result<(), BrokerError> {
    if segment.is_empty() {
        return Err(BrokerError::validation("empty path segment"));
    }
    if segment == "." || segment == ".." {
        return Err(BrokerError::validation(format!(
            "relative path segment `{segment}`"
        )));
    }
    if segment.contains('/') {
        return Err(BrokerError::validation(format!(
            "path segment `{segment}` contains `/`"
        )));
    }
    Ok(())
}

/// 将规范路径拆为 `(父路径, 末段名)`；根路径没有父节点。
pub fn split_parent(path: &str) -> Option<(&str, &str)> {
    if path == ROOT {
        return None;
    }
    let idx = path.rfind('/')?;
    let parent = if idx == 0 { ROOT } else { &path[..idx] };
    Some((parent, &path[idx + 1..]))
}

/// 拼接父路径与子节点名。
pub fn join(parent: &str, name: &str) -> String {
    if parent == ROOT {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// `path` 是否严格位于 `prefix` 之下（按段匹配，`/psx` 不在 `/ps` 之下）。
pub fn is_beneath(path: &str, prefix: &str) -> bool {
    if path.len() <= prefix.len() || !path.starts_with(prefix) {
        return false;
    }
    prefix == ROOT || path.as_bytes()[prefix.len()] == b'/'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_prefixes_single_slash() {
        assert_eq!(normalize("ps/topic").as_deref(), Ok("/ps/topic"));
        assert_eq!(normalize("//ps/topic/").as_deref(), Ok("/ps/topic"));
        assert_eq!(normalize("rd/").as_deref(), Ok("/rd"));
        assert_eq!(normalize("").as_deref(), Ok("/"));
    }

    #[test]
    fn normalize_rejects_malformed_segments() {
        assert!(matches!(
            normalize("ps//topic"),
            Err(BrokerError::Validation { .. })
        ));
        assert!(matches!(
            normalize("ps/../rd"),
            Err(BrokerError::Validation { .. })
        ));
    }

    #[test]
    fn split_parent_handles_top_level() {
        assert_eq!(split_parent("/ps"), Some(("/", "ps")));
        assert_eq!(split_parent("/ps/a/b"), Some(("/ps/a", "b")));
        assert_eq!(split_parent("/"), None);
    }

    #[test]
    fn beneath_matches_whole_segments() {
        assert!(is_beneath("/ps/a", "/ps"));
        assert!(is_beneath("/ps/a/b", "/ps"));
        assert!(!is_beneath("/ps", "/ps"));
        assert!(!is_beneath("/psx", "/ps"));
        assert!(is_beneath("/a", "/"));
    }
}
