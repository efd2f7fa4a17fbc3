//! 错误类型
use std::path::PathBuf;
use thiserror::Error;

/// 引擎对外暴露的全部错误
///
/// - 配置类错误（`NotFound` / `DatabaseFormat`）：构建数据库时立即返回，不重试
/// - 单条规则错误（`UnsupportedRule`）：求值时记录日志并跳过，仅在校验时向外报告
/// - 资源限制（`RecursionLimit`）：中止本次识别
#[derive(Debug, Error)]
pub enum MagicError {
    #[error("no magic database found (searched: {})", display_paths(.searched))]
    NotFound { searched: Vec<PathBuf> },

    #[error("malformed magic database{}: {reason}", display_origin(.origin))]
    DatabaseFormat { origin: Option<PathBuf>, reason: String },

    #[error("rule recursion limit exceeded (max depth {limit})")]
    RecursionLimit { limit: usize },

    #[error("unsupported rule #{index}: {reason}")]
    UnsupportedRule { index: usize, reason: String },

    #[error("invalid options: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MagicError {
    pub(crate) fn format(reason: impl Into<String>) -> Self {
        MagicError::DatabaseFormat { origin: None, reason: reason.into() }
    }

    /// 为格式错误补充来源路径（其他错误原样返回）
    pub(crate) fn with_origin(self, path: &std::path::Path) -> Self {
        match self {
            MagicError::DatabaseFormat { origin: None, reason } => {
                MagicError::DatabaseFormat { origin: Some(path.to_path_buf()), reason }
            }
            other => other,
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return "<none>".to_string();
    }
    paths.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", ")
}

fn display_origin(origin: &Option<PathBuf>) -> String {
    match origin {
        Some(p) => format!(" `{}`", p.display()),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, MagicError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_error_origin() {
        let err = MagicError::format("bad magic bytes").with_origin(std::path::Path::new("db.msdb"));
        assert_eq!(err.to_string(), "malformed magic database `db.msdb`: bad magic bytes");
    }

    #[test]
    fn test_not_found_lists_paths() {
        let err = MagicError::NotFound { searched: vec![PathBuf::from("a"), PathBuf::from("b")] };
        assert_eq!(err.to_string(), "no magic database found (searched: a, b)");
    }
}
