//! 基于魔数规则的内容类型识别库
//!
//! 设计要点：
//! - 规则库以 TOML 描述（字段语法沿用 magic(5)），也可编译为带校验和的二进制格式。
//! - 规则按层级组织为树，顶层按声明顺序尝试，第一条命中者胜出。
//! - 无规则命中时回退到编码探测（empty / data / 各类文本）。
//! - 所有偏移访问均做越界检查，畸形输入只会导致“不匹配”，不会崩溃。

mod database;
mod encoding;
mod error;
mod evaluator;
mod format;
mod magic;
mod matcher;
mod options;
mod rules;
mod scan;
mod types;

pub use database::{
    default_search_paths, RuleDiagnostic, RuleSet, COMPILED_EXTENSION, COMPILED_MAGIC, COMPILED_VERSION, DATABASE_ENV,
};
pub use encoding::{classify, Classification, TextEncoding, TextTraits};
pub use error::{MagicError, Result};
pub use magic::Magic;
pub use options::{
    FallbackEncoding, Options, OutputMode, ScanOptions, ScanStats, DEFAULT_MAX_BUFFER, DEFAULT_MAX_RECURSION,
    DEFAULT_REGEX_WINDOW,
};
pub use scan::scan_and_write;
pub use types::{Identification, OutputItem, UNKNOWN_EXTENSION};
