//! 识别选项、输出模式与扫描统计信息（模块）
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{MagicError, Result};

/// 默认读取前缀大小（字节）
pub const DEFAULT_MAX_BUFFER: usize = 256 * 1024; // 256 KiB
/// 默认 `use` 递归深度上限
pub const DEFAULT_MAX_RECURSION: usize = 20;
/// regex 规则扫描窗口上限（字节）
pub const DEFAULT_REGEX_WINDOW: usize = 64 * 1024;

/// 输出模式（替代位掩码组合）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// 人类可读描述，例如 `PNG image data, 16 x 16`
    Description,
    /// 仅 MIME 类型，例如 `image/png`
    MimeType,
    /// 仅 MIME 编码，例如 `binary` / `us-ascii`
    MimeEncoding,
    /// 组合形式：`image/png; charset=binary`
    Mime,
    /// 常见扩展名，多个以 `/` 分隔；未知时为 `???`
    Extension,
}

/// 文本含有高位字节且不是合法 UTF-8 时采用的编码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackEncoding {
    /// 0xA0..=0xFF 视为 ISO-8859-1，其余高位字节视为 unknown-8bit
    #[default]
    Latin1,
    /// 一律报告 unknown-8bit
    Unknown8bit,
}

/// 识别选项
///
/// 可直接构造，也可从 TOML 配置文件加载（缺省字段取默认值）。
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Options {
    /// 数据库搜索位置（按顺序，取第一个存在的）；为空则使用默认搜索列表
    pub database_paths: Vec<PathBuf>,
    /// 识别文件时是否跟随符号链接
    pub follow_symlinks: bool,
    /// 输入截断长度（字节）
    pub max_buffer: usize,
    /// 全局强制大小写不敏感（string/search/regex）
    pub case_insensitive: bool,
    /// `use` 嵌套深度上限
    pub max_recursion: usize,
    /// regex 扫描窗口上限（字节）
    pub regex_window: usize,
    /// 命中首条顶层规则后继续尝试其余顶层规则
    pub keep_going: bool,
    /// 非 UTF-8 高位文本的回退编码
    pub fallback_encoding: FallbackEncoding,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            database_paths: Vec::new(),
            follow_symlinks: false,
            max_buffer: DEFAULT_MAX_BUFFER,
            case_insensitive: false,
            max_recursion: DEFAULT_MAX_RECURSION,
            regex_window: DEFAULT_REGEX_WINDOW,
            keep_going: false,
            fallback_encoding: FallbackEncoding::Latin1,
        }
    }
}

impl Options {
    /// 从 TOML 配置文件加载选项
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let txt = std::fs::read_to_string(path)?;
        Self::from_toml_str(&txt)
    }

    pub fn from_toml_str(txt: &str) -> Result<Self> {
        toml::from_str(txt).map_err(|e| MagicError::Config(e.to_string()))
    }
}

/// 批量扫描选项
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// 线程数：None 表示自动（等于 CPU 核数）；Some(1) 走串行
    pub threads: Option<usize>,
    /// 目录遍历最大深度；None 表示不限
    pub max_depth: Option<usize>,
}

/// 扫描统计信息（便于 CLI 打印）
#[derive(Debug, Default, Clone)]
pub struct ScanStats {
    pub files_scanned: usize,
    pub files_failed: usize,
    pub outputs_written: usize,
}
