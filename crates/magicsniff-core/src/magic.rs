//! 识别入口：规则集 + 选项
//!
//! `Magic` 可廉价克隆并在线程间共享；每次识别使用独立的临时状态。
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::database::RuleSet;
use crate::encoding::classify;
use crate::error::Result;
use crate::evaluator::{evaluate, EvalOptions, Verdict};
use crate::format::assemble;
use crate::matcher::MatchOptions;
use crate::options::{Options, OutputMode};
use crate::types::Identification;

/// 内容识别器
#[derive(Debug, Clone)]
pub struct Magic {
    rules: Arc<RuleSet>,
    options: Options,
}

impl Magic {
    /// 按 `options.database_paths`（为空则默认列表）查找并加载数据库
    pub fn open(options: Options) -> Result<Self> {
        let (path, rules) = RuleSet::search(&options.database_paths)?;
        debug!(path = %path.display(), rules = rules.len(), "magic database ready");
        Ok(Self::with_rules(Arc::new(rules), options))
    }

    /// 使用内置规则
    pub fn builtin(options: Options) -> Result<Self> {
        Ok(Self::with_rules(Arc::new(RuleSet::builtin()?), options))
    }

    pub fn with_rules(rules: Arc<RuleSet>, options: Options) -> Self {
        Self { rules, options }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// 识别内存缓冲区，按输出模式返回字符串
    pub fn identify(&self, buf: &[u8], mode: OutputMode) -> Result<String> {
        Ok(self.identify_full(buf)?.render(mode))
    }

    /// 识别内存缓冲区，返回完整结果（超过 `max_buffer` 的部分被忽略）
    pub fn identify_full(&self, buf: &[u8]) -> Result<Identification> {
        let buf = &buf[..buf.len().min(self.options.max_buffer)];
        let class = classify(buf, self.options.fallback_encoding);
        if buf.is_empty() {
            return Ok(assemble(Verdict::Unclassified, &class, buf));
        }
        let verdict = evaluate(&self.rules, buf, self.eval_options())?;
        Ok(assemble(verdict, &class, buf))
    }

    pub fn identify_file(&self, path: &Path, mode: OutputMode) -> Result<String> {
        Ok(self.identify_file_full(path)?.render(mode))
    }

    /// 识别文件：非普通文件按文件系统类型直接给出结果，普通文件读取前 `max_buffer` 字节
    pub fn identify_file_full(&self, path: &Path) -> Result<Identification> {
        let meta = if self.options.follow_symlinks { fs::metadata(path)? } else { fs::symlink_metadata(path)? };
        if let Some(special) = special_file(path, &meta) {
            return Ok(special);
        }
        let file = fs::File::open(path)?;
        let mut buf = Vec::with_capacity((meta.len() as usize).min(self.options.max_buffer));
        file.take(self.options.max_buffer as u64).read_to_end(&mut buf)?;
        self.identify_full(&buf)
    }

    fn eval_options(&self) -> EvalOptions {
        EvalOptions {
            matching: MatchOptions {
                case_insensitive: self.options.case_insensitive,
                regex_window: self.options.regex_window,
            },
            max_recursion: self.options.max_recursion,
            keep_going: self.options.keep_going,
        }
    }
}

fn inode(description: String, mime: &str) -> Identification {
    Identification {
        description,
        mime_type: mime.to_string(),
        mime_encoding: "binary".to_string(),
        extensions: None,
    }
}

/// 文件系统层面的预分类
fn special_file(path: &Path, meta: &fs::Metadata) -> Option<Identification> {
    let ft = meta.file_type();
    if ft.is_dir() {
        return Some(inode("directory".to_string(), "inode/directory"));
    }
    if ft.is_symlink() {
        let target = fs::read_link(path).unwrap_or_else(|_| PathBuf::from("?"));
        return Some(inode(format!("symbolic link to {}", target.display()), "inode/symlink"));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if ft.is_fifo() {
            return Some(inode("fifo (named pipe)".to_string(), "inode/fifo"));
        }
        if ft.is_socket() {
            return Some(inode("socket".to_string(), "inode/socket"));
        }
        if ft.is_block_device() {
            return Some(inode("block special".to_string(), "inode/blockdevice"));
        }
        if ft.is_char_device() {
            return Some(inode("character special".to_string(), "inode/chardevice"));
        }
    }
    None
}
