//! 规则数据库：加载、校验、编译格式读写与搜索路径
//!
//! 支持三种来源：
//! - TOML 文本规则文件（`[[rules]]` 数组）
//! - 编译后的二进制数据库（`.msdb`，固定头 + JSON 载荷）
//! - 内置默认规则（`rules/default.toml`，编译期嵌入）
//!
//! 加载完成后的 `RuleSet` 不可变，可通过 `Arc` 在多个线程间只读共享。
use std::collections::HashMap;
use std::io::Write;
use std::mem;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;
use xxhash_rust::xxh3::xxh3_64;
use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{MagicError, Result};
use crate::rules::{parse_entry, Rule, RuleEntry, RuleFile, RuleKind};

/// 编译格式魔数
pub const COMPILED_MAGIC: &[u8; 8] = b"MSNFDB\r\n";
/// 编译格式版本
pub const COMPILED_VERSION: u16 = 1;
/// 字节序标记（按小端写入）
const ENDIAN_MARKER: u16 = 0xFEFF;
/// 编译格式头长度
const HEADER_LEN: usize = mem::size_of::<CompiledHeader>();
/// 编译格式文件扩展名
pub const COMPILED_EXTENSION: &str = "msdb";

/// 环境变量：默认搜索列表的首选位置
pub const DATABASE_ENV: &str = "MAGICSNIFF_DB";

const BUILTIN_RULES: &str = include_str!("../rules/default.toml");

/// 编译格式文件头（32 字节，所有整数按小端存储，无对齐要求）
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct CompiledHeader {
    /// 魔数 `MSNFDB\r\n`
    magic: [u8; 8],
    version: U16,
    /// 恒为 0xFEFF；读到 0xFFFE 说明写入方字节序错误
    endian_marker: U16,
    /// 载荷中的规则条目数
    rule_count: U32,
    payload_len: U64,
    /// 载荷的 XXH3-64 校验和
    checksum: U64,
}

impl CompiledHeader {
    fn new(rule_count: u32, payload: &[u8]) -> Self {
        Self {
            magic: *COMPILED_MAGIC,
            version: U16::new(COMPILED_VERSION),
            endian_marker: U16::new(ENDIAN_MARKER),
            rule_count: U32::new(rule_count),
            payload_len: U64::new(payload.len() as u64),
            checksum: U64::new(xxh3_64(payload)),
        }
    }

    /// 校验魔数、版本与字节序标记
    fn validate(&self) -> Result<()> {
        if &self.magic != COMPILED_MAGIC {
            return Err(MagicError::format("bad magic bytes"));
        }
        let version = self.version.get();
        if version != COMPILED_VERSION {
            return Err(MagicError::format(format!("unsupported version {version} (expected {COMPILED_VERSION})")));
        }
        let marker = self.endian_marker.get();
        if marker != ENDIAN_MARKER {
            return Err(MagicError::format(format!("bad endian marker {marker:#06x}")));
        }
        Ok(())
    }

    /// 校验载荷长度与校验和
    fn validate_payload(&self, payload: &[u8]) -> Result<()> {
        let expected = self.payload_len.get();
        let available = payload.len() as u64;
        if expected != available {
            return Err(MagicError::format(format!("payload length {expected} does not match {available} available bytes")));
        }
        if xxh3_64(payload) != self.checksum.get() {
            return Err(MagicError::format("payload checksum mismatch"));
        }
        Ok(())
    }
}

/// 规则诊断信息（非法规则）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleDiagnostic {
    /// 条目序号（从 1 开始）
    pub index: usize,
    pub reason: String,
}

impl From<RuleDiagnostic> for MagicError {
    fn from(d: RuleDiagnostic) -> Self {
        MagicError::UnsupportedRule { index: d.index, reason: d.reason }
    }
}

/// 已加载的规则集（arena 结构）
///
/// `rules[i]` 的直接子规则下标保存在 `children[i]`；顶层条目按文件顺序
/// 记录在 `top_level`，具名子规则集（`name`）只登记在 `named` 中。
#[derive(Debug)]
pub struct RuleSet {
    entries: Vec<RuleEntry>,
    rules: Vec<Rule>,
    children: Vec<Vec<usize>>,
    top_level: Vec<usize>,
    named: HashMap<String, usize>,
}

impl RuleSet {
    /// 从原始条目构建规则树，校验层级结构
    pub(crate) fn from_entries(entries: Vec<RuleEntry>) -> Result<Self> {
        let mut rules = Vec::with_capacity(entries.len());
        let mut children: Vec<Vec<usize>> = Vec::with_capacity(entries.len());
        let mut top_level = Vec::new();
        let mut named = HashMap::new();
        // path[l] = 最近一条层级为 l 的规则下标
        let mut path: Vec<usize> = Vec::new();

        for (i, entry) in entries.iter().enumerate() {
            let rule = parse_entry(i + 1, entry);
            let level = rule.level as usize;
            if level > path.len() {
                return Err(MagicError::format(format!(
                    "rule #{} jumps to level {} without a parent at level {}",
                    i + 1,
                    level,
                    level.saturating_sub(1)
                )));
            }
            path.truncate(level);
            if let Some(&parent) = path.last() {
                children[parent].push(i);
            } else if let RuleKind::Name(name) = &rule.kind {
                if named.insert(name.clone(), i).is_some() {
                    warn!(name = %name, rule = i + 1, "duplicate named rule set, later definition wins");
                }
            } else {
                top_level.push(i);
            }
            if let RuleKind::Invalid(reason) = &rule.kind {
                debug!(rule = i + 1, %reason, "keeping invalid rule as non-matching");
            }
            path.push(i);
            rules.push(rule);
            children.push(Vec::new());
        }

        Ok(Self { entries, rules, children, top_level, named })
    }

    /// 解析 TOML 文本规则
    pub fn from_toml_str(txt: &str) -> Result<Self> {
        let parsed: RuleFile = toml::from_str(txt).map_err(|e| MagicError::format(e.to_string()))?;
        Self::from_entries(parsed.rules)
    }

    /// 内置默认规则
    pub fn builtin() -> Result<Self> {
        Self::from_toml_str(BUILTIN_RULES)
    }

    /// 解析编译格式数据库；头部或载荷任何不一致都返回 `DatabaseFormat`，不会返回部分结果
    pub fn from_compiled_bytes(bytes: &[u8]) -> Result<Self> {
        let (header, payload) = CompiledHeader::read_from_prefix(bytes)
            .map_err(|_| MagicError::format(format!("truncated header ({} of {HEADER_LEN} bytes)", bytes.len())))?;
        header.validate()?;
        header.validate_payload(payload)?;
        let count = header.rule_count.get() as usize;
        let entries: Vec<RuleEntry> = serde_json::from_slice(payload).map_err(|e| MagicError::format(e.to_string()))?;
        if entries.len() != count {
            return Err(MagicError::format(format!("header announces {count} rules, payload has {}", entries.len())));
        }
        Self::from_entries(entries)
    }

    /// 写出编译格式
    pub fn compile_to(&self, out: &mut dyn Write) -> Result<()> {
        let payload = serde_json::to_vec(&self.entries).map_err(std::io::Error::from)?;
        let count = u32::try_from(self.entries.len()).map_err(|_| MagicError::format("too many rules"))?;
        out.write_all(CompiledHeader::new(count, &payload).as_bytes())?;
        out.write_all(&payload)?;
        Ok(())
    }

    /// 从文件或目录加载
    ///
    /// - 目录：加载其中所有 `*.toml` / `*.msdb`（不递归，按文件名排序）并依序拼接
    /// - 文件：`.msdb` 扩展名、以编译魔数开头或非 UTF-8 内容按编译格式解析，否则按 TOML 解析
    pub fn load(path: &Path) -> Result<Self> {
        if path.is_dir() {
            let mut files: Vec<PathBuf> = Vec::new();
            for entry in WalkDir::new(path).min_depth(1).max_depth(1) {
                let entry = match entry { Ok(e) => e, Err(_) => continue };
                let is_db = entry
                    .path()
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e == "toml" || e == COMPILED_EXTENSION);
                if entry.file_type().is_file() && is_db {
                    files.push(entry.into_path());
                }
            }
            files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
            let mut entries = Vec::new();
            for file in &files {
                entries.extend(read_entries(file)?);
            }
            info!(path = %path.display(), files = files.len(), rules = entries.len(), "loaded magic directory");
            return Self::from_entries(entries).map_err(|e| e.with_origin(path));
        }

        let entries = read_entries(path)?;
        let set = Self::from_entries(entries).map_err(|e| e.with_origin(path))?;
        info!(path = %path.display(), rules = set.len(), "loaded magic database");
        Ok(set)
    }

    /// 在搜索列表中查找第一个存在的位置并加载；列表为空时使用默认搜索列表
    pub fn search(paths: &[PathBuf]) -> Result<(PathBuf, Self)> {
        let candidates = if paths.is_empty() { default_search_paths() } else { paths.to_vec() };
        for candidate in &candidates {
            if candidate.exists() {
                let set = Self::load(candidate)?;
                return Ok((candidate.clone(), set));
            }
            debug!(path = %candidate.display(), "magic database location does not exist");
        }
        Err(MagicError::NotFound { searched: candidates })
    }

    /// 规则总数（含非法规则与具名子规则）
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// 顶层条目数
    pub fn top_level_count(&self) -> usize {
        self.top_level.len()
    }

    /// 具名子规则集名称（排序后）
    pub fn named_sets(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.named.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// 所有非法规则的诊断信息
    pub fn diagnostics(&self) -> Vec<RuleDiagnostic> {
        self.rules
            .iter()
            .filter_map(|r| match &r.kind {
                RuleKind::Invalid(reason) => Some(RuleDiagnostic { index: r.index, reason: reason.clone() }),
                _ => None,
            })
            .collect()
    }

    /// 严格校验：存在非法规则时返回第一条对应的 `UnsupportedRule`
    pub fn validate(&self) -> Result<()> {
        match self.diagnostics().into_iter().next() {
            Some(d) => Err(d.into()),
            None => Ok(()),
        }
    }

    pub(crate) fn rule(&self, idx: usize) -> &Rule {
        &self.rules[idx]
    }

    pub(crate) fn children(&self, idx: usize) -> &[usize] {
        &self.children[idx]
    }

    pub(crate) fn top_level(&self) -> &[usize] {
        &self.top_level
    }

    pub(crate) fn named(&self, name: &str) -> Option<usize> {
        self.named.get(name).copied()
    }
}

fn read_entries(path: &Path) -> Result<Vec<RuleEntry>> {
    let bytes = std::fs::read(path)?;
    let by_extension = path.extension().and_then(|e| e.to_str()) == Some(COMPILED_EXTENSION);
    let by_content = bytes.starts_with(&COMPILED_MAGIC[..4]);
    let text = if by_extension || by_content { None } else { std::str::from_utf8(&bytes).ok() };
    match text {
        Some(txt) => {
            let parsed: RuleFile = toml::from_str(txt).map_err(|e| MagicError::format(e.to_string()).with_origin(path))?;
            Ok(parsed.rules)
        }
        None => {
            let set = RuleSet::from_compiled_bytes(&bytes).map_err(|e| e.with_origin(path))?;
            Ok(set.entries)
        }
    }
}

/// 默认搜索列表：`$MAGICSNIFF_DB` → `./rules/default.toml` → `/usr/share/magicsniff`
pub fn default_search_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(v) = std::env::var_os(DATABASE_ENV) {
        out.extend(std::env::split_paths(&v).filter(|p| !p.as_os_str().is_empty()));
    }
    out.push(PathBuf::from("./rules/default.toml"));
    out.push(PathBuf::from("/usr/share/magicsniff"));
    out
}
