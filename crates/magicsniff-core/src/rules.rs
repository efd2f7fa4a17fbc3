//! 规则条目解析（TOML 文本 → 内部规则）
//!
//! 每条规则的 offset / type / test 字段沿用经典 magic(5) 的写法，例如：
//!
//! ```toml
//! [[rules]]
//! offset = "0"
//! type = "string"
//! test = '\x89PNG\r\n\x1a\n'
//! desc = "PNG image data"
//! mime = "image/png"
//!
//! [[rules]]
//! level = 1
//! offset = "(0x3c.l)"
//! type = "belong&0xffff0000"
//! test = "=0x50450000"
//! ```
//!
//! 单条规则字段非法时不会导致整个数据库加载失败：该规则保留在原位置
//! （保持树结构），类型记为 `RuleKind::Invalid`，求值时视为不匹配。
use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use regex::bytes::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

/// regex 规则默认扫描窗口（字节）
pub(crate) const REGEX_DEFAULT_WINDOW: usize = 8 * 1024;
/// regex 编译大小上限，防止恶意规则耗尽内存
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// 单条规则的原始配置（TOML / 编译格式共用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RuleEntry {
    #[serde(default)]
    pub level: u32,
    pub offset: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_test")]
    pub test: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<String>,
}

fn default_test() -> String {
    "x".to_string()
}

/// 顶层规则文件结构
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RuleFile {
    #[serde(default)]
    pub rules: Vec<RuleEntry>,
}

/// 字节序
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Endian {
    Little,
    Big,
}

/// 间接偏移的附加运算
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    And,
    Or,
}

/// 规则偏移
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Offset {
    /// 绝对偏移；负数表示从缓冲区末尾倒数
    Absolute(i64),
    /// `&N`：相对父规则匹配结束位置
    Relative(i64),
    /// `(base.t op n)`：从 base 处读取指针，再做一次运算
    Indirect {
        base: Box<Offset>,
        width: usize,
        endian: Endian,
        adjust: Option<(ArithOp, i64)>,
        /// `&(...)`：结果再加上父规则匹配结束位置
        relative: bool,
    },
}

/// 数值比较运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NumOp {
    Any,
    Eq,
    Ne,
    Lt,
    Gt,
    /// `&v`：v 的所有位均被置位
    AllSet,
    /// `^v`：v 的所有位均为 0
    AllClear,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NumericTest {
    pub width: usize,
    pub endian: Endian,
    pub signed: bool,
    pub mask: Option<u64>,
    pub op: NumOp,
    pub value: i64,
    /// 日期类型（`date` / `ldate` 等），值按秒级时间戳渲染为 UTC
    pub date: bool,
}

/// 字符串比较运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StrOp {
    Any,
    Eq,
    Ne,
    Lt,
    Gt,
}

/// 字符串修饰符（`string/cwt` 等）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct StringFlags {
    /// `c`：模式中的小写字母可匹配任意大小写
    pub lower_ci: bool,
    /// `C`：模式中的大写字母可匹配任意大小写
    pub upper_ci: bool,
    /// `w`：模式中的空白在目标中可选
    pub optional_ws: bool,
    /// `W`：模式中的空白匹配目标中一个或多个空白
    pub compact_ws: bool,
    /// `t`：文本规则
    pub text: bool,
    /// `T`：输出时裁剪首尾空白
    pub trim: bool,
}

impl StringFlags {
    pub(crate) fn any_case_folding(&self) -> bool {
        self.lower_ci || self.upper_ci
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StringTest {
    pub op: StrOp,
    pub pattern: Vec<u8>,
    pub flags: StringFlags,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PStringTest {
    pub len_width: usize,
    pub len_endian: Endian,
    /// `J`：长度字段包含自身
    pub len_includes_self: bool,
    pub string: StringTest,
}

#[derive(Debug, Clone)]
pub(crate) struct SearchTest {
    pub range: usize,
    pub negate: bool,
    pub pattern: Vec<u8>,
    pub flags: StringFlags,
    pub finder: AhoCorasick,
    /// 全局大小写不敏感时使用；规则自身已不敏感时为 None
    pub folded: Option<AhoCorasick>,
}

#[derive(Debug, Clone)]
pub(crate) struct RegexTest {
    pub window: usize,
    /// `s`：匹配结束位置取匹配起点
    pub start_only: bool,
    pub text: bool,
    pub regex: Regex,
    pub folded: Option<Regex>,
}

/// 规则类型
#[derive(Debug, Clone)]
pub(crate) enum RuleKind {
    Numeric(NumericTest),
    String(StringTest),
    PString(PStringTest),
    Search(SearchTest),
    Regex(RegexTest),
    /// 定义具名子规则集
    Name(String),
    /// 调用具名子规则集
    Use(String),
    /// 同级尚无规则命中时匹配
    Default,
    /// 重置同级命中标记
    Clear,
    /// 字段非法，保留以维持树结构
    Invalid(String),
}

/// 归一化后的规则（不可变）
#[derive(Debug, Clone)]
pub(crate) struct Rule {
    /// 条目序号（从 1 开始），用于诊断信息
    pub index: usize,
    pub level: u32,
    pub offset: Offset,
    pub kind: RuleKind,
    pub desc: String,
    pub mime: Option<String>,
    pub ext: Option<String>,
}

impl Rule {
    /// 是否为文本规则（影响描述后缀）
    pub(crate) fn is_text(&self) -> bool {
        match &self.kind {
            RuleKind::String(s) => s.flags.text,
            RuleKind::PString(p) => p.string.flags.text,
            RuleKind::Search(s) => s.flags.text,
            RuleKind::Regex(r) => r.text,
            _ => false,
        }
    }
}

/// 将原始条目解析为规则；字段非法时返回 `RuleKind::Invalid`
pub(crate) fn parse_entry(index: usize, entry: &RuleEntry) -> Rule {
    let parsed = parse_offset(&entry.offset)
        .and_then(|offset| parse_kind(&entry.kind, &entry.test).map(|kind| (offset, kind)));
    let (offset, kind) = match parsed {
        Ok(v) => v,
        Err(reason) => (Offset::Absolute(0), RuleKind::Invalid(reason)),
    };
    Rule {
        index,
        level: entry.level,
        offset,
        kind,
        desc: entry.desc.clone(),
        mime: entry.mime.clone().filter(|m| !m.trim().is_empty()),
        ext: entry.ext.clone().filter(|e| !e.trim().is_empty()),
    }
}

/// 解析整数：支持负号、0x 十六进制、前导 0 八进制
pub(crate) fn parse_int(s: &str) -> Result<i64, String> {
    let t = s.trim();
    let (neg, body) = match t.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, t.strip_prefix('+').unwrap_or(t)),
    };
    if body.is_empty() {
        return Err(format!("invalid number `{s}`"));
    }
    let parsed = if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map(|v| v as i64)
    } else if body.len() > 1 && body.starts_with('0') {
        u64::from_str_radix(&body[1..], 8).map(|v| v as i64)
    } else {
        body.parse::<u64>().map(|v| v as i64)
    };
    match parsed {
        Ok(v) if neg => Ok(v.wrapping_neg()),
        Ok(v) => Ok(v),
        Err(_) => Err(format!("invalid number `{s}`")),
    }
}

/// 解析偏移字段
pub(crate) fn parse_offset(s: &str) -> Result<Offset, String> {
    let t = s.trim();
    if t.is_empty() {
        return Err("empty offset".to_string());
    }
    if let Some(rest) = t.strip_prefix('&') {
        if rest.starts_with('(') {
            return parse_indirect(rest, true);
        }
        return parse_int(rest).map(Offset::Relative);
    }
    if t.starts_with('(') {
        return parse_indirect(t, false);
    }
    parse_int(t).map(Offset::Absolute)
}

fn parse_indirect(s: &str, relative: bool) -> Result<Offset, String> {
    let inner = s
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(|| format!("unbalanced indirect offset `{s}`"))?;

    let (base_rel, rest) = match inner.strip_prefix('&') {
        Some(r) => (true, r),
        None => (false, inner),
    };
    let num_len = rest.find(|c: char| !(c.is_ascii_alphanumeric())).unwrap_or(rest.len());
    let (num, mut rest) = rest.split_at(num_len);
    // `0x3c.l` 中的数字段不能吞掉类型字母：类型总在 '.' 之后
    let base_val = parse_int(num)?;
    let base = if base_rel { Offset::Relative(base_val) } else { Offset::Absolute(base_val) };

    let (mut width, mut endian) = (4, Endian::Little);
    if let Some(r) = rest.strip_prefix('.') {
        let mut chars = r.chars();
        let t = chars.next().ok_or_else(|| format!("missing indirect type in `{s}`"))?;
        (width, endian) = match t {
            'b' | 'c' | 'B' | 'C' => (1, Endian::Little),
            's' | 'h' => (2, Endian::Little),
            'S' | 'H' => (2, Endian::Big),
            'l' => (4, Endian::Little),
            'L' => (4, Endian::Big),
            'q' => (8, Endian::Little),
            'Q' => (8, Endian::Big),
            other => return Err(format!("unknown indirect type `{other}`")),
        };
        rest = chars.as_str();
    }

    let adjust = if rest.is_empty() {
        None
    } else {
        let mut chars = rest.chars();
        let op = match chars.next() {
            Some('+') => ArithOp::Add,
            Some('-') => ArithOp::Sub,
            Some('*') => ArithOp::Mul,
            Some('/') => ArithOp::Div,
            Some('&') => ArithOp::And,
            Some('|') => ArithOp::Or,
            _ => return Err(format!("invalid indirect adjustment in `{s}`")),
        };
        Some((op, parse_int(chars.as_str())?))
    };

    Ok(Offset::Indirect { base: Box::new(base), width, endian, adjust, relative })
}

/// 解析类型字段（结合 test 字段）
pub(crate) fn parse_kind(ty: &str, test: &str) -> Result<RuleKind, String> {
    let ty = ty.trim();
    let mut segments = ty.split('/');
    let head = segments.next().unwrap_or_default();
    let modifiers: Vec<&str> = segments.collect();
    let (name, mask) = match head.split_once('&') {
        Some((n, m)) => (n, Some(parse_int(m)? as u64)),
        None => (head, None),
    };
    if mask.is_some() && !modifiers.is_empty() {
        return Err(format!("type `{ty}` mixes mask and modifiers"));
    }

    match name {
        "string" => {
            let (flags, range, _) = parse_modifiers(name, &modifiers, "")?;
            reject_range(name, range)?;
            Ok(RuleKind::String(parse_string_test(test, flags)?))
        }
        "pstring" => parse_pstring(&modifiers, test),
        "search" => parse_search(&modifiers, test),
        "regex" => parse_regex(&modifiers, test),
        "name" | "use" => {
            no_modifiers(name, &modifiers, mask)?;
            let ident = test.trim();
            if ident.is_empty() || ident == "x" {
                return Err(format!("`{name}` requires an identifier"));
            }
            Ok(if name == "name" { RuleKind::Name(ident.to_string()) } else { RuleKind::Use(ident.to_string()) })
        }
        "default" => no_modifiers(name, &modifiers, mask).map(|_| RuleKind::Default),
        "clear" => no_modifiers(name, &modifiers, mask).map(|_| RuleKind::Clear),
        _ => {
            if !modifiers.is_empty() {
                return Err(format!("numeric type `{name}` takes no modifiers"));
            }
            parse_numeric(name, mask, test)
        }
    }
}

fn no_modifiers(name: &str, modifiers: &[&str], mask: Option<u64>) -> Result<(), String> {
    if modifiers.is_empty() && mask.is_none() {
        Ok(())
    } else {
        Err(format!("`{name}` takes no modifiers"))
    }
}

fn reject_range(name: &str, range: Option<usize>) -> Result<(), String> {
    match range {
        Some(_) => Err(format!("`{name}` takes no range")),
        None => Ok(()),
    }
}

/// 解析 `/` 分隔的修饰符：数字段为范围，其余为标志字符。
/// `extra` 为该类型额外允许的标志字符，返回未被识别为通用标志的那些。
fn parse_modifiers(name: &str, modifiers: &[&str], extra: &str) -> Result<(StringFlags, Option<usize>, Vec<char>), String> {
    let mut flags = StringFlags::default();
    let mut range = None;
    let mut rest = Vec::new();
    for seg in modifiers {
        if seg.is_empty() {
            continue;
        }
        if seg.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            let n = parse_int(seg)?;
            if n <= 0 {
                return Err(format!("`{name}` range must be positive"));
            }
            range = Some(n as usize);
            continue;
        }
        for ch in seg.chars() {
            match ch {
                'c' => flags.lower_ci = true,
                'C' => flags.upper_ci = true,
                'w' => flags.optional_ws = true,
                'W' => flags.compact_ws = true,
                't' => flags.text = true,
                'b' => flags.text = false,
                'T' => flags.trim = true,
                other if extra.contains(other) => rest.push(other),
                other => return Err(format!("unknown modifier `{other}` for `{name}`")),
            }
        }
    }
    Ok((flags, range, rest))
}

fn parse_string_test(test: &str, flags: StringFlags) -> Result<StringTest, String> {
    if test.trim() == "x" {
        return Ok(StringTest { op: StrOp::Any, pattern: Vec::new(), flags });
    }
    let (op, body) = match test.chars().next() {
        Some('=') => (StrOp::Eq, &test[1..]),
        Some('!') => (StrOp::Ne, &test[1..]),
        Some('<') => (StrOp::Lt, &test[1..]),
        Some('>') => (StrOp::Gt, &test[1..]),
        _ => (StrOp::Eq, test),
    };
    let pattern = unescape(body)?;
    if pattern.is_empty() {
        return Err("empty string pattern".to_string());
    }
    Ok(StringTest { op, pattern, flags })
}

fn parse_pstring(modifiers: &[&str], test: &str) -> Result<RuleKind, String> {
    let (flags, range, extra) = parse_modifiers("pstring", modifiers, "BHhLlJ")?;
    reject_range("pstring", range)?;
    let (mut len_width, mut len_endian, mut len_includes_self) = (1, Endian::Little, false);
    for ch in extra {
        match ch {
            'B' => len_width = 1,
            'H' => (len_width, len_endian) = (2, Endian::Big),
            'h' => (len_width, len_endian) = (2, Endian::Little),
            'L' => (len_width, len_endian) = (4, Endian::Big),
            'l' => (len_width, len_endian) = (4, Endian::Little),
            _ => len_includes_self = true,
        }
    }
    let string = parse_string_test(test, flags)?;
    Ok(RuleKind::PString(PStringTest { len_width, len_endian, len_includes_self, string }))
}

fn parse_search(modifiers: &[&str], test: &str) -> Result<RuleKind, String> {
    let (flags, range, _) = parse_modifiers("search", modifiers, "")?;
    let range = range.ok_or_else(|| "`search` requires a range (search/N)".to_string())?;
    let st = parse_string_test(test, flags)?;
    let negate = match st.op {
        StrOp::Eq => false,
        StrOp::Ne => true,
        StrOp::Any => return Err("`search` requires a pattern".to_string()),
        StrOp::Lt | StrOp::Gt => return Err("`search` supports only `=` and `!`".to_string()),
    };
    let own_ci = flags.any_case_folding();
    let finder = build_finder(&st.pattern, own_ci)?;
    let folded = if own_ci { None } else { Some(build_finder(&st.pattern, true)?) };
    Ok(RuleKind::Search(SearchTest { range, negate, pattern: st.pattern, flags, finder, folded }))
}

fn build_finder(pattern: &[u8], ci: bool) -> Result<AhoCorasick, String> {
    AhoCorasickBuilder::new()
        .ascii_case_insensitive(ci)
        .build([pattern])
        .map_err(|e| format!("cannot build search automaton: {e}"))
}

fn parse_regex(modifiers: &[&str], test: &str) -> Result<RuleKind, String> {
    let (flags, range, extra) = parse_modifiers("regex", modifiers, "s")?;
    let start_only = extra.contains(&'s');
    let pattern = test.trim();
    if pattern.is_empty() || pattern == "x" {
        return Err("`regex` requires a pattern".to_string());
    }
    let own_ci = flags.any_case_folding();
    let regex = build_regex(pattern, own_ci)?;
    let folded = if own_ci { None } else { Some(build_regex(pattern, true)?) };
    Ok(RuleKind::Regex(RegexTest {
        window: range.unwrap_or(REGEX_DEFAULT_WINDOW),
        start_only,
        text: flags.text,
        regex,
        folded,
    }))
}

fn build_regex(pattern: &str, ci: bool) -> Result<Regex, String> {
    RegexBuilder::new(pattern)
        .case_insensitive(ci)
        .multi_line(true)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
        .map_err(|e| format!("invalid regex: {e}"))
}

fn parse_numeric(name: &str, mask: Option<u64>, test: &str) -> Result<RuleKind, String> {
    let (signed, rest) = match name.strip_prefix('u') {
        Some(r) => (false, r),
        None => (true, name),
    };
    let (endian, base) = if let Some(r) = rest.strip_prefix("be") {
        (Endian::Big, r)
    } else if let Some(r) = rest.strip_prefix("le") {
        (Endian::Little, r)
    } else {
        // 无前缀的“本机序”统一按小端处理，保证结果与宿主无关
        (Endian::Little, rest)
    };
    let (width, date) = match base {
        "byte" => (1, false),
        "short" => (2, false),
        "long" => (4, false),
        "quad" => (8, false),
        "date" | "ldate" => (4, true),
        "qdate" | "qldate" => (8, true),
        _ => return Err(format!("unknown type `{name}`")),
    };
    if width == 1 && base == "byte" && (rest.starts_with("be") || rest.starts_with("le")) {
        return Err(format!("byte type takes no endianness: `{name}`"));
    }
    let (op, value) = parse_numeric_test(test)?;
    Ok(RuleKind::Numeric(NumericTest { width, endian, signed, mask, op, value, date }))
}

fn parse_numeric_test(test: &str) -> Result<(NumOp, i64), String> {
    let t = test.trim();
    if t == "x" {
        return Ok((NumOp::Any, 0));
    }
    let (op, body) = match t.chars().next() {
        Some('=') => (NumOp::Eq, &t[1..]),
        Some('!') => (NumOp::Ne, &t[1..]),
        Some('<') => (NumOp::Lt, &t[1..]),
        Some('>') => (NumOp::Gt, &t[1..]),
        Some('&') => (NumOp::AllSet, &t[1..]),
        Some('^') => (NumOp::AllClear, &t[1..]),
        _ => (NumOp::Eq, t),
    };
    Ok((op, parse_int(body)?))
}

/// 还原 C 风格转义：`\x89` `\r` `\n` `\t` `\0` `\\` `\ ` 以及八进制 `\032`
pub(crate) fn unescape(s: &str) -> Result<Vec<u8>, String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b != b'\\' {
            out.push(b);
            i += 1;
            continue;
        }
        i += 1;
        let Some(&e) = bytes.get(i) else {
            return Err("dangling escape at end of pattern".to_string());
        };
        match e {
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'v' => out.push(0x0b),
            b'f' => out.push(0x0c),
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'x' => {
                let digits: Vec<u8> = bytes[i + 1..].iter().take(2).take_while(|c| c.is_ascii_hexdigit()).copied().collect();
                if digits.is_empty() {
                    return Err("`\\x` without hex digits".to_string());
                }
                let txt = std::str::from_utf8(&digits).map_err(|e| e.to_string())?;
                out.push(u8::from_str_radix(txt, 16).map_err(|e| e.to_string())?);
                i += digits.len();
            }
            b'0'..=b'7' => {
                let digits: Vec<u8> = bytes[i..].iter().take(3).take_while(|c| (b'0'..=b'7').contains(c)).copied().collect();
                let txt = std::str::from_utf8(&digits).map_err(|e| e.to_string())?;
                let v = u32::from_str_radix(txt, 8).map_err(|e| e.to_string())?;
                out.push((v & 0xff) as u8);
                i += digits.len() - 1;
            }
            other => out.push(other),
        }
        i += 1;
    }
    Ok(out)
}
