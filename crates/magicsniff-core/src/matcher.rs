//! 单条规则匹配
//!
//! 越界偏移、指针运算溢出一律视为“不匹配”，不会报错；只有非法规则返回
//! `UnsupportedRule`。
use std::cmp::Ordering;

use crate::error::{MagicError, Result};
use crate::rules::{
    ArithOp, Endian, NumOp, NumericTest, Offset, PStringTest, RegexTest, Rule, RuleKind, SearchTest,
    StrOp, StringFlags, StringTest,
};

/// `string x` 读取的最大长度
const MAX_STRING_VALUE: usize = 96;

/// 匹配时的全局参数
#[derive(Debug, Clone, Copy)]
pub(crate) struct MatchOptions {
    pub case_insensitive: bool,
    pub regex_window: usize,
}

/// 偏移解析所需的位置信息
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Frame {
    /// 绝对偏移的基准（`use` 调用处的偏移，顶层为 0）
    pub base: usize,
    /// 父规则匹配结束位置（`&N` 的基准）
    pub parent_end: usize,
}

/// 匹配得到的值（用于描述模板渲染）
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Value {
    None,
    Signed(i64),
    Unsigned(u64),
    Bytes(Vec<u8>),
    Date(i64),
}

/// 一次成功匹配
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MatchOutcome {
    /// 规则实际比较的起始位置
    pub offset: usize,
    /// 匹配结束位置，子规则的相对偏移以此为基准
    pub end: usize,
    pub value: Value,
}

/// 对缓冲区求值一条规则
pub(crate) fn match_rule(rule: &Rule, buf: &[u8], frame: Frame, opts: MatchOptions) -> Result<Option<MatchOutcome>> {
    let test = match &rule.kind {
        RuleKind::Invalid(reason) => {
            return Err(MagicError::UnsupportedRule { index: rule.index, reason: reason.clone() });
        }
        // 控制类规则由求值器处理
        RuleKind::Name(_) | RuleKind::Use(_) | RuleKind::Default | RuleKind::Clear => return Ok(None),
        kind => kind,
    };
    let Some(off) = resolve_offset(&rule.offset, buf, frame) else {
        return Ok(None);
    };
    let outcome = match test {
        RuleKind::Numeric(n) => match_numeric(n, buf, off),
        RuleKind::String(s) => match_string(s, buf, off, opts.case_insensitive),
        RuleKind::PString(p) => match_pstring(p, buf, off, opts.case_insensitive),
        RuleKind::Search(s) => match_search(s, buf, off, opts.case_insensitive),
        RuleKind::Regex(r) => match_regex(r, buf, off, opts),
        _ => None,
    };
    Ok(outcome)
}

/// 解析偏移；越界或溢出返回 None
pub(crate) fn resolve_offset(offset: &Offset, buf: &[u8], frame: Frame) -> Option<usize> {
    match offset {
        Offset::Absolute(n) if *n >= 0 => frame.base.checked_add(usize::try_from(*n).ok()?),
        Offset::Absolute(n) => buf.len().checked_sub(usize::try_from(n.unsigned_abs()).ok()?),
        Offset::Relative(n) => {
            let pos = i64::try_from(frame.parent_end).ok()?.checked_add(*n)?;
            usize::try_from(pos).ok()
        }
        Offset::Indirect { base, width, endian, adjust, relative } => {
            let at = resolve_offset(base, buf, frame)?;
            let ptr = read_uint(buf, at, *width, *endian)?;
            let ptr = match adjust {
                None => ptr,
                Some((op, v)) => apply_arith(ptr, *op, *v)?,
            };
            let ptr = usize::try_from(ptr).ok()?;
            if *relative {
                frame.parent_end.checked_add(ptr)
            } else {
                frame.base.checked_add(ptr)
            }
        }
    }
}

fn apply_arith(ptr: u64, op: ArithOp, v: i64) -> Option<u64> {
    match op {
        ArithOp::Add => ptr.checked_add_signed(v),
        ArithOp::Sub => ptr.checked_add_signed(v.checked_neg()?),
        ArithOp::Mul => ptr.checked_mul(u64::try_from(v).ok()?),
        ArithOp::Div => ptr.checked_div(u64::try_from(v).ok()?),
        ArithOp::And => Some(ptr & v as u64),
        ArithOp::Or => Some(ptr | v as u64),
    }
}

/// 按宽度与字节序读取无符号整数
pub(crate) fn read_uint(buf: &[u8], at: usize, width: usize, endian: Endian) -> Option<u64> {
    let bytes = buf.get(at..at.checked_add(width)?)?;
    let mut v: u64 = 0;
    match endian {
        Endian::Big => {
            for &b in bytes {
                v = (v << 8) | b as u64;
            }
        }
        Endian::Little => {
            for &b in bytes.iter().rev() {
                v = (v << 8) | b as u64;
            }
        }
    }
    Some(v)
}

fn width_mask(width: usize) -> u64 {
    if width >= 8 {
        u64::MAX
    } else {
        (1u64 << (width * 8)) - 1
    }
}

fn sign_extend(v: u64, width: usize) -> i64 {
    if width >= 8 {
        return v as i64;
    }
    let shift = 64 - width * 8;
    ((v << shift) as i64) >> shift
}

fn match_numeric(n: &NumericTest, buf: &[u8], off: usize) -> Option<MatchOutcome> {
    let raw = read_uint(buf, off, n.width, n.endian)?;
    let wmask = width_mask(n.width);
    let v = match n.mask {
        Some(m) => raw & m & wmask,
        None => raw,
    };
    let expected = (n.value as u64) & wmask;
    let hit = match n.op {
        NumOp::Any => true,
        NumOp::Eq => v == expected,
        NumOp::Ne => v != expected,
        NumOp::AllSet => v & expected == expected,
        NumOp::AllClear => v & expected == 0,
        NumOp::Lt | NumOp::Gt => {
            let ord = if n.signed {
                sign_extend(v, n.width).cmp(&n.value)
            } else {
                v.cmp(&expected)
            };
            ord == if n.op == NumOp::Lt { Ordering::Less } else { Ordering::Greater }
        }
    };
    if !hit {
        return None;
    }
    let value = match (n.date, n.signed) {
        (true, _) => Value::Date(sign_extend(v, n.width)),
        (false, true) => Value::Signed(sign_extend(v, n.width)),
        (false, false) => Value::Unsigned(v),
    };
    Some(MatchOutcome { offset: off, end: off + n.width, value })
}

/// 读取偏移处的 C 字符串（遇 NUL / 换行截止）
fn read_cstring(buf: &[u8], off: usize) -> Vec<u8> {
    buf[off..]
        .iter()
        .take(MAX_STRING_VALUE)
        .take_while(|&&b| b != 0 && b != b'\n' && b != b'\r')
        .copied()
        .collect()
}

/// 按修饰符比较模式与目标，返回（目标相对模式的大小关系, 目标中消耗的字节数）
fn compare_string(pattern: &[u8], target: &[u8], flags: StringFlags, force_ci: bool) -> (Ordering, usize) {
    let (mut i, mut j) = (0, 0);
    while i < pattern.len() {
        let pc = pattern[i];
        if pc.is_ascii_whitespace() && (flags.optional_ws || flags.compact_ws) {
            let start = j;
            while j < target.len() && target[j].is_ascii_whitespace() {
                j += 1;
            }
            if flags.compact_ws && !flags.optional_ws && j == start {
                let tc = target.get(j).copied();
                return (tc.map_or(Ordering::Less, |t| t.cmp(&pc)), j);
            }
            i += 1;
            continue;
        }
        let Some(&tc) = target.get(j) else {
            return (Ordering::Less, j);
        };
        let fold = force_ci
            || (flags.lower_ci && pc.is_ascii_lowercase())
            || (flags.upper_ci && pc.is_ascii_uppercase());
        let (a, b) = if fold { (tc.to_ascii_lowercase(), pc.to_ascii_lowercase()) } else { (tc, pc) };
        if a != b {
            return (a.cmp(&b), j);
        }
        i += 1;
        j += 1;
    }
    (Ordering::Equal, j)
}

fn compare_op(op: StrOp, ord: Ordering) -> bool {
    match op {
        StrOp::Any => true,
        StrOp::Eq => ord == Ordering::Equal,
        StrOp::Ne => ord != Ordering::Equal,
        StrOp::Lt => ord == Ordering::Less,
        StrOp::Gt => ord == Ordering::Greater,
    }
}

fn string_value(bytes: Vec<u8>, flags: StringFlags) -> Value {
    if flags.trim {
        let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
        let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |p| p + 1);
        return Value::Bytes(bytes[start..end].to_vec());
    }
    Value::Bytes(bytes)
}

fn match_string(s: &StringTest, buf: &[u8], off: usize, force_ci: bool) -> Option<MatchOutcome> {
    if off >= buf.len() {
        return None;
    }
    let target = &buf[off..];
    if s.op == StrOp::Any {
        let v = read_cstring(buf, off);
        let end = off + v.len();
        return Some(MatchOutcome { offset: off, end, value: string_value(v, s.flags) });
    }
    let (ord, consumed) = compare_string(&s.pattern, target, s.flags, force_ci);
    if !compare_op(s.op, ord) {
        return None;
    }
    if s.op == StrOp::Eq {
        let matched = target[..consumed].to_vec();
        return Some(MatchOutcome { offset: off, end: off + consumed, value: string_value(matched, s.flags) });
    }
    let v = read_cstring(buf, off);
    let end = off + v.len();
    Some(MatchOutcome { offset: off, end, value: string_value(v, s.flags) })
}

fn match_pstring(p: &PStringTest, buf: &[u8], off: usize, force_ci: bool) -> Option<MatchOutcome> {
    let len = read_uint(buf, off, p.len_width, p.len_endian)?;
    let len = if p.len_includes_self { len.checked_sub(p.len_width as u64)? } else { len };
    let start = off.checked_add(p.len_width)?;
    let end = start.checked_add(usize::try_from(len).ok()?)?;
    let data = buf.get(start..end)?;
    if p.string.op != StrOp::Any {
        let (ord, consumed) = compare_string(&p.string.pattern, data, p.string.flags, force_ci);
        // 比较需要覆盖完整的字符串内容
        let ord = if ord == Ordering::Equal && consumed < data.len() { Ordering::Greater } else { ord };
        if !compare_op(p.string.op, ord) {
            return None;
        }
    }
    Some(MatchOutcome { offset: off, end, value: string_value(data.to_vec(), p.string.flags) })
}

fn match_search(s: &SearchTest, buf: &[u8], off: usize, force_ci: bool) -> Option<MatchOutcome> {
    if off > buf.len() {
        return None;
    }
    let finder = match (&s.folded, force_ci) {
        (Some(folded), true) => folded,
        _ => &s.finder,
    };
    let limit = off.saturating_add(s.range).saturating_add(s.pattern.len()).min(buf.len());
    let window = &buf[off..limit];
    let found = finder.find(window).filter(|m| m.start() < s.range);
    match (found, s.negate) {
        (Some(m), false) => Some(MatchOutcome {
            offset: off + m.start(),
            end: off + m.end(),
            value: Value::Bytes(window[m.start()..m.end()].to_vec()),
        }),
        (None, true) => Some(MatchOutcome { offset: off, end: off, value: Value::None }),
        _ => None,
    }
}

fn match_regex(r: &RegexTest, buf: &[u8], off: usize, opts: MatchOptions) -> Option<MatchOutcome> {
    if off > buf.len() {
        return None;
    }
    let regex = match (&r.folded, opts.case_insensitive) {
        (Some(folded), true) => folded,
        _ => &r.regex,
    };
    let window_len = r.window.min(opts.regex_window);
    let limit = off.saturating_add(window_len).min(buf.len());
    let window = &buf[off..limit];
    let m = regex.find(window)?;
    let end = if r.start_only { off + m.start() } else { off + m.end() };
    Some(MatchOutcome { offset: off + m.start(), end, value: Value::Bytes(m.as_bytes().to_vec()) })
}
