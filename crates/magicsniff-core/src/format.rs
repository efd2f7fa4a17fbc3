//! 结果格式化：描述模板渲染与片段拼接
use std::iter::Peekable;
use std::str::Chars;

use chrono::DateTime;

use crate::encoding::Classification;
use crate::evaluator::{Resolution, Verdict};
use crate::matcher::Value;
use crate::types::Identification;

/// 规则命中但未给出 MIME 时的默认值
const DEFAULT_MIME: &str = "application/octet-stream";
/// `keep_going` 多条结果之间的分隔
const RESULT_SEPARATOR: &str = "\n- ";

/// 片段前缀 `\b`：与前一片段直接相连，不插入空格
const NO_SPACE_LITERAL: &str = "\\b";
const NO_SPACE_CHAR: char = '\u{8}';

/// 描述累加器
#[derive(Debug, Default, Clone)]
pub(crate) struct Description {
    text: String,
}

impl Description {
    /// 追加一个已渲染片段
    pub(crate) fn push(&mut self, fragment: &str) {
        let (glued, body) = match fragment.strip_prefix(NO_SPACE_LITERAL) {
            Some(rest) => (true, rest),
            None => match fragment.strip_prefix(NO_SPACE_CHAR) {
                Some(rest) => (true, rest),
                None => (false, fragment),
            },
        };
        if body.is_empty() {
            return;
        }
        if !glued && !self.text.is_empty() {
            self.text.push(' ');
        }
        self.text.push_str(body);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub(crate) fn into_string(self) -> String {
        self.text
    }
}

/// 宽度与精度上限，超出时按原样输出格式说明
const MAX_FIELD: usize = 1024;

/// printf 风格的单参数格式说明
#[derive(Debug, Default)]
struct Spec {
    left: bool,
    zero: bool,
    plus: bool,
    space: bool,
    alt: bool,
    width: usize,
    precision: Option<usize>,
}

/// 用匹配值渲染描述模板（`%s %d %i %u %x %X %o %c %%`）
pub(crate) fn render_template(template: &str, value: &Value) -> String {
    if !template.contains('%') {
        return template.to_string();
    }
    let mut out = String::with_capacity(template.len() + 16);
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }
        let mut spec = Spec::default();
        let mut raw = String::from("%");
        while let Some(&f) = chars.peek() {
            match f {
                '-' => spec.left = true,
                '0' => spec.zero = true,
                '+' => spec.plus = true,
                ' ' => spec.space = true,
                '#' => spec.alt = true,
                _ => break,
            }
            raw.push(f);
            chars.next();
        }
        let width = read_field(&mut chars, &mut raw);
        let mut in_range = width.is_some();
        spec.width = width.unwrap_or_default();
        if chars.peek() == Some(&'.') {
            raw.push('.');
            chars.next();
            let precision = read_field(&mut chars, &mut raw);
            in_range &= precision.is_some();
            spec.precision = Some(precision.unwrap_or_default());
        }
        // 长度修饰符对输出无影响，直接跳过
        while let Some(&l) = chars.peek() {
            if matches!(l, 'h' | 'l' | 'q' | 'j' | 'z' | 't') {
                raw.push(l);
                chars.next();
            } else {
                break;
            }
        }
        match chars.next() {
            Some(conv) if !in_range => {
                out.push_str(&raw);
                out.push(conv);
            }
            Some(conv) => match format_one(conv, &spec, value) {
                Some(s) => out.push_str(&s),
                None => {
                    out.push_str(&raw);
                    out.push(conv);
                }
            },
            None => out.push_str(&raw),
        }
    }
    out
}

fn as_signed(value: &Value) -> Option<i64> {
    match value {
        Value::Signed(v) | Value::Date(v) => Some(*v),
        Value::Unsigned(v) => Some(*v as i64),
        Value::Bytes(b) => b.first().map(|&c| c as i64),
        Value::None => None,
    }
}

fn as_unsigned(value: &Value) -> Option<u64> {
    match value {
        Value::Unsigned(v) => Some(*v),
        other => as_signed(other).map(|v| v as u64),
    }
}

fn format_one(conv: char, spec: &Spec, value: &Value) -> Option<String> {
    let (body, numeric) = match conv {
        'd' | 'i' => {
            let v = as_signed(value)?;
            let sign = if v < 0 {
                "-"
            } else if spec.plus {
                "+"
            } else if spec.space {
                " "
            } else {
                ""
            };
            (format!("{sign}{}", v.unsigned_abs()), true)
        }
        'u' => (as_unsigned(value)?.to_string(), true),
        'x' => {
            let v = as_unsigned(value)?;
            (if spec.alt && v != 0 { format!("{v:#x}") } else { format!("{v:x}") }, true)
        }
        'X' => {
            let v = as_unsigned(value)?;
            (if spec.alt && v != 0 { format!("0X{v:X}") } else { format!("{v:X}") }, true)
        }
        'o' => {
            let v = as_unsigned(value)?;
            (if spec.alt && v != 0 { format!("0{v:o}") } else { format!("{v:o}") }, true)
        }
        'c' => {
            let v = as_unsigned(value)?;
            (char::from((v & 0xff) as u8).to_string(), false)
        }
        's' => {
            let s = match value {
                Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
                Value::Date(secs) => format_date(*secs),
                Value::Signed(v) => v.to_string(),
                Value::Unsigned(v) => v.to_string(),
                Value::None => String::new(),
            };
            let s = match spec.precision {
                Some(p) => s.chars().take(p).collect(),
                None => s,
            };
            (s, false)
        }
        _ => return None,
    };
    Some(pad(body, spec, numeric))
}

/// 读取一段十进制数字（宽度或精度）；超过 `MAX_FIELD` 时返回 `None`，数字仍被消费
fn read_field(chars: &mut Peekable<Chars<'_>>, raw: &mut String) -> Option<usize> {
    let mut n = Some(0usize);
    while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
        n = n.and_then(|n| n.checked_mul(10)).and_then(|n| n.checked_add(d as usize)).filter(|&n| n <= MAX_FIELD);
        raw.push(chars.next().unwrap_or_default());
    }
    n
}

fn pad(body: String, spec: &Spec, numeric: bool) -> String {
    let len = body.chars().count();
    if len >= spec.width {
        return body;
    }
    let fill = spec.width - len;
    if spec.left {
        return format!("{body}{}", " ".repeat(fill));
    }
    if spec.zero && numeric {
        // 符号 / 0x 前缀之后补零
        let prefix_len = if body.starts_with("0x") || body.starts_with("0X") {
            2
        } else if body.starts_with(['-', '+', ' ']) {
            1
        } else {
            0
        };
        let (prefix, digits) = body.split_at(prefix_len);
        return format!("{prefix}{}{digits}", "0".repeat(fill));
    }
    format!("{}{body}", " ".repeat(fill))
}

/// 秒级时间戳渲染为 UTC 时间
pub(crate) fn format_date(secs: i64) -> String {
    match DateTime::from_timestamp(secs, 0) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "*invalid date*".to_string(),
    }
}

/// 将求值结论与编码探测结果合并为最终识别结果
///
/// 文本规则命中且内容确为文本时，描述追加 `, <编码> text`；以 `#!` 开头再追加 ` executable`。
pub(crate) fn assemble(verdict: Verdict, class: &Classification, buf: &[u8]) -> Identification {
    let list = match verdict {
        Verdict::Resolved(list) => list,
        Verdict::Unclassified => {
            return Identification {
                description: class.description(),
                mime_type: class.mime_type().to_string(),
                mime_encoding: class.mime_encoding().to_string(),
                extensions: None,
            };
        }
    };
    let descriptions: Vec<String> = list.iter().map(|r| with_text_suffix(r, class, buf)).collect();
    let head = list.into_iter().next();
    let (mime, ext) = match head {
        Some(Resolution { mime, ext, .. }) => (mime, ext),
        None => (None, None),
    };
    Identification {
        description: descriptions.join(RESULT_SEPARATOR),
        mime_type: mime.unwrap_or_else(|| DEFAULT_MIME.to_string()),
        mime_encoding: class.mime_encoding().to_string(),
        extensions: ext,
    }
}

fn with_text_suffix(res: &Resolution, class: &Classification, buf: &[u8]) -> String {
    let Classification::Text { encoding, traits } = class else {
        return res.description.clone();
    };
    if !res.text_rule {
        return res.description.clone();
    }
    let mut out = format!("{}, {} text", res.description, encoding.label());
    if buf.starts_with(b"#!") {
        out.push_str(" executable");
    }
    for note in traits.annotations() {
        out.push_str(", ");
        out.push_str(&note);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_with_backspace() {
        let mut d = Description::default();
        d.push("PNG image data");
        d.push("\\b, 16 x");
        d.push("16,");
        d.push("");
        d.push("\u{8}/color RGBA");
        assert_eq!(d.into_string(), "PNG image data, 16 x 16,/color RGBA");
    }

    #[test]
    fn test_integer_conversions() {
        let v = Value::Signed(255);
        assert_eq!(render_template("%d x", &v), "255 x");
        assert_eq!(render_template("%x", &v), "ff");
        assert_eq!(render_template("%#x", &v), "0xff");
        assert_eq!(render_template("%#06x", &v), "0x00ff");
        assert_eq!(render_template("%5d|", &v), "  255|");
        assert_eq!(render_template("%-5d|", &v), "255  |");
        assert_eq!(render_template("%ld", &v), "255");
        assert_eq!(render_template("%o", &Value::Unsigned(8)), "10");
        assert_eq!(render_template("%05d", &Value::Signed(-42)), "-0042");
        assert_eq!(render_template("version %c", &Value::Signed(b'7' as i64)), "version 7");
    }

    #[test]
    fn test_string_conversions() {
        let v = Value::Bytes(b"hello world".to_vec());
        assert_eq!(render_template("was \"%s\"", &v), "was \"hello world\"");
        assert_eq!(render_template("%.5s", &v), "hello");
        assert_eq!(render_template("100%%", &v), "100%");
        assert_eq!(render_template("%q?", &v), "%q?");
    }

    #[test]
    fn test_date_conversion() {
        let v = Value::Date(86400);
        assert_eq!(render_template("modified %s", &v), "modified 1970-01-02 00:00:00");
    }

    fn resolution(desc: &str, mime: Option<&str>, text_rule: bool) -> Resolution {
        Resolution { description: desc.to_string(), mime: mime.map(str::to_string), ext: None, text_rule }
    }

    #[test]
    fn test_assemble_text_rule_suffix() {
        let buf = b"#!/bin/sh\necho hi\n";
        let class = crate::encoding::classify(buf, crate::options::FallbackEncoding::Latin1);
        let verdict = Verdict::Resolved(vec![resolution("POSIX shell script", Some("text/x-shellscript"), true)]);
        let id = assemble(verdict, &class, buf);
        assert_eq!(id.description, "POSIX shell script, ASCII text executable");
        assert_eq!(id.mime_type, "text/x-shellscript");
        assert_eq!(id.mime_encoding, "us-ascii");
    }

    #[test]
    fn test_assemble_defaults_and_fallback() {
        let buf = b"\x89PNG\0\0";
        let class = crate::encoding::classify(buf, crate::options::FallbackEncoding::Latin1);
        let id = assemble(Verdict::Resolved(vec![resolution("image", None, false)]), &class, buf);
        assert_eq!(id.mime_type, "application/octet-stream");
        assert_eq!(id.mime_encoding, "binary");

        let id = assemble(Verdict::Unclassified, &class, buf);
        assert_eq!(id.description, "data");
        assert_eq!(id.extensions, None);
    }

    #[test]
    fn test_assemble_keep_going_joins() {
        let buf = b"\0\0";
        let class = crate::encoding::classify(buf, crate::options::FallbackEncoding::Latin1);
        let verdict = Verdict::Resolved(vec![resolution("one", Some("a/b"), false), resolution("two", None, false)]);
        let id = assemble(verdict, &class, buf);
        assert_eq!(id.description, "one\n- two");
        assert_eq!(id.mime_type, "a/b");
    }

    #[test]
    fn test_oversized_field_keeps_spec() {
        let v = Value::Signed(7);
        assert_eq!(render_template("v%99999999999999999999999d", &v), "v%99999999999999999999999d");
        assert_eq!(render_template("%999999999999d", &v), "%999999999999d");
        assert_eq!(render_template("%.99999999999999999999s|", &Value::Bytes(b"ab".to_vec())), "%.99999999999999999999s|");
        assert_eq!(render_template("%1025d", &v), "%1025d");
        assert_eq!(render_template("%1024d", &v).len(), 1024);
        assert_eq!(render_template("%03d after %99999999999x", &v), "007 after %99999999999x");
    }

    #[test]
    fn test_missing_value_keeps_spec() {
        assert_eq!(render_template("%d", &Value::None), "%d");
        assert_eq!(render_template("[%s]", &Value::None), "[]");
    }
}
