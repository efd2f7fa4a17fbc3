//! 编码探测：区分二进制与文本，并对文本猜测字符编码
//!
//! 探测顺序：空缓冲区 → BOM（UTF-32 / UTF-8 / UTF-16）→ NUL 与控制字符密度
//! → ASCII → UTF-8 → ISO-8859 回退 → 扩展 ASCII。永不失败。
use crate::options::FallbackEncoding;

/// 控制字符占比超过该值即视为二进制
const MAX_CONTROL_RATIO: f32 = 0.01;
/// 超过该长度的行记为 “very long lines”
const LONG_LINE: usize = 300;

const ESC: u32 = 0x1b;

/// 文本编码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Ascii,
    Utf8,
    Utf8Bom,
    Utf16Le,
    Utf16Be,
    Utf32Le,
    Utf32Be,
    Latin1,
    Unknown8bit,
}

impl TextEncoding {
    /// MIME charset 名称
    pub fn mime_label(self) -> &'static str {
        match self {
            TextEncoding::Ascii => "us-ascii",
            TextEncoding::Utf8 | TextEncoding::Utf8Bom => "utf-8",
            TextEncoding::Utf16Le => "utf-16le",
            TextEncoding::Utf16Be => "utf-16be",
            TextEncoding::Utf32Le => "utf-32le",
            TextEncoding::Utf32Be => "utf-32be",
            TextEncoding::Latin1 => "iso-8859-1",
            TextEncoding::Unknown8bit => "unknown-8bit",
        }
    }

    /// 人类可读名称（描述中使用）
    pub fn label(self) -> &'static str {
        match self {
            TextEncoding::Ascii => "ASCII",
            TextEncoding::Utf8 => "UTF-8 Unicode",
            TextEncoding::Utf8Bom => "UTF-8 Unicode (with BOM)",
            TextEncoding::Utf16Le => "Little-endian UTF-16 Unicode",
            TextEncoding::Utf16Be => "Big-endian UTF-16 Unicode",
            TextEncoding::Utf32Le => "Little-endian UTF-32 Unicode",
            TextEncoding::Utf32Be => "Big-endian UTF-32 Unicode",
            TextEncoding::Latin1 => "ISO-8859",
            TextEncoding::Unknown8bit => "Non-ISO extended-ASCII",
        }
    }
}

/// 文本附加特征
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TextTraits {
    pub crlf: usize,
    pub cr: usize,
    pub lf: usize,
    pub long_lines: bool,
    pub escapes: bool,
}

impl TextTraits {
    fn from_units(units: impl Iterator<Item = u32>) -> Self {
        let mut t = TextTraits::default();
        let mut line_len = 0usize;
        let mut prev_cr = false;
        for u in units {
            match u {
                0x0d => {
                    if prev_cr {
                        t.cr += 1;
                    }
                    prev_cr = true;
                    line_len = 0;
                    continue;
                }
                0x0a => {
                    if prev_cr {
                        t.crlf += 1;
                    } else {
                        t.lf += 1;
                    }
                    line_len = 0;
                }
                _ => {
                    if prev_cr {
                        t.cr += 1;
                    }
                    if u == ESC {
                        t.escapes = true;
                    }
                    line_len += 1;
                    if line_len > LONG_LINE {
                        t.long_lines = true;
                    }
                }
            }
            prev_cr = false;
        }
        if prev_cr {
            t.cr += 1;
        }
        t
    }

    /// 附加说明，例如 `with CRLF line terminators`
    pub fn annotations(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.long_lines {
            out.push("with very long lines".to_string());
        }
        let kinds: Vec<&str> = [("CRLF", self.crlf), ("CR", self.cr), ("LF", self.lf)]
            .iter()
            .filter(|(_, n)| *n > 0)
            .map(|(k, _)| *k)
            .collect();
        match kinds.as_slice() {
            [] => out.push("with no line terminators".to_string()),
            ["LF"] => {}
            ks => out.push(format!("with {} line terminators", ks.join(", "))),
        }
        if self.escapes {
            out.push("with escape sequences".to_string());
        }
        out
    }
}

/// 分类结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Empty,
    Binary { len: usize },
    Text { encoding: TextEncoding, traits: TextTraits },
}

impl Classification {
    pub fn is_text(&self) -> bool {
        matches!(self, Classification::Text { .. })
    }

    /// 无规则命中时的回退描述
    pub fn description(&self) -> String {
        match self {
            Classification::Empty => "empty".to_string(),
            Classification::Binary { len: 1 } => "very short file (no magic)".to_string(),
            Classification::Binary { .. } => "data".to_string(),
            Classification::Text { encoding, traits } => {
                let mut parts = vec![format!("{} text", encoding.label())];
                parts.extend(traits.annotations());
                parts.join(", ")
            }
        }
    }

    /// 无规则命中时的回退 MIME 类型
    pub fn mime_type(&self) -> &'static str {
        match self {
            Classification::Empty => "application/x-empty",
            Classification::Binary { .. } => "application/octet-stream",
            Classification::Text { .. } => "text/plain",
        }
    }

    pub fn mime_encoding(&self) -> &'static str {
        match self {
            Classification::Empty | Classification::Binary { .. } => "binary",
            Classification::Text { encoding, .. } => encoding.mime_label(),
        }
    }
}

/// 允许出现在文本中的控制字符：BEL BS HT LF VT FF CR ESC
fn is_text_control(u: u32) -> bool {
    matches!(u, 0x07..=0x0d | 0x1b)
}

fn is_text_unit(u: u32) -> bool {
    is_text_control(u) || (0x20..0x7f).contains(&u) || u >= 0xa0
}

fn text_from_chars(chars: &[u32], encoding: TextEncoding) -> Option<Classification> {
    if chars.iter().all(|&u| is_text_unit(u)) {
        let traits = TextTraits::from_units(chars.iter().copied());
        Some(Classification::Text { encoding, traits })
    } else {
        None
    }
}

fn classify_bom(buf: &[u8]) -> Option<Classification> {
    if let Some(rest) = buf.strip_prefix(&[0xff, 0xfe, 0x00, 0x00]) {
        let chars: Vec<u32> = rest.chunks_exact(4).map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect();
        return text_from_chars(&chars, TextEncoding::Utf32Le);
    }
    if let Some(rest) = buf.strip_prefix(&[0x00, 0x00, 0xfe, 0xff]) {
        let chars: Vec<u32> = rest.chunks_exact(4).map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]])).collect();
        return text_from_chars(&chars, TextEncoding::Utf32Be);
    }
    if let Some(rest) = buf.strip_prefix(&[0xef, 0xbb, 0xbf]) {
        let txt = valid_utf8_prefix(rest)?;
        let chars: Vec<u32> = txt.chars().map(|c| c as u32).collect();
        return text_from_chars(&chars, TextEncoding::Utf8Bom);
    }
    let (rest, encoding, le) = if let Some(rest) = buf.strip_prefix(&[0xff, 0xfe]) {
        (rest, TextEncoding::Utf16Le, true)
    } else if let Some(rest) = buf.strip_prefix(&[0xfe, 0xff]) {
        (rest, TextEncoding::Utf16Be, false)
    } else {
        return None;
    };
    let units = rest
        .chunks_exact(2)
        .map(|c| if le { u16::from_le_bytes([c[0], c[1]]) } else { u16::from_be_bytes([c[0], c[1]]) });
    let mut chars = Vec::new();
    for decoded in char::decode_utf16(units) {
        chars.push(decoded.ok()? as u32);
    }
    text_from_chars(&chars, encoding)
}

/// 整体为合法 UTF-8（允许末尾被截断的不完整字符）时返回文本
fn valid_utf8_prefix(buf: &[u8]) -> Option<&str> {
    match std::str::from_utf8(buf) {
        Ok(s) => Some(s),
        Err(e) if e.error_len().is_none() => std::str::from_utf8(&buf[..e.valid_up_to()]).ok(),
        Err(_) => None,
    }
}

/// 对缓冲区分类
pub fn classify(buf: &[u8], fallback: FallbackEncoding) -> Classification {
    if buf.is_empty() {
        return Classification::Empty;
    }
    if let Some(c) = classify_bom(buf) {
        return c;
    }
    let binary = Classification::Binary { len: buf.len() };
    if buf.contains(&0) {
        return binary;
    }
    let stray = buf.iter().filter(|&&b| (b < 0x20 && !is_text_control(b as u32)) || b == 0x7f).count();
    if stray as f32 / buf.len() as f32 > MAX_CONTROL_RATIO {
        return binary;
    }
    let units = || buf.iter().map(|&b| b as u32);
    if buf.is_ascii() {
        return Classification::Text { encoding: TextEncoding::Ascii, traits: TextTraits::from_units(units()) };
    }
    if let Some(txt) = valid_utf8_prefix(buf) {
        let traits = TextTraits::from_units(txt.chars().map(|c| c as u32));
        return Classification::Text { encoding: TextEncoding::Utf8, traits };
    }
    let latin1 = fallback == FallbackEncoding::Latin1 && buf.iter().all(|&b| b < 0x80 || b >= 0xa0);
    let encoding = if latin1 { TextEncoding::Latin1 } else { TextEncoding::Unknown8bit };
    Classification::Text { encoding, traits: TextTraits::from_units(units()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(buf: &[u8]) -> Classification {
        classify(buf, FallbackEncoding::Latin1)
    }

    #[test]
    fn test_empty_and_binary() {
        assert_eq!(class(b""), Classification::Empty);
        assert_eq!(class(b"ab\0cd").description(), "data");
        assert_eq!(class(&[0x01]).description(), "very short file (no magic)");
        assert_eq!(class(b"\x01\x02\x03abc").mime_encoding(), "binary");
    }

    #[test]
    fn test_ascii_text() {
        let c = class(b"hello world\n");
        assert_eq!(c.description(), "ASCII text");
        assert_eq!(c.mime_type(), "text/plain");
        assert_eq!(c.mime_encoding(), "us-ascii");
    }

    #[test]
    fn test_line_terminators() {
        assert_eq!(class(b"a\r\nb\r\n").description(), "ASCII text, with CRLF line terminators");
        assert_eq!(class(b"a\rb\r").description(), "ASCII text, with CR line terminators");
        assert_eq!(class(b"a\r\nb\n").description(), "ASCII text, with CRLF, LF line terminators");
        assert_eq!(class(b"no newline").description(), "ASCII text, with no line terminators");
        assert_eq!(class(b"\x1b[1mbold\x1b[0m\n").description(), "ASCII text, with escape sequences");
        let long = vec![b'a'; 400];
        assert_eq!(class(&long).description(), "ASCII text, with very long lines, with no line terminators");
    }

    #[test]
    fn test_utf8_and_bom() {
        let c = class("héllo\n".as_bytes());
        assert_eq!(c.description(), "UTF-8 Unicode text");
        assert_eq!(c.mime_encoding(), "utf-8");
        let bom = class(b"\xef\xbb\xbfhi\n");
        assert_eq!(bom.description(), "UTF-8 Unicode (with BOM) text");
        // 截断在多字节字符中间仍视为 UTF-8
        let cut = &"日本語\n".as_bytes()[..5];
        assert_eq!(class(cut).mime_encoding(), "utf-8");
    }

    #[test]
    fn test_utf16_and_utf32_bom() {
        let le: Vec<u8> = [0xff, 0xfe].into_iter().chain("hi\n".encode_utf16().flat_map(|u| u.to_le_bytes())).collect();
        assert_eq!(class(&le).mime_encoding(), "utf-16le");
        let be: Vec<u8> = [0xfe, 0xff].into_iter().chain("hi\n".encode_utf16().flat_map(|u| u.to_be_bytes())).collect();
        assert_eq!(class(&be).description(), "Big-endian UTF-16 Unicode text");
        let mut le32 = vec![0xff, 0xfe, 0x00, 0x00];
        for c in "ok\n".chars() {
            le32.extend_from_slice(&(c as u32).to_le_bytes());
        }
        assert_eq!(class(&le32).mime_encoding(), "utf-32le");
    }

    #[test]
    fn test_latin1_fallback() {
        let c = class(b"caf\xe9\n");
        assert_eq!(c.mime_encoding(), "iso-8859-1");
        assert_eq!(c.description(), "ISO-8859 text");
        assert_eq!(classify(b"caf\xe9\n", FallbackEncoding::Unknown8bit).mime_encoding(), "unknown-8bit");
        assert_eq!(class(b"x\x85y\n").mime_encoding(), "unknown-8bit");
    }

    #[test]
    fn test_control_density() {
        let mut mostly_text = vec![b'a'; 1000];
        mostly_text[10] = 0x01;
        assert!(class(&mostly_text).is_text());
        let noisy: Vec<u8> = (0..100).map(|i| if i % 10 == 0 { 0x02 } else { b'a' }).collect();
        assert!(!class(&noisy).is_text());
    }
}
