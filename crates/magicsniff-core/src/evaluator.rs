//! 规则树求值（深度优先）
//!
//! 状态流转：`Start → ScanningTopLevel → {MatchedDescending → ScanningTopLevel | Exhausted}`，
//! 终态为 `Resolved`（得到描述）或 `Unclassified`（交由编码探测回退）。
//!
//! - 顶层条目按文件顺序尝试，第一条产生描述的条目胜出（`keep_going` 时收集全部）
//! - 子规则只在父规则命中后求值，描述追加、mime / ext 覆盖
//! - `use` 调用计入显式深度计数，超过上限返回 `RecursionLimit`
//! - 每下降一层子规则（含 `use`）计入嵌套计数，超过 `MAX_NESTING` 同样返回 `RecursionLimit`
//! - 非法规则记录日志后视为不匹配
use tracing::{debug, trace};

use crate::database::RuleSet;
use crate::error::{MagicError, Result};
use crate::format::{render_template, Description};
use crate::matcher::{match_rule, resolve_offset, Frame, MatchOptions, Value};
use crate::rules::{Rule, RuleKind};

/// 子规则嵌套层数上限（层级与 `use` 合计），与 `max_recursion` 取值无关
pub(crate) const MAX_NESTING: usize = 256;

/// 求值参数
#[derive(Debug, Clone, Copy)]
pub(crate) struct EvalOptions {
    pub matching: MatchOptions,
    pub max_recursion: usize,
    pub keep_going: bool,
}

/// 单个顶层条目的求值结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Resolution {
    pub description: String,
    pub mime: Option<String>,
    pub ext: Option<String>,
    /// 顶层规则为文本规则
    pub text_rule: bool,
}

/// 最终结论
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Verdict {
    Resolved(Vec<Resolution>),
    Unclassified,
}

/// 单次识别的临时状态
struct MatchContext<'a> {
    set: &'a RuleSet,
    buf: &'a [u8],
    opts: EvalOptions,
    description: Description,
    mime: Option<String>,
    ext: Option<String>,
    /// 当前子规则嵌套层数
    nesting: usize,
}

impl<'a> MatchContext<'a> {
    fn new(set: &'a RuleSet, buf: &'a [u8], opts: EvalOptions) -> Self {
        Self { set, buf, opts, description: Description::default(), mime: None, ext: None, nesting: 0 }
    }

    fn emit(&mut self, rule: &Rule, value: &Value) {
        if !rule.desc.is_empty() {
            self.description.push(&render_template(&rule.desc, value));
        }
        if let Some(mime) = &rule.mime {
            self.mime = Some(mime.clone());
        }
        if let Some(ext) = &rule.ext {
            self.ext = Some(ext.clone());
        }
    }

    /// 求值一条规则；`sibling_matched` 表示同级此前已有规则命中
    fn eval_rule(&mut self, idx: usize, frame: Frame, depth: usize, sibling_matched: bool) -> Result<bool> {
        let set = self.set;
        let rule = set.rule(idx);
        match &rule.kind {
            RuleKind::Name(_) | RuleKind::Clear => Ok(false),
            RuleKind::Default => {
                if sibling_matched {
                    return Ok(false);
                }
                let at = resolve_offset(&rule.offset, self.buf, frame).unwrap_or(frame.parent_end);
                self.emit(rule, &Value::None);
                self.eval_children(idx, Frame { base: frame.base, parent_end: at }, depth)?;
                Ok(true)
            }
            RuleKind::Use(name) => self.eval_use(idx, name, frame, depth),
            _ => {
                let outcome = match match_rule(rule, self.buf, frame, self.opts.matching) {
                    Ok(o) => o,
                    Err(e) => {
                        debug!(rule = rule.index, error = %e, "skipping rule");
                        None
                    }
                };
                let Some(hit) = outcome else {
                    return Ok(false);
                };
                self.emit(rule, &hit.value);
                self.eval_children(idx, Frame { base: frame.base, parent_end: hit.end }, depth)?;
                Ok(true)
            }
        }
    }

    /// 调用具名子规则集：其绝对偏移以调用处偏移为基准
    fn eval_use(&mut self, idx: usize, name: &str, frame: Frame, depth: usize) -> Result<bool> {
        let limit = self.opts.max_recursion;
        if depth >= limit {
            return Err(MagicError::RecursionLimit { limit });
        }
        let set = self.set;
        let rule = set.rule(idx);
        let Some(at) = resolve_offset(&rule.offset, self.buf, frame) else {
            return Ok(false);
        };
        let Some(target) = set.named(name) else {
            debug!(rule = rule.index, name, "use of unknown rule set");
            return Ok(false);
        };
        let hit = self.eval_children(target, Frame { base: at, parent_end: at }, depth + 1)?;
        if hit {
            self.emit(rule, &Value::None);
            self.eval_children(idx, Frame { base: frame.base, parent_end: at }, depth)?;
        }
        Ok(hit)
    }

    /// 求值全部直接子规则，返回是否有子规则命中
    fn eval_children(&mut self, parent: usize, frame: Frame, depth: usize) -> Result<bool> {
        if self.nesting >= MAX_NESTING {
            return Err(MagicError::RecursionLimit { limit: MAX_NESTING });
        }
        self.nesting += 1;
        let matched = self.eval_siblings(parent, frame, depth);
        self.nesting -= 1;
        matched
    }

    fn eval_siblings(&mut self, parent: usize, frame: Frame, depth: usize) -> Result<bool> {
        let set = self.set;
        let mut matched = false;
        for &child in set.children(parent) {
            if matches!(set.rule(child).kind, RuleKind::Clear) {
                matched = false;
                continue;
            }
            if self.eval_rule(child, frame, depth, matched)? {
                matched = true;
            }
        }
        Ok(matched)
    }

    fn finish(self, text_rule: bool) -> Option<Resolution> {
        if self.description.is_empty() {
            return None;
        }
        Some(Resolution { description: self.description.into_string(), mime: self.mime, ext: self.ext, text_rule })
    }
}

/// 对缓冲区求值整个规则集
pub(crate) fn evaluate(set: &RuleSet, buf: &[u8], opts: EvalOptions) -> Result<Verdict> {
    let mut resolved = Vec::new();
    for &top in set.top_level() {
        let mut ctx = MatchContext::new(set, buf, opts);
        if !ctx.eval_rule(top, Frame::default(), 0, !resolved.is_empty())? {
            continue;
        }
        let rule = set.rule(top);
        // 命中但未产生任何描述：回到顶层继续扫描
        let Some(res) = ctx.finish(rule.is_text()) else {
            trace!(rule = rule.index, "matched without description, backtracking");
            continue;
        };
        trace!(rule = rule.index, "resolved");
        resolved.push(res);
        if !opts.keep_going {
            break;
        }
    }
    Ok(if resolved.is_empty() { Verdict::Unclassified } else { Verdict::Resolved(resolved) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleEntry;

    const OPTS: EvalOptions = EvalOptions {
        matching: MatchOptions { case_insensitive: false, regex_window: 1 << 16 },
        max_recursion: 20,
        keep_going: false,
    };

    fn eval(src: &str, buf: &[u8]) -> Result<Verdict> {
        let set = RuleSet::from_toml_str(src).unwrap();
        evaluate(&set, buf, OPTS)
    }

    fn first(v: Verdict) -> Resolution {
        match v {
            Verdict::Resolved(mut list) => list.remove(0),
            Verdict::Unclassified => panic!("unclassified"),
        }
    }

    const TIE: &str = r#"
[[rules]]
offset = "0"
type = "string"
test = "AB"
desc = "first"
mime = "application/x-first"

[[rules]]
offset = "0"
type = "byte"
test = "=0x41"
desc = "second"
mime = "application/x-second"
"#;

    #[test]
    fn test_first_declared_rule_wins() {
        let res = first(eval(TIE, b"ABC").unwrap());
        assert_eq!(res.description, "first");
        assert_eq!(res.mime.as_deref(), Some("application/x-first"));
    }

    #[test]
    fn test_keep_going_collects_all() {
        let set = RuleSet::from_toml_str(TIE).unwrap();
        let opts = EvalOptions { keep_going: true, ..OPTS };
        match evaluate(&set, b"ABC", opts).unwrap() {
            Verdict::Resolved(list) => {
                let descs: Vec<&str> = list.iter().map(|r| r.description.as_str()).collect();
                assert_eq!(descs, vec!["first", "second"]);
            }
            Verdict::Unclassified => panic!("unclassified"),
        }
    }

    #[test]
    fn test_mime_from_child_when_top_level_has_none() {
        let src = r#"
[[rules]]
offset = "0"
type = "string"
test = "RIFF"
desc = "RIFF data"

[[rules]]
level = 1
offset = "8"
type = "string"
test = "WAVE"
desc = '\b, WAVE audio'
mime = "audio/x-wav"
"#;
        let res = first(eval(src, b"RIFF\0\0\0\0WAVE").unwrap());
        assert_eq!(res.description, "RIFF data, WAVE audio");
        assert_eq!(res.mime.as_deref(), Some("audio/x-wav"));

        let bare = first(eval(src, b"RIFF\0\0\0\0AVI ").unwrap());
        assert_eq!(bare.description, "RIFF data");
        assert_eq!(bare.mime, None);
    }

    #[test]
    fn test_children_append_and_override() {
        let src = r#"
[[rules]]
offset = "0"
type = "string"
test = 'PK\003\004'
desc = "Zip archive data"
mime = "application/zip"

[[rules]]
level = 1
offset = "4"
type = "byte"
test = "x"
desc = '\b, at least v%d'

[[rules]]
level = 1
offset = "8"
type = "string"
test = "epub"
desc = '\b, EPUB'
mime = "application/epub+zip"
"#;
        let res = first(eval(src, b"PK\x03\x04\x14\0\0\0epub").unwrap());
        assert_eq!(res.description, "Zip archive data, at least v20, EPUB");
        assert_eq!(res.mime.as_deref(), Some("application/epub+zip"));

        let plain = first(eval(src, b"PK\x03\x04\x0a\0\0\0data").unwrap());
        assert_eq!(plain.description, "Zip archive data, at least v10");
        assert_eq!(plain.mime.as_deref(), Some("application/zip"));
    }

    #[test]
    fn test_relative_offsets_follow_parent_end() {
        let src = r#"
[[rules]]
offset = "0"
type = "search/16"
test = "KEY="
desc = "keyfile"

[[rules]]
level = 1
offset = "&0"
type = "string"
test = "x"
desc = "with %s"
"#;
        let res = first(eval(src, b"xxKEY=secret\n").unwrap());
        assert_eq!(res.description, "keyfile with secret");
    }

    #[test]
    fn test_default_and_clear() {
        let src = r#"
[[rules]]
offset = "0"
type = "string"
test = "HDR"
desc = "header"

[[rules]]
level = 1
offset = "3"
type = "byte"
test = "=1"
desc = "v1"

[[rules]]
level = 1
offset = "3"
type = "default"
desc = "unknown version"

[[rules]]
level = 1
offset = "0"
type = "clear"

[[rules]]
level = 1
offset = "3"
type = "default"
desc = "after clear"
"#;
        assert_eq!(first(eval(src, b"HDR\x01").unwrap()).description, "header v1 after clear");
        assert_eq!(first(eval(src, b"HDR\x07").unwrap()).description, "header unknown version after clear");
    }

    #[test]
    fn test_use_rebases_offsets() {
        let src = r#"
[[rules]]
offset = "0"
type = "name"
test = "pair"

[[rules]]
level = 1
offset = "0"
type = "byte"
test = "x"
desc = '\b, a=%d'

[[rules]]
level = 1
offset = "1"
type = "byte"
test = "x"
desc = '\b, b=%d'

[[rules]]
offset = "0"
type = "string"
test = "TWO"
desc = "pairs"

[[rules]]
level = 1
offset = "3"
type = "use"
test = "pair"

[[rules]]
level = 1
offset = "5"
type = "use"
test = "pair"
"#;
        let res = first(eval(src, b"TWO\x01\x02\x03\x04").unwrap());
        assert_eq!(res.description, "pairs, a=1, b=2, a=3, b=4");
    }

    #[test]
    fn test_circular_use_hits_recursion_limit() {
        let src = r#"
[[rules]]
offset = "0"
type = "name"
test = "loop"

[[rules]]
level = 1
offset = "0"
type = "use"
test = "loop"

[[rules]]
offset = "0"
type = "byte"
test = "x"
desc = "start"

[[rules]]
level = 1
offset = "0"
type = "use"
test = "loop"
"#;
        let err = eval(src, b"\x00").unwrap_err();
        assert!(matches!(err, MagicError::RecursionLimit { limit: 20 }));
    }

    /// 生成一条每层都是 `byte x` 的单链规则
    fn chain(levels: u32) -> RuleSet {
        let entries = (0..levels)
            .map(|level| RuleEntry {
                level,
                offset: "0".to_string(),
                kind: "byte".to_string(),
                test: "x".to_string(),
                desc: if level == 0 { "chain".to_string() } else { String::new() },
                mime: None,
                ext: None,
            })
            .collect();
        RuleSet::from_entries(entries).unwrap()
    }

    #[test]
    fn test_deep_level_chain_hits_nesting_limit() {
        let set = chain(5_000);
        let err = evaluate(&set, b"\x01", OPTS).unwrap_err();
        assert!(matches!(err, MagicError::RecursionLimit { limit: MAX_NESTING }));
    }

    #[test]
    fn test_level_chain_within_limit_resolves() {
        let set = chain(MAX_NESTING as u32);
        assert_eq!(first(evaluate(&set, b"\x01", OPTS).unwrap()).description, "chain");
        let over = chain(MAX_NESTING as u32 + 2);
        assert!(evaluate(&over, b"\x01", OPTS).is_err());
    }

    #[test]
    fn test_large_max_recursion_still_bounded() {
        let src = r#"
[[rules]]
offset = "0"
type = "name"
test = "loop"

[[rules]]
level = 1
offset = "0"
type = "use"
test = "loop"

[[rules]]
offset = "0"
type = "byte"
test = "x"
desc = "start"

[[rules]]
level = 1
offset = "0"
type = "use"
test = "loop"
"#;
        let set = RuleSet::from_toml_str(src).unwrap();
        let opts = EvalOptions { max_recursion: 1_000_000, ..OPTS };
        let err = evaluate(&set, b"\x00", opts).unwrap_err();
        assert!(matches!(err, MagicError::RecursionLimit { limit: MAX_NESTING }));
    }

    #[test]
    fn test_invalid_rule_is_skipped() {
        let src = r#"
[[rules]]
offset = "0"
type = "bedouble"
test = "x"
desc = "broken"

[[rules]]
offset = "0"
type = "string"
test = "OK"
desc = "fine"

[[rules]]
level = 1
offset = "0"
type = "nonsense"
desc = "never"
"#;
        assert_eq!(first(eval(src, b"OK").unwrap()).description, "fine");
    }

    #[test]
    fn test_match_without_description_backtracks() {
        let src = r#"
[[rules]]
offset = "0"
type = "string"
test = "MZ"

[[rules]]
level = 1
offset = "60"
type = "string"
test = "PE"
desc = "PE executable"

[[rules]]
offset = "0"
type = "byte"
test = "x"
desc = "fallback rule"
"#;
        assert_eq!(first(eval(src, b"MZ..").unwrap()).description, "fallback rule");
    }

    #[test]
    fn test_no_match_is_unclassified() {
        assert_eq!(eval(TIE, b"zz").unwrap(), Verdict::Unclassified);
        assert_eq!(eval(TIE, b"").unwrap(), Verdict::Unclassified);
    }
}
