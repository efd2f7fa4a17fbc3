//! 公共类型（对外暴露）
use serde::Serialize;

use crate::options::OutputMode;

/// 扩展名未知时的占位
pub const UNKNOWN_EXTENSION: &str = "???";

/// 一次识别的完整结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identification {
    /// 人类可读描述
    pub description: String,
    /// MIME 类型
    pub mime_type: String,
    /// MIME 编码（charset）
    pub mime_encoding: String,
    /// 常见扩展名（`/` 分隔）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<String>,
}

impl Identification {
    /// 按输出模式渲染
    pub fn render(&self, mode: OutputMode) -> String {
        match mode {
            OutputMode::Description => self.description.clone(),
            OutputMode::MimeType => self.mime_type.clone(),
            OutputMode::MimeEncoding => self.mime_encoding.clone(),
            OutputMode::Mime => format!("{}; charset={}", self.mime_type, self.mime_encoding),
            OutputMode::Extension => self.extensions.clone().unwrap_or_else(|| UNKNOWN_EXTENSION.to_string()),
        }
    }
}

/// 输出项结构（对应扫描结果 JSON 数组的单个元素）
#[derive(Debug, Clone, Serialize)]
pub struct OutputItem<'a> {
    pub path: &'a str,
    #[serde(flatten)]
    pub result: &'a Identification,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png() -> Identification {
        Identification {
            description: "PNG image data".to_string(),
            mime_type: "image/png".to_string(),
            mime_encoding: "binary".to_string(),
            extensions: Some("png".to_string()),
        }
    }

    #[test]
    fn test_render_modes() {
        let id = png();
        assert_eq!(id.render(OutputMode::Description), "PNG image data");
        assert_eq!(id.render(OutputMode::MimeType), "image/png");
        assert_eq!(id.render(OutputMode::MimeEncoding), "binary");
        assert_eq!(id.render(OutputMode::Mime), "image/png; charset=binary");
        assert_eq!(id.render(OutputMode::Extension), "png");
        let unknown = Identification { extensions: None, ..png() };
        assert_eq!(unknown.render(OutputMode::Extension), "???");
    }

    #[test]
    fn test_output_item_json() {
        let id = png();
        let item = OutputItem { path: "a.png", result: &id };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["path"], "a.png");
        assert_eq!(json["mime_type"], "image/png");
        assert_eq!(json["extensions"], "png");
    }
}
