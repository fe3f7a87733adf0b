//! 标记协议
//!
//! 批次内容按行编号为 `<|1|>first\n<|2|>second`，模型按同样的编号返回译文。
//! 编号从 1 开始，针对的是去掉空行之后的列表。

use std::sync::OnceLock;

use regex::Regex;

/// 标记的起始序列，截断处理时按它定位最后一个完整标记
pub const TAG_OPEN: &str = "<|";

/// 匹配 `<|N|>` 标记
pub fn tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"<\|(\d+)\|>").expect("static tag pattern"))
}

/// 去掉首尾空白并丢弃空行，保留原始文本以便回写映射
pub fn filter_lines<S: AsRef<str>>(lines: &[S]) -> Vec<(&str, &str)> {
    lines
        .iter()
        .map(|line| (line.as_ref(), line.as_ref().trim()))
        .filter(|(_, trimmed)| !trimmed.is_empty())
        .collect()
}

/// 按标记协议渲染文本列表
pub fn tag_lines<S: AsRef<str>>(lines: &[S]) -> String {
    filter_lines(lines)
        .iter()
        .enumerate()
        .map(|(i, (_, trimmed))| format!("<|{}|>{}", i + 1, trimmed))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagging_skips_blank_lines() {
        let lines = vec!["  first ", "", "   ", "second"];
        assert_eq!(tag_lines(&lines), "<|1|>first\n<|2|>second");
    }

    #[test]
    fn test_filter_keeps_original_text() {
        let lines = vec![" a ".to_string(), "".to_string(), "b".to_string()];
        let filtered = filter_lines(&lines);
        assert_eq!(filtered, vec![(" a ", "a"), ("b", "b")]);
    }

    #[test]
    fn test_tag_pattern_captures_number() {
        let caps = tag_pattern().captures("<|12|>hello").unwrap();
        assert_eq!(&caps[1], "12");
    }
}
