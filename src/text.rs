//! 文本规范化工具
//!
//! 输入文本在进入缓存和模型之前统一规范化，输出前再还原换行转义。

/// 把真实的换行符转义为字面量 `\r` / `\n`，保证每条文本在标记协议里只占一行
///
/// 反斜杠本身转义为 `\\`，因此原文里的字面量 `\n` 可以原样还原。
pub fn escape_line_breaks(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '\r' => escaped.push_str("\\r"),
            '\n' => escaped.push_str("\\n"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// `escape_line_breaks` 的逆操作
///
/// 不认识的转义序列原样保留。
pub fn unescape_line_breaks(text: &str) -> String {
    let mut unescaped = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            unescaped.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => unescaped.push('\\'),
            Some('r') => unescaped.push('\r'),
            Some('n') => unescaped.push('\n'),
            Some(other) => {
                unescaped.push('\\');
                unescaped.push(other);
            }
            None => unescaped.push('\\'),
        }
    }
    unescaped
}

/// 全角字符转半角
///
/// U+FF01..=U+FF5E 映射到对应的 ASCII 字符，全角空格 U+3000 映射为普通空格。
pub fn to_half_width(text: &str) -> String {
    text.chars()
        .map(|ch| match ch {
            '\u{3000}' => ' ',
            '\u{FF01}'..='\u{FF5E}' => char::from_u32(ch as u32 - 0xFEE0).unwrap_or(ch),
            _ => ch,
        })
        .collect()
}

/// 编排器在任何缓存或模型交互之前对输入做的规范化
pub fn canonicalize_input(text: &str) -> String {
    escape_line_breaks(&to_half_width(text))
}

/// 生成缓存键：去掉真实和转义的 CR/LF，再去掉首尾空白
pub fn normalize_cache_key(text: &str) -> String {
    text.replace("\r\n", "")
        .replace(['\r', '\n'], "")
        .replace("\\r\\n", "")
        .replace("\\r", "")
        .replace("\\n", "")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_break_escape_roundtrip() {
        let escaped = escape_line_breaks("first\r\nsecond\nthird");
        assert_eq!(escaped, "first\\r\\nsecond\\nthird");
        assert!(!escaped.contains('\n'));
        assert_eq!(unescape_line_breaks(&escaped), "first\r\nsecond\nthird");
    }

    #[test]
    fn test_literal_backslashes_survive_roundtrip() {
        for original in ["C:\\new\\table", "\\n", "a\\\nb", "trailing\\"] {
            let escaped = escape_line_breaks(original);
            assert!(!escaped.contains('\n'));
            assert_eq!(unescape_line_breaks(&escaped), original);
        }
        assert_eq!(escape_line_breaks("C:\\new"), "C:\\\\new");
        assert_eq!(unescape_line_breaks("50\\% off"), "50\\% off");
    }

    #[test]
    fn test_half_width_conversion() {
        assert_eq!(to_half_width("ＡＢＣ１２３！"), "ABC123!");
        assert_eq!(to_half_width("全角\u{3000}空格"), "全角 空格");
        assert_eq!(to_half_width("日本語"), "日本語");
    }

    #[test]
    fn test_cache_key_strips_line_breaks() {
        assert_eq!(normalize_cache_key("  Hello\r\n"), "Hello");
        assert_eq!(normalize_cache_key("Hello\\nWorld"), "HelloWorld");
        assert_eq!(normalize_cache_key("\\r\\n  "), "");
        assert_eq!(normalize_cache_key("   "), "");
    }
}
