//! 响应解码
//!
//! 从模型输出中按 `<|N|>` 标记取回译文。解析不一致从不报错：
//! 没有匹配到的批次条目保持未翻译，回到剩余工作集中等待下一轮。

use std::collections::HashMap;

use crate::provider::{FinishReason, ModelResponse};
use crate::tagging::{filter_lines, tag_pattern, TAG_OPEN};

/// 一条解析出的译文
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTranslation {
    pub translated_text: String,
    /// 该源文本在调用方输入中的全部位置
    pub indices: Vec<usize>,
}

/// 取出模型的原始文本
///
/// 因输出令牌上限而结束时，最后一个标记之后的译文可能不完整，
/// 从最后一个 `<|` 处截断丢弃。
pub fn extract_text(response: &ModelResponse) -> String {
    let text = response.text();
    if response.finish_reason() == FinishReason::MaxTokens {
        if let Some(pos) = text.rfind(TAG_OPEN) {
            tracing::debug!("输出被截断，丢弃最后一个不完整的译文");
            return text[..pos].to_string();
        }
    }
    text.to_string()
}

/// 解析带标记的译文
///
/// * `batch_texts` - 本批次发送的文本（与渲染时相同的顺序，空行会被同样过滤）
/// * `positions` - 源文本到其在原始输入中所有下标的映射
///
/// 超出范围的编号和空白译文被忽略。
pub fn parse_translations(
    text: &str,
    batch_texts: &[String],
    positions: &HashMap<String, Vec<usize>>,
) -> HashMap<String, ParsedTranslation> {
    let filtered = filter_lines(batch_texts);
    let tags: Vec<(usize, usize, &str)> = tag_pattern()
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let number = caps.get(1)?.as_str();
            Some((whole.start(), whole.end(), number))
        })
        .collect();

    let mut parsed = HashMap::new();
    for (i, &(_, content_start, number)) in tags.iter().enumerate() {
        let content_end = tags.get(i + 1).map(|&(start, _, _)| start).unwrap_or(text.len());
        let content = text[content_start..content_end].trim();
        if content.is_empty() {
            continue;
        }

        let Ok(n) = number.parse::<usize>() else {
            continue;
        };
        if n == 0 || n > filtered.len() {
            tracing::debug!("忽略超出范围的标记 <|{}|>", n);
            continue;
        }

        let source = filtered[n - 1].0;
        parsed.entry(source.to_string()).or_insert_with(|| ParsedTranslation {
            translated_text: content.to_string(),
            indices: positions.get(source).cloned().unwrap_or_default(),
        });
    }

    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_extract_truncates_incomplete_tail() {
        let response = ModelResponse::from_text("<|1|>하나\n<|2|>둘\n<|3|>세", FinishReason::MaxTokens);
        assert_eq!(extract_text(&response), "<|1|>하나\n<|2|>둘\n");

        let complete = ModelResponse::from_text("<|1|>하나\n<|2|>둘", FinishReason::Stop);
        assert_eq!(extract_text(&complete), "<|1|>하나\n<|2|>둘");
    }

    #[test]
    fn test_parse_collects_all_indices() {
        let texts = batch(&["Hello", "Bye"]);
        let mut positions = HashMap::new();
        positions.insert("Hello".to_string(), vec![0, 2]);
        positions.insert("Bye".to_string(), vec![1]);

        let parsed = parse_translations("<|1|>안녕하세요\n<|2|>잘 가", &texts, &positions);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["Hello"].translated_text, "안녕하세요");
        assert_eq!(parsed["Hello"].indices, vec![0, 2]);
        assert_eq!(parsed["Bye"].translated_text, "잘 가");
    }

    #[test]
    fn test_parse_ignores_out_of_range_and_blank() {
        let texts = batch(&["one", "two", "three"]);
        let parsed = parse_translations(
            "<|0|>zero\n<|1|>   \n<|2|>둘\n<|9|>nine",
            &texts,
            &HashMap::new(),
        );
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed["two"].translated_text, "둘");
        assert!(parsed["two"].indices.is_empty());
    }

    #[test]
    fn test_numbering_follows_filtered_list() {
        let texts = batch(&["", "  first  ", "second"]);
        let parsed = parse_translations("<|1|>첫째<|2|>둘째", &texts, &HashMap::new());
        assert_eq!(parsed["  first  "].translated_text, "첫째");
        assert_eq!(parsed["second"].translated_text, "둘째");
    }

    #[test]
    fn test_partial_response_leaves_rest_unmatched() {
        let texts = batch(&["a", "b", "c", "d"]);
        let parsed = parse_translations("Sure! Here you go:\n<|2|>B\n<|4|>D", &texts, &HashMap::new());
        assert_eq!(parsed.len(), 2);
        assert!(parsed.contains_key("b"));
        assert!(parsed.contains_key("d"));
    }
}
