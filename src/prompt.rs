//! 提示词编解码
//!
//! 模板由 `role_start:<role>` … `role_end` 分段，渲染时做字面量替换，
//! 然后解析成系统指令加上按顺序交替的对话轮次。

use serde::{Deserialize, Serialize};

use crate::error::{Result, TranslationError};
use crate::types::ExamplePair;

pub const ROLE_START: &str = "role_start:";
pub const ROLE_END: &str = "role_end";

pub const SOURCE_LANGUAGE_PLACEHOLDER: &str = "{{source_language}}";
pub const TARGET_LANGUAGE_PLACEHOLDER: &str = "{{target_language}}";
pub const EXAMPLE_SOURCE_PLACEHOLDER: &str = "{{example_source}}";
pub const EXAMPLE_RESULT_PLACEHOLDER: &str = "{{example_result}}";
pub const CONTENT_PLACEHOLDER: &str = "{{content}}";

/// 内置模板
///
/// 指令放在第一个用户轮次里，系统位留给扩展推理块。
pub const DEFAULT_TEMPLATE: &str = "role_start:user
You are a professional translator. Translate every tagged line below from {{source_language}} into {{target_language}}.
Keep the <|N|> tag in front of each translated line, translate each line separately, and output only the tagged translations.

{{example_source}}
role_end
role_start:assistant
{{example_result}}
role_end
role_start:user
{{content}}
role_end
";

/// 扩展推理模式的系统指令
///
/// 模板没有 system 块时作为新的 system 块插在最前面，
/// 否则并入模板最后一个 system 块的开头。
pub const THINKING_INSTRUCTIONS: &str = "Before translating, think through each line: its context among the neighbouring lines, tone, terminology and any placeholders or markup that must be preserved.
Only after thinking, write the final answer as tagged translations in the form <|N|>translation, one per line, covering every input tag.";

/// 对话角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// 一个对话轮次
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

/// 解析后的对话
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversation {
    pub system_instruction: Option<String>,
    pub turns: Vec<Turn>,
}

/// 渲染模板所需的内容
#[derive(Debug, Clone)]
pub struct PromptContext<'a> {
    pub source_language: &'a str,
    pub target_language: &'a str,
    pub example: &'a ExamplePair,
    /// 已按标记协议渲染的批次内容
    pub content: &'a str,
}

/// 字面量替换所有占位符
///
/// 语言或批次内容为空是调用错误，直接失败。
pub fn render_prompt(template: &str, ctx: &PromptContext<'_>, use_thinking: bool) -> Result<String> {
    if ctx.content.trim().is_empty() {
        return Err(TranslationError::InvalidInput(
            "prompt content is empty".to_string(),
        ));
    }
    if ctx.source_language.trim().is_empty() || ctx.target_language.trim().is_empty() {
        return Err(TranslationError::InvalidInput(
            "source and target language are required".to_string(),
        ));
    }

    let rendered = substitute(
        template,
        &[
            (SOURCE_LANGUAGE_PLACEHOLDER, ctx.source_language),
            (TARGET_LANGUAGE_PLACEHOLDER, ctx.target_language),
            (EXAMPLE_SOURCE_PLACEHOLDER, ctx.example.source.as_str()),
            (EXAMPLE_RESULT_PLACEHOLDER, ctx.example.result.as_str()),
            (CONTENT_PLACEHOLDER, ctx.content),
        ],
    );

    if !use_thinking {
        return Ok(rendered);
    }
    match last_system_body(&rendered) {
        Some(body) => Ok(format!(
            "{}{}\n\n{}",
            &rendered[..body],
            THINKING_INSTRUCTIONS,
            &rendered[body..]
        )),
        None => Ok(format!(
            "{}system\n{}\n{}\n{}",
            ROLE_START, THINKING_INSTRUCTIONS, ROLE_END, rendered
        )),
    }
}

/// 单遍替换占位符，替换进来的值不会再被展开
fn substitute(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(pos) = rest.find("{{") {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        match values.iter().find(|(placeholder, _)| tail.starts_with(placeholder)) {
            Some((placeholder, value)) => {
                out.push_str(value);
                rest = &tail[placeholder.len()..];
            }
            None => {
                out.push_str("{{");
                rest = &tail[2..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// 最后一个 system 块正文的起始偏移
fn last_system_body(rendered: &str) -> Option<usize> {
    rendered
        .match_indices(ROLE_START)
        .filter_map(|(start, _)| {
            let after = start + ROLE_START.len();
            let newline = rendered[after..].find('\n')?;
            rendered[after..after + newline]
                .trim()
                .eq_ignore_ascii_case("system")
                .then_some(after + newline + 1)
        })
        .last()
}

/// 把渲染后的模板解析为对话
///
/// 多个 system 块时以最后一个为准；相邻的同角色轮次合并为一个，
/// 因为模型接口要求角色交替出现。空块被忽略。
pub fn parse_conversation(rendered: &str) -> Conversation {
    let mut conversation = Conversation::default();
    let mut rest = rendered;

    while let Some(start) = rest.find(ROLE_START) {
        let after_marker = &rest[start + ROLE_START.len()..];
        let (role, body) = match after_marker.find('\n') {
            Some(newline) => (after_marker[..newline].trim(), &after_marker[newline + 1..]),
            None => (after_marker.trim(), ""),
        };
        let (content, next) = match body.find(ROLE_END) {
            Some(end) => (&body[..end], &body[end + ROLE_END.len()..]),
            None => (body, ""),
        };
        rest = next;

        let content = content.trim();
        if content.is_empty() {
            continue;
        }

        let role = match role.to_ascii_lowercase().as_str() {
            "system" => {
                conversation.system_instruction = Some(content.to_string());
                continue;
            }
            "user" => Role::User,
            "assistant" | "model" => Role::Assistant,
            other => {
                tracing::debug!("忽略未知的模板角色: {}", other);
                continue;
            }
        };

        match conversation.turns.last_mut() {
            Some(last) if last.role == role => {
                last.text.push_str("\n\n");
                last.text.push_str(content);
            }
            _ => conversation.turns.push(Turn {
                role,
                text: content.to_string(),
            }),
        }
    }

    conversation
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(example: &'a ExamplePair, content: &'a str) -> PromptContext<'a> {
        PromptContext {
            source_language: "English",
            target_language: "Korean",
            example,
            content,
        }
    }

    #[test]
    fn test_placeholders_replaced_literally() {
        let example = ExamplePair {
            source: "<|1|>Hi".into(),
            result: "<|1|>안녕".into(),
        };
        let template = "role_start:user\n{{source_language}}->{{target_language}}\n{{example_source}}\nrole_end\nrole_start:assistant\n{{example_result}}\nrole_end\nrole_start:user\n{{content}}\nrole_end";
        let rendered = render_prompt(template, &ctx(&example, "<|1|>$1 (a+b)*"), false).unwrap();

        assert!(rendered.contains("English->Korean"));
        assert!(rendered.contains("<|1|>$1 (a+b)*"));
        let conversation = parse_conversation(&rendered);
        assert_eq!(conversation.turns.len(), 3);
        assert_eq!(conversation.turns[1].role, Role::Assistant);
        assert_eq!(conversation.turns[1].text, "<|1|>안녕");
    }

    #[test]
    fn test_missing_content_or_language_is_error() {
        let example = ExamplePair::default();
        assert!(render_prompt(DEFAULT_TEMPLATE, &ctx(&example, "  "), false).is_err());

        let no_language = PromptContext {
            source_language: "",
            ..ctx(&example, "<|1|>Hello")
        };
        assert!(render_prompt(DEFAULT_TEMPLATE, &no_language, false).is_err());
    }

    #[test]
    fn test_default_template_without_examples_merges_user_turns() {
        let example = ExamplePair::default();
        let rendered = render_prompt(DEFAULT_TEMPLATE, &ctx(&example, "<|1|>Hello"), false).unwrap();
        let conversation = parse_conversation(&rendered);

        assert!(conversation.system_instruction.is_none());
        assert_eq!(conversation.turns.len(), 1);
        assert_eq!(conversation.turns[0].role, Role::User);
        assert!(conversation.turns[0].text.ends_with("<|1|>Hello"));
    }

    #[test]
    fn test_thinking_block_becomes_system_instruction() {
        let example = ExamplePair::default();
        let rendered = render_prompt(DEFAULT_TEMPLATE, &ctx(&example, "<|1|>Hello"), true).unwrap();
        assert!(rendered.starts_with("role_start:system"));

        let conversation = parse_conversation(&rendered);
        let system = conversation.system_instruction.unwrap();
        assert!(system.starts_with("Before translating, think"));
    }

    #[test]
    fn test_substituted_values_are_not_expanded_again() {
        let example = ExamplePair {
            source: "<|1|>Type {{content}} here".into(),
            result: "<|1|>{{target_language}} 입력".into(),
        };
        let rendered = render_prompt(DEFAULT_TEMPLATE, &ctx(&example, "<|1|>Bye"), false).unwrap();

        assert!(rendered.contains("<|1|>Type {{content}} here"));
        assert!(rendered.contains("<|1|>{{target_language}} 입력"));
        assert_eq!(rendered.matches("<|1|>Bye").count(), 1);
    }

    #[test]
    fn test_unknown_braces_are_kept() {
        let example = ExamplePair::default();
        let template = "role_start:user\n{{ not a placeholder }} {{content}}\nrole_end";
        let rendered = render_prompt(template, &ctx(&example, "<|1|>x"), false).unwrap();
        assert!(rendered.contains("{{ not a placeholder }} <|1|>x"));
    }

    #[test]
    fn test_thinking_merges_into_template_system_block() {
        let example = ExamplePair::default();
        let template = "role_start:system\nUse formal speech.\nrole_end\nrole_start:user\n{{content}}\nrole_end";
        let rendered = render_prompt(template, &ctx(&example, "<|1|>Hello"), true).unwrap();

        let conversation = parse_conversation(&rendered);
        let system = conversation.system_instruction.unwrap();
        assert!(system.starts_with("Before translating, think"));
        assert!(system.ends_with("Use formal speech."));
        assert_eq!(conversation.turns.len(), 1);
    }

    #[test]
    fn test_last_system_block_wins() {
        let rendered = "role_start:system\nfirst\nrole_end\nrole_start:user\nhi\nrole_end\nrole_start:system\nsecond\nrole_end";
        let conversation = parse_conversation(rendered);
        assert_eq!(conversation.system_instruction.as_deref(), Some("second"));
        assert_eq!(conversation.turns.len(), 1);
    }

    #[test]
    fn test_consecutive_same_role_turns_merge() {
        let rendered = "role_start:user\na\nrole_end\nrole_start:assistant\nb\nrole_end\nrole_start:assistant\nc\nrole_end\nrole_start:user\nd\nrole_end";
        let conversation = parse_conversation(rendered);
        assert_eq!(
            conversation.turns,
            vec![
                Turn { role: Role::User, text: "a".into() },
                Turn { role: Role::Assistant, text: "b\n\nc".into() },
                Turn { role: Role::User, text: "d".into() },
            ]
        );
    }
}
