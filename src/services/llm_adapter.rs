//! LLM 条目适配器
//!
//! 把条目字段填入提示词模板，调用 `LlmService`，并把回答转换成 JSON。
//! 提示词的内容由调用方提供，这里只做占位符替换。

use std::sync::OnceLock;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::error::LlmError;
use crate::models::Item;
use crate::services::adapter::ItemAdapter;
use crate::services::llm_service::LlmService;
use crate::utils::logging::truncate_text;

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("占位符正则合法"))
}

fn fenced_block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)```").expect("代码块正则合法"))
}

/// 用条目字段替换模板中的 `{字段名}` 占位符
pub fn render_prompt(template: &str, item: &Item) -> Result<String, LlmError> {
    let mut missing = None;
    let rendered = placeholder_regex().replace_all(template, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match item.field(name) {
            Some(value) => value.to_string(),
            None => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(field) => Err(LlmError::MissingField {
            index: item.index,
            field,
        }),
        None => Ok(rendered.into_owned()),
    }
}

/// 把 LLM 的回答转换为 JSON
///
/// 依次尝试：```json 代码块、整段 JSON、首尾大括号之间的内容；都失败时原样保存为字符串。
pub fn parse_llm_answer(answer: &str) -> Value {
    let answer = answer.trim();

    if let Some(caps) = fenced_block_regex().captures(answer) {
        if let Ok(value) = serde_json::from_str::<Value>(caps[1].trim()) {
            return value;
        }
    }

    if let Ok(value) = serde_json::from_str::<Value>(answer) {
        return value;
    }

    if let (Some(start), Some(end)) = (answer.find('{'), answer.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<Value>(&answer[start..=end]) {
                return value;
            }
        }
    }

    Value::String(answer.to_string())
}

/// 通过 LLM 分析条目的适配器
pub struct LlmAdapter {
    service: LlmService,
    user_template: String,
    system_prompt: Option<String>,
}

impl LlmAdapter {
    pub fn new(service: LlmService, user_template: impl Into<String>) -> Self {
        Self {
            service,
            user_template: user_template.into(),
            system_prompt: None,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }
}

#[async_trait]
impl ItemAdapter for LlmAdapter {
    async fn analyze(&self, item: &Item) -> Result<Value> {
        let prompt = render_prompt(&self.user_template, item)?;
        let answer = self
            .service
            .send_to_llm(&prompt, self.system_prompt.as_deref())
            .await?;
        debug!("{} LLM 回答: {}", item, truncate_text(&answer, 80));
        Ok(parse_llm_answer(&answer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_prompt_fills_fields() {
        let item = Item::from_pairs(3, [("title", "CRISPR"), ("abstract", "Gene editing.")]);
        let prompt = render_prompt("Title: {title}\nAbstract: {abstract}", &item).unwrap();
        assert_eq!(prompt, "Title: CRISPR\nAbstract: Gene editing.");
    }

    #[test]
    fn test_render_prompt_reports_missing_field() {
        let item = Item::from_pairs(3, [("title", "CRISPR")]);
        let err = render_prompt("{title} {keywords}", &item).unwrap_err();
        assert!(matches!(
            err,
            LlmError::MissingField { index: 3, ref field } if field == "keywords"
        ));
    }

    #[test]
    fn test_render_prompt_leaves_json_braces_alone() {
        let item = Item::from_pairs(0, [("title", "T")]);
        let prompt = render_prompt(r#"{title} -> {"score": 1}"#, &item).unwrap();
        assert_eq!(prompt, r#"T -> {"score": 1}"#);
    }

    #[test]
    fn test_parse_fenced_json() {
        let answer = "结果如下：\n```json\n{\"relevance\": 4, \"reason\": \"ok\"}\n```";
        assert_eq!(
            parse_llm_answer(answer),
            json!({"relevance": 4, "reason": "ok"})
        );
    }

    #[test]
    fn test_parse_embedded_object_and_plain_text() {
        assert_eq!(
            parse_llm_answer("Sure! {\"include\": true} Hope this helps."),
            json!({"include": true})
        );
        assert_eq!(parse_llm_answer("  yes  "), json!("yes"));
        assert_eq!(parse_llm_answer("[1, 2]"), json!([1, 2]));
    }
}
