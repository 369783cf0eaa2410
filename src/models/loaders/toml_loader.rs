use crate::models::item::Item;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;

/// 输入文件格式：
///
/// ```toml
/// [[items]]
/// title = "..."
/// abstract = "..."
/// ```
#[derive(Debug, Deserialize)]
struct ItemFile {
    #[serde(default)]
    items: Vec<BTreeMap<String, toml::Value>>,
}

/// 从 TOML 文件加载条目，条目索引按文件中的顺序分配
pub async fn load_items_from_toml(toml_file_path: &Path) -> Result<Vec<Item>> {
    let content = fs::read_to_string(toml_file_path)
        .await
        .with_context(|| format!("无法读取TOML文件: {}", toml_file_path.display()))?;

    parse_items(&content)
        .with_context(|| format!("无法解析TOML文件: {}", toml_file_path.display()))
}

/// 解析 TOML 文本中的条目
///
/// 非字符串的值（数字、布尔）会转成文本，数组和表会被忽略。
pub fn parse_items(content: &str) -> Result<Vec<Item>> {
    let file: ItemFile = toml::from_str(content)?;

    let items = file
        .items
        .into_iter()
        .enumerate()
        .map(|(index, raw)| {
            let fields = raw
                .into_iter()
                .filter_map(|(name, value)| {
                    let text = match value {
                        toml::Value::String(s) => s,
                        toml::Value::Integer(i) => i.to_string(),
                        toml::Value::Float(f) => f.to_string(),
                        toml::Value::Boolean(b) => b.to_string(),
                        other => {
                            tracing::warn!(
                                "条目 {} 的字段 {} 类型不受支持 ({}), 已忽略",
                                index,
                                name,
                                other.type_str()
                            );
                            return None;
                        }
                    };
                    Some((name, text))
                })
                .collect();
            Item::new(index, fields)
        })
        .collect::<Vec<_>>();

    tracing::info!("成功加载 {} 个条目", items.len());

    Ok(items)
}
