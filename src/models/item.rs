//! 批处理数据模型
//!
//! - `Item`：一个独立的分析单元（一篇文献）
//! - `ItemOutcome`：单个条目的处理结果
//! - `BatchResult`：按输入顺序排列的全部结果

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 字段之间的分隔符（ASCII Unit Separator）
const FIELD_SEPARATOR: char = '\u{1f}';
/// 条目内每个 "名称/内容" 对的结束符（ASCII Record Separator）
const RECORD_SEPARATOR: char = '\u{1e}';

/// 批处理条目
///
/// `index` 是条目在原始表格中的位置，`fields` 是适配器需要的文本字段，
/// 例如 `title` / `abstract`。条目创建后不再修改。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub index: usize,
    pub fields: BTreeMap<String, String>,
}

impl Item {
    /// 创建新的条目
    pub fn new(index: usize, fields: BTreeMap<String, String>) -> Self {
        Self { index, fields }
    }

    /// 便捷构造：从 (名称, 内容) 列表创建
    pub fn from_pairs<K, V>(index: usize, pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            index,
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// 获取字段内容
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// 用于计算缓存键的规范化内容
    ///
    /// 字段按名称排序拼接，与条目位置无关。
    pub fn content(&self) -> String {
        let mut content = String::new();
        for (name, value) in &self.fields {
            content.push_str(name);
            content.push(FIELD_SEPARATOR);
            content.push_str(value);
            content.push(RECORD_SEPARATOR);
        }
        content
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[条目 {}]", self.index)
    }
}

/// 条目失败的类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemErrorKind {
    /// 适配器返回错误
    Adapter,
    /// 超过单条超时时间
    Timeout,
    /// 适配器发生 panic
    Panicked,
}

/// 单个条目的错误信息
///
/// 条目错误是结果数据的一部分，需要写入检查点，所以只保存可序列化的文本。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub kind: ItemErrorKind,
    pub message: String,
}

impl ItemError {
    pub fn adapter(err: &anyhow::Error) -> Self {
        Self {
            kind: ItemErrorKind::Adapter,
            message: format!("{:#}", err),
        }
    }

    pub fn timeout(secs: f64) -> Self {
        Self {
            kind: ItemErrorKind::Timeout,
            message: format!("处理超时 (超过 {:.1} 秒)", secs),
        }
    }

    pub fn panicked(message: impl Into<String>) -> Self {
        Self {
            kind: ItemErrorKind::Panicked,
            message: message.into(),
        }
    }
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// 跳过原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// 开始处理前已取消
    Cancelled,
    /// 批处理因检查点无法写入而中止，条目未提交
    Aborted,
}

/// 单个条目的处理结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemOutcome {
    /// 处理成功；`cached` 表示结果来自缓存
    Success { payload: Value, cached: bool },
    /// 处理失败
    Failed { error: ItemError },
    /// 未处理
    Skipped { reason: SkipReason },
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Success { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ItemOutcome::Failed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, ItemOutcome::Skipped { .. })
    }

    /// 成功结果的内容
    pub fn payload(&self) -> Option<&Value> {
        match self {
            ItemOutcome::Success { payload, .. } => Some(payload),
            _ => None,
        }
    }

    /// 是否已经真正处理完毕（成功或失败），可以写入检查点
    pub fn is_settled(&self) -> bool {
        !self.is_skipped()
    }
}

/// 批处理的最终状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BatchStatus {
    /// 全部条目都已处理（条目级失败不影响该状态）
    Completed,
    /// 用户取消
    Cancelled,
    /// 编排本身出错（例如检查点持续无法写入）
    Failed { reason: String },
}

/// 批处理统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    /// 命中缓存的条目数
    pub cache_hits: usize,
    /// 从检查点恢复的条目数
    pub restored: usize,
    /// 实际调用适配器的条目数
    pub adapter_calls: usize,
    /// 本次运行保存检查点的次数
    pub checkpoint_saves: usize,
}

/// 批处理结果
///
/// `outcomes` 的顺序始终与输入顺序一致，与完成顺序无关。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub status: BatchStatus,
    pub outcomes: Vec<ItemOutcome>,
    pub stats: BatchStats,
}

impl BatchResult {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// 是否每个条目都成功
    pub fn is_fully_successful(&self) -> bool {
        self.status == BatchStatus::Completed && self.outcomes.iter().all(ItemOutcome::is_success)
    }

    /// 失败条目的索引
    pub fn failed_indices(&self) -> Vec<usize> {
        self.outcomes
            .iter()
            .enumerate()
            .filter(|(_, outcome)| outcome.is_failed())
            .map(|(index, _)| index)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_ignores_index_and_insertion_order() {
        let a = Item::from_pairs(0, [("title", "T"), ("abstract", "A")]);
        let b = Item::from_pairs(7, [("abstract", "A"), ("title", "T")]);
        assert_eq!(a.content(), b.content());
    }

    #[test]
    fn test_content_distinguishes_field_boundaries() {
        let a = Item::from_pairs(0, [("title", "ab"), ("abstract", "c")]);
        let b = Item::from_pairs(0, [("title", "a"), ("abstract", "bc")]);
        assert_ne!(a.content(), b.content());
    }

    #[test]
    fn test_outcome_serialization_is_tagged() {
        let outcome = ItemOutcome::Failed {
            error: ItemError::timeout(2.0),
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["error"]["kind"], "timeout");

        let success = ItemOutcome::Success {
            payload: json!({"score": 4}),
            cached: false,
        };
        let back: ItemOutcome =
            serde_json::from_str(&serde_json::to_string(&success).unwrap()).unwrap();
        assert_eq!(back, success);
    }

    #[test]
    fn test_fully_successful_requires_completed_status() {
        let result = BatchResult {
            status: BatchStatus::Cancelled,
            outcomes: vec![ItemOutcome::Success {
                payload: json!(1),
                cached: false,
            }],
            stats: BatchStats::default(),
        };
        assert!(!result.is_fully_successful());
    }
}
