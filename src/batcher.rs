//! 令牌估算与批次划分
//!
//! 估算文本的令牌成本，并把待翻译列表划分为不超过输入预算的批次。

use std::sync::Arc;

/// 启用扩展推理时输入预算与输出预算之比的倒数
pub const THINKING_BUDGET_DIVISOR: usize = 4;

/// 令牌估算器
///
/// 默认实现是粗略的启发式，后续可以替换为真实的分词器。
pub trait TokenEstimator: Send + Sync {
    /// 估算一段文本的令牌数
    fn estimate(&self, text: &str) -> usize;
}

/// 默认估算器：`ceil(字符数 / 2)`
#[derive(Debug, Clone, Copy, Default)]
pub struct HalfLengthEstimator;

impl TokenEstimator for HalfLengthEstimator {
    fn estimate(&self, text: &str) -> usize {
        text.chars().count().div_ceil(2)
    }
}

/// 根据输出预算和推理模式计算输入预算
pub fn max_input_tokens(max_output_tokens: usize, uses_extended_reasoning: bool) -> usize {
    if uses_extended_reasoning {
        max_output_tokens / THINKING_BUDGET_DIVISOR
    } else {
        max_output_tokens
    }
}

/// 一个批次：按输入顺序排列的文本
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchGroup {
    pub texts: Vec<String>,
    /// 批次内文本的估算令牌总数
    pub estimated_tokens: usize,
}

impl BatchGroup {
    fn empty() -> Self {
        Self {
            texts: Vec::new(),
            estimated_tokens: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.texts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }
}

/// 批次划分器
#[derive(Clone)]
pub struct Batcher {
    estimator: Arc<dyn TokenEstimator>,
}

impl Default for Batcher {
    fn default() -> Self {
        Self::new(Arc::new(HalfLengthEstimator))
    }
}

impl Batcher {
    pub fn new(estimator: Arc<dyn TokenEstimator>) -> Self {
        Self { estimator }
    }

    pub fn estimate(&self, text: &str) -> usize {
        self.estimator.estimate(text)
    }

    /// 按令牌预算贪心划分批次
    ///
    /// 总量不超过预算时返回包含全部文本的单个批次；否则依次累加，
    /// 加入下一条会超出预算时关闭当前批次。单条文本自身就超出预算时
    /// 单独成批，不再切分。
    pub fn batch(&self, texts: &[String], max_input_tokens: usize) -> Vec<BatchGroup> {
        if texts.is_empty() {
            return Vec::new();
        }

        let costs: Vec<usize> = texts.iter().map(|t| self.estimate(t)).collect();
        let total: usize = costs.iter().sum();

        if total <= max_input_tokens {
            return vec![BatchGroup {
                texts: texts.to_vec(),
                estimated_tokens: total,
            }];
        }

        let mut batches = Vec::new();
        let mut current = BatchGroup::empty();

        for (text, &cost) in texts.iter().zip(&costs) {
            if cost > max_input_tokens {
                if !current.is_empty() {
                    batches.push(std::mem::replace(&mut current, BatchGroup::empty()));
                }
                batches.push(BatchGroup {
                    texts: vec![text.clone()],
                    estimated_tokens: cost,
                });
                continue;
            }

            if current.estimated_tokens + cost > max_input_tokens && !current.is_empty() {
                batches.push(std::mem::replace(&mut current, BatchGroup::empty()));
            }
            current.texts.push(text.clone());
            current.estimated_tokens += cost;
        }

        if !current.is_empty() {
            batches.push(current);
        }

        tracing::debug!(
            "文本总令牌估算 {}，预算 {}，分为 {} 个批次",
            total,
            max_input_tokens,
            batches.len()
        );

        batches
    }
}
