//! 基于字符数的 token 估算。
//!
//! 仅在上游未返回 usage、或需要为请求推算输出预算时使用。全系统统一按每 4 个字符
//! 约 1 个 token 向上取整：英文文本通常误差在 ±25% 以内，CJK 文本会明显低估
//! （实际约 1～1.5 字符/token），因此估算值只作为有界近似，不用于计费。

pub const CHARS_PER_TOKEN: usize = 4;

/// 估算一段文本的 token 数：空文本为 0，非空至少为 1。
pub fn estimate(text: &str) -> i64 {
    let chars = text.chars().count();
    if chars == 0 {
        return 0;
    }
    chars.div_ceil(CHARS_PER_TOKEN).max(1) as i64
}

/// 累加每个文本片段的估算值；调用方负责从消息中挑出文本片段。
pub fn estimate_from_messages<'a>(text_parts: impl IntoIterator<Item = &'a str>) -> i64 {
    text_parts.into_iter().map(estimate).sum()
}
