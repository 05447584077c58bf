//! 输入验证工具函数
//!
//! 校验用户身份和服务地址，避免把无效输入带进请求

use regex::Regex;
use std::sync::OnceLock;

fn email_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[^@\s/]+@[^@\s/]+\.[^@\s/]+$").expect("邮箱正则表达式无效")
    })
}

/// 验证用户邮箱
///
/// # 返回
/// - `Ok(())`: 验证通过
/// - `Err(String)`: 错误信息
pub fn validate_email(email: &str) -> Result<(), String> {
    if email_pattern().is_match(email.trim()) {
        Ok(())
    } else {
        Err(format!("无效的邮箱地址: {}", email))
    }
}

/// 验证服务地址（必须是 http/https 开头）
pub fn validate_base_url(url: &str) -> Result<(), String> {
    let trimmed = url.trim();
    let rest = trimmed
        .strip_prefix("http://")
        .or_else(|| trimmed.strip_prefix("https://"));
    match rest {
        Some(host) if !host.is_empty() && !host.starts_with('/') => Ok(()),
        _ => Err(format!("无效的服务地址: {}", url)),
    }
}
