//! # 时间工具
//!
//! 系统内部统一使用epoch毫秒（i64），对外展示时转换为RFC3339。

use chrono::{TimeZone, Utc};

/// 当前epoch毫秒时间戳
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// epoch毫秒转RFC3339文本，非法时间戳返回None
pub fn format_ms(timestamp_ms: i64) -> Option<String> {
    Utc.timestamp_millis_opt(timestamp_ms)
        .single()
        .map(|dt| dt.to_rfc3339())
}

/// 可空时间戳的RFC3339渲染
pub fn format_ms_opt(timestamp_ms: Option<i64>) -> Option<String> {
    timestamp_ms.and_then(format_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_ms_roundtrip() {
        let formatted = format_ms(1_700_000_000_000).expect("valid timestamp");
        assert!(formatted.starts_with("2023-11-14T"));
    }

    #[test]
    fn test_format_ms_opt_none() {
        assert_eq!(format_ms_opt(None), None);
        assert!(format_ms_opt(Some(0)).is_some());
    }

    #[test]
    fn test_now_ms_monotone_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
    }
}
