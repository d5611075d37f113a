use axum::http::HeaderMap;
use sonic_rs::prelude::*;
use std::borrow::Cow;
use std::time::Duration;

/// 日志等级（LOG_LEVEL）：控制本 crate 的输出级别；依赖库固定在 warn。
/// debug 及以上额外输出每次上游请求/响应的详细内容（脱敏）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    /// 大小写不敏感；无法识别的值按 info 处理。
    pub fn parse(level: &str) -> Self {
        match level.trim().to_lowercase().as_str() {
            "off" | "none" => Self::Off,
            "error" => Self::Error,
            "warn" | "warning" => Self::Warn,
            "debug" => Self::Debug,
            "trace" => Self::Trace,
            _ => Self::Info,
        }
    }

    /// EnvFilter 指令中使用的级别名。
    pub fn directive(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }

    /// 是否输出上游请求/响应详情。
    pub fn exchange_enabled(self) -> bool {
        self >= Self::Debug
    }
}

/// 日志中展示 key 时只保留首尾各 4 个字符。
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len().max(3));
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

/// 隐藏 URL 查询串中的 `key=` 参数。
pub fn redact_url(url: &str) -> Cow<'_, str> {
    let Some((base, query)) = url.split_once('?') else {
        return Cow::Borrowed(url);
    };
    if !query.split('&').any(|p| p.starts_with("key=")) {
        return Cow::Borrowed(url);
    }
    let query = query
        .split('&')
        .map(|p| if p.starts_with("key=") { "key=***" } else { p })
        .collect::<Vec<_>>()
        .join("&");
    Cow::Owned(format!("{base}?{query}"))
}

pub fn format_duration_ms(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

pub fn upstream_request(method: &str, url: &str, headers: &HeaderMap, body: &[u8]) {
    tracing::debug!(
        "\n====================== 上游请求 ========================\n[上游请求] {method} {}\n[上游请求头]\n{}\n{}\n==========================================================",
        redact_url(url),
        format_headers(headers),
        format_body_bytes(body)
    );
}

pub fn upstream_response(status: u16, duration: Duration, body: &[u8]) {
    tracing::debug!(
        "\n====================== 上游响应 ========================\n[上游响应] {} {}ms\n{}\n==========================================================",
        status,
        format_duration_ms(duration),
        format_body_bytes(body)
    );
}

fn format_headers(headers: &HeaderMap) -> String {
    let mut obj = sonic_rs::Object::new();

    for (name, value) in headers.iter() {
        let key = name.as_str();
        let redacted = matches!(
            key,
            "x-goog-api-key" | "authorization" | "proxy-authorization"
        );

        let v = if redacted {
            sonic_rs::Value::from(mask_key(value.to_str().unwrap_or_default()).as_str())
        } else {
            match value.to_str() {
                Ok(s) => sonic_rs::Value::from(s),
                Err(_) => sonic_rs::Value::from("<binary>"),
            }
        };

        // 同名多值统一输出为数组。
        if let Some(existing) = obj.get(&key).and_then(|v| v.as_array()) {
            let mut arr = existing.to_vec();
            arr.push(v);
            obj.insert(key, arr);
        } else {
            obj.insert(key, vec![v]);
        }
    }

    format_body_value(&obj.into_value())
}

fn format_body_value(v: &sonic_rs::Value) -> String {
    let sanitized = sanitize_json_for_log(v, false);
    match sonic_rs::to_string_pretty(&sanitized) {
        Ok(s) => s,
        Err(_) => sanitized.to_string(),
    }
}

fn format_body_bytes(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }

    // 大包只展示首尾，避免为日志做整包解析。
    const MAX_PARSE_BYTES: usize = 2 * 1024 * 1024;
    const HEAD_TAIL: usize = 16 * 1024;

    if bytes.len() > MAX_PARSE_BYTES {
        let head = String::from_utf8_lossy(&bytes[..HEAD_TAIL]);
        let tail = String::from_utf8_lossy(&bytes[bytes.len() - HEAD_TAIL..]);
        return format!(
            "(body too large: {} bytes, showing head/tail)\n--- head ---\n{head}\n--- tail ---\n{tail}",
            bytes.len()
        );
    }

    match sonic_rs::from_slice::<sonic_rs::Value>(bytes) {
        Ok(v) => format_body_value(&v),
        Err(_) => truncate_text_for_log(&String::from_utf8_lossy(bytes)),
    }
}

fn truncate_text_for_log(s: &str) -> String {
    const MAX_CHARS: usize = 32 * 1024;
    match s.char_indices().nth(MAX_CHARS) {
        None => s.to_string(),
        Some((cut, _)) => format!("{}...[TRUNCATED]", &s[..cut]),
    }
}

/// Gemini 请求里的 `inlineData.data` 是 base64 的图片/音频，日志里只保留首尾。
fn sanitize_json_for_log(v: &sonic_rs::Value, in_inline_data: bool) -> sonic_rs::Value {
    if let Some(obj) = v.as_object() {
        let mut out = sonic_rs::Object::new();
        for (key, child) in obj.iter() {
            let sanitized = match key {
                "inlineData" | "inline_data" => sanitize_json_for_log(child, true),
                "data" if in_inline_data => match child.as_str() {
                    Some(s) => sonic_rs::Value::from(truncate_base64(s).as_ref()),
                    None => sanitize_json_for_log(child, false),
                },
                _ => sanitize_json_for_log(child, in_inline_data),
            };
            out.insert(key, sanitized);
        }
        return out.into_value();
    }

    if let Some(arr) = v.as_array() {
        let out: Vec<sonic_rs::Value> = arr
            .iter()
            .map(|item| sanitize_json_for_log(item, in_inline_data))
            .collect();
        return sonic_rs::Value::from(out);
    }

    v.to_owned()
}

fn truncate_base64(s: &str) -> Cow<'_, str> {
    const KEEP: usize = 20;
    if s.len() <= 100 || !s.is_ascii() {
        return Cow::Borrowed(s);
    }
    let omitted = s.len() - KEEP * 2;
    Cow::Owned(format!(
        "{}...[TRUNCATED: {omitted} chars]...{}",
        &s[..KEEP],
        &s[s.len() - KEEP..]
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn parse_log_level_is_case_insensitive_and_defaults_to_info() {
        assert_eq!(LogLevel::parse("DEBUG"), LogLevel::Debug);
        assert_eq!(LogLevel::parse(" warn "), LogLevel::Warn);
        assert_eq!(LogLevel::parse("off"), LogLevel::Off);
        assert_eq!(LogLevel::parse("verbose"), LogLevel::Info);
        assert!(LogLevel::Trace.exchange_enabled());
        assert!(!LogLevel::Info.exchange_enabled());
        assert_eq!(LogLevel::Error.directive(), "error");
    }

    #[test]
    fn mask_key_keeps_head_and_tail() {
        assert_eq!(mask_key("AIzaSyD-1234567890abcd"), "AIza...abcd");
        assert_eq!(mask_key("short"), "*****");
        assert_eq!(mask_key(""), "***");
    }

    #[test]
    fn redact_url_hides_key_param() {
        assert_eq!(
            redact_url("https://g.example/v1/models?alt=sse&key=AIzaSECRET"),
            "https://g.example/v1/models?alt=sse&key=***"
        );
        assert_eq!(
            redact_url("https://g.example/v1/models?monkey=1"),
            "https://g.example/v1/models?monkey=1"
        );
    }

    #[test]
    fn headers_are_redacted() {
        let mut headers = HeaderMap::new();
        headers.insert("x-goog-api-key", HeaderValue::from_static("AIzaSyD-1234567890abcd"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        let out = format_headers(&headers);
        assert!(out.contains("AIza...abcd"));
        assert!(!out.contains("1234567890"));
        assert!(out.contains("application/json"));
    }

    #[test]
    fn inline_data_is_truncated() {
        let data = "A".repeat(500);
        let body = format!(r#"{{"contents":[{{"parts":[{{"inlineData":{{"mimeType":"image/png","data":"{data}"}}}}]}}]}}"#);
        let out = format_body_bytes(body.as_bytes());
        assert!(out.contains("TRUNCATED: 460 chars"));
        assert!(out.contains("image/png"));
    }

    #[test]
    fn long_text_is_truncated() {
        let s = "x".repeat(40 * 1024);
        let out = truncate_text_for_log(&s);
        assert!(out.ends_with("...[TRUNCATED]"));
        assert_eq!(out.len(), 32 * 1024 + "...[TRUNCATED]".len());
    }
}
