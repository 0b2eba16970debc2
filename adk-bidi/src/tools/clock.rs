//! Current Japan time.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, FixedOffset, TimeZone, Timelike, Utc};
use serde_json::{Value, json};

use super::ToolHandler;
use crate::config::ToolDefinition;
use crate::error::{BidiError, Result};

const JST_OFFSET_SECS: i32 = 9 * 3600;
const WEEKDAYS: [&str; 7] = ["月", "火", "水", "木", "金", "土", "日"];

fn jst() -> Result<FixedOffset> {
    FixedOffset::east_opt(JST_OFFSET_SECS).ok_or_else(|| BidiError::tool("invalid JST offset"))
}

/// The current instant in Japan Standard Time.
pub fn japan_now() -> Result<DateTime<FixedOffset>> {
    Ok(Utc::now().with_timezone(&jst()?))
}

/// Render `time` as `YYYY年M月D日(曜) HH:MM JST`.
pub fn format_japan_time<Tz: TimeZone>(time: &DateTime<Tz>) -> Result<String> {
    let local = time.with_timezone(&jst()?);
    let weekday = WEEKDAYS[local.weekday().num_days_from_monday() as usize];
    Ok(format!(
        "{}年{}月{}日({}) {:02}:{:02} JST",
        local.year(),
        local.month(),
        local.day(),
        weekday,
        local.hour(),
        local.minute()
    ))
}

/// `get_current_time`: reports the current Japan time.
#[derive(Debug, Clone, Copy, Default)]
pub struct CurrentTimeTool;

#[async_trait]
impl ToolHandler for CurrentTimeTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new("get_current_time")
            .with_description("現在の日本時間を取得します。")
            .with_parameters(json!({"type": "object", "properties": {}}))
    }

    async fn execute(&self, _input: &Value) -> Result<Value> {
        Ok(Value::String(format_japan_time(&japan_now()?)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_converts_to_jst() {
        let utc = Utc.with_ymd_and_hms(2026, 2, 16, 6, 30, 0).unwrap();
        assert_eq!(format_japan_time(&utc).unwrap(), "2026年2月16日(月) 15:30 JST");
    }

    #[test]
    fn test_format_crosses_midnight() {
        let utc = Utc.with_ymd_and_hms(2025, 12, 31, 15, 5, 0).unwrap();
        assert_eq!(format_japan_time(&utc).unwrap(), "2026年1月1日(木) 00:05 JST");
    }

    #[tokio::test]
    async fn test_tool_output_shape() {
        let value = CurrentTimeTool.execute(&Value::Null).await.unwrap();
        let text = value.as_str().unwrap();
        assert!(text.ends_with(" JST"));
        assert!(WEEKDAYS.iter().any(|w| text.contains(&format!("({w})"))));
        assert!(text.contains(&japan_now().unwrap().year().to_string()));
    }
}
