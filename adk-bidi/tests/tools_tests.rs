//! Tests for the agent's tools.

use adk_bidi::tools::{STOP_CONVERSATION, default_tools, evaluate, format_japan_time};
use chrono::{TimeZone, Utc};
use serde_json::json;

#[test]
fn test_calculator_reference_cases() {
    assert_eq!(evaluate("2 + 3"), "2 + 3 = 5");
    assert_eq!(evaluate("10 / 2"), "10 / 2 = 5");
    assert_eq!(evaluate("7 / 2"), "7 / 2 = 3.5");
    assert!(evaluate("1 / 0").starts_with("計算エラー"));
    assert_eq!(evaluate("import os"), "エラー: 許可されていない文字が含まれています");
    assert!(evaluate("").starts_with("計算エラー"));
}

#[test]
fn test_calculator_echoes_input_verbatim() {
    assert_eq!(evaluate("  (1+2)*3 "), "  (1+2)*3  = 9");
    assert_eq!(evaluate("0.1 * 3"), "0.1 * 3 = 0.30000000000000004");
}

#[test]
fn test_calculator_rejects_malformed() {
    for expr in ["2 +", "(1 + 2", "1 2", "* 3", "()"] {
        assert!(evaluate(expr).starts_with("計算エラー"), "{expr}");
    }
}

#[test]
fn test_clock_format() {
    let time = Utc.with_ymd_and_hms(2026, 10, 18, 3, 5, 0).unwrap();
    assert_eq!(format_japan_time(&time).unwrap(), "2026年10月18日(日) 12:05 JST");
}

#[tokio::test]
async fn test_registry_executes_tools() {
    let tools = default_tools();

    let calc = tools.get("simple_calculator").unwrap();
    assert_eq!(calc.execute(&json!({"expression": "6 * 7"})).await.unwrap(), json!("6 * 7 = 42"));
    assert!(calc.execute(&json!({"expr": "6 * 7"})).await.is_err());

    let clock = tools.get("get_current_time").unwrap();
    let now = clock.execute(&json!({})).await.unwrap();
    assert!(now.as_str().unwrap().ends_with("JST"));

    let stop = tools.get(STOP_CONVERSATION).unwrap();
    assert!(stop.execute(&json!({})).await.is_ok());
}

#[test]
fn test_definitions_carry_schemas() {
    for definition in default_tools().definitions() {
        assert!(!definition.description.as_deref().unwrap_or("").is_empty(), "{}", definition.name);
        assert_eq!(definition.parameters.as_ref().unwrap()["type"], "object");
    }
}
