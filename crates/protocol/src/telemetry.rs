use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod tags {
    pub const POSITION: &str = "position";
    pub const ANALYSIS: &str = "analysis";
}

/// Body of a `tag:payload` telemetry line.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(serde_json::Value),
    Raw(String),
}

impl Payload {
    /// Structured when the text is valid JSON, the raw string otherwise.
    pub fn parse(raw: &str) -> Self {
        match serde_json::from_str(raw) {
            Ok(value) => Self::Json(value),
            Err(_) => Self::Raw(raw.to_string()),
        }
    }

    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match self {
            Self::Json(value) => serde_json::from_value(value.clone()),
            Self::Raw(text) => serde_json::from_str(text),
        }
    }
}

/// A position the engine has reached, addressed by its move path from the root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionReport {
    #[serde(default)]
    pub moves: Vec<String>,
    /// `size * size` cells of `.`, `X` (black) or `O` (white), top row first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub board: Option<String>,
}

/// Search statistics for the position at `moves`. Every other field is optional;
/// absent fields leave the node's statistics untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    #[serde(default)]
    pub moves: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visits: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_moves: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_visits: Option<Vec<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_values: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variations: Option<BTreeMap<String, Vec<String>>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_falls_back_to_raw_text() {
        assert_eq!(
            Payload::parse(r#"{"visits":3}"#),
            Payload::Json(serde_json::json!({"visits": 3}))
        );
        assert_eq!(
            Payload::parse("thinking..."),
            Payload::Raw("thinking...".to_string())
        );
    }

    #[test]
    fn analysis_report_uses_camel_case_keys() {
        let payload = Payload::parse(
            r#"{"moves":["D4"],"visits":400,"childMoves":["C3","Q16"],"childVisits":[300,100]}"#,
        );
        let report: AnalysisReport = payload.decode().unwrap();
        assert_eq!(report.moves, vec!["D4".to_string()]);
        assert_eq!(report.visits, Some(400));
        assert_eq!(report.child_visits, Some(vec![300, 100]));
        assert!(report.value.is_none());
        assert!(report.variations.is_none());
    }

    #[test]
    fn position_report_board_is_optional() {
        let report: PositionReport = Payload::parse(r#"{"moves":["pass"]}"#).decode().unwrap();
        assert_eq!(report.moves, vec!["pass".to_string()]);
        assert!(report.board.is_none());
    }
}
