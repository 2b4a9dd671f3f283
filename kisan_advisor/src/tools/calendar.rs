//! Sowing and harvesting windows by crop and state.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{instrument, warn};

use crate::catalog::names;
use crate::engine::{FunctionCall, ToolDeclaration};
use crate::tool::Tool;

/// Sowing and harvesting window for a crop in one state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Season {
    pub sowing: String,
    pub harvesting: String,
}

/// crop (lower case) -> state (title case) -> season
pub type CalendarData = HashMap<String, HashMap<String, Season>>;

/// Static crop calendar backed by a JSON file, read on every call.
pub struct CropCalendar {
    path: PathBuf,
}

impl CropCalendar {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> anyhow::Result<CalendarData> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// JSON text for the season, or an `{"error": ...}` object.
    #[instrument(skip(self))]
    pub async fn lookup(&self, crop: &str, state: &str) -> String {
        let calendar = match self.load().await {
            Ok(c) => c,
            Err(e) => {
                warn!("Failed to load crop calendar {:?}: {}", self.path, e);
                return json!({ "error": e.to_string() }).to_string();
            }
        };

        match calendar
            .get(&crop.to_lowercase())
            .and_then(|states| states.get(&title_case(state)))
        {
            Some(season) => json!(season).to_string(),
            None => json!({ "error": format!("No data for {} in {}", crop, state) }).to_string(),
        }
    }
}

/// "andhra PRADESH" -> "Andhra Pradesh"
fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

#[async_trait]
impl Tool for CropCalendar {
    fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration::new(
            names::tools::CALENDAR,
            "Returns sowing and harvesting periods for a crop in a given Indian state.",
        )
        .param("crop", "Crop name, e.g. tomato")
        .param("state", "State name, e.g. Karnataka")
    }

    async fn call(&self, call: &FunctionCall) -> String {
        match (call.arg_str("crop"), call.arg_str("state")) {
            (Some(crop), Some(state)) => self.lookup(crop, state).await,
            _ => json!({ "error": "crop and state are required" }).to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn calendar_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"tomato": {{"Andhra Pradesh": {{"sowing": "July", "harvesting": "October"}}}}}}"#
        )
        .unwrap();
        file
    }

    #[test]
    fn title_cases_state_names() {
        assert_eq!(title_case("andhra PRADESH"), "Andhra Pradesh");
        assert_eq!(title_case("karnataka"), "Karnataka");
    }

    #[tokio::test]
    async fn looks_up_normalized_keys() {
        let file = calendar_file();
        let calendar = CropCalendar::new(file.path());
        let out: serde_json::Value =
            serde_json::from_str(&calendar.lookup("Tomato", "andhra pradesh").await).unwrap();
        assert_eq!(out["sowing"], "July");
    }

    #[tokio::test]
    async fn missing_entry_and_missing_file_are_error_objects() {
        let file = calendar_file();
        let calendar = CropCalendar::new(file.path());
        assert_eq!(
            calendar.lookup("wheat", "Punjab").await,
            r#"{"error":"No data for wheat in Punjab"}"#
        );

        let missing = CropCalendar::new("/nonexistent/crop_calendar.json");
        let out: serde_json::Value = serde_json::from_str(&missing.lookup("rice", "Punjab").await).unwrap();
        assert!(out.get("error").is_some());
    }
}
