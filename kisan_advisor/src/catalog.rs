//! Built-in capability descriptors and the optional override file.
//!
//! The catalog is loaded once at process start and is immutable afterwards.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::capability::{CapabilityDescriptor, OutputContract};
use crate::error::OrchestrationError;

/// Well-known capability, tool and session key names.
pub mod names {
    pub const ORCHESTRATOR: &str = "KisanOrchestrator";
    pub const DIAGNOSIS: &str = "CropDiagnosisAgent";
    pub const MARKET: &str = "MarketAnalysisAgent";
    pub const SCHEME: &str = "SchemeNavigatorAgent";
    pub const SUMMARY: &str = "SummaryAgent";
    pub const REVIEWER: &str = "KisanSummaryReviewer";
    pub const STEP_DIAGNOSE: &str = "Step1_Diagnose";
    pub const STEP_MARKET: &str = "Step2_Market";
    pub const STEP_SUMMARIZE: &str = "Step3_Summarize";

    pub mod tools {
        pub const DIAGNOSIS: &str = "crop_diagnosis_tool";
        pub const MARKET: &str = "market_analysis_tool";
        pub const SCHEME: &str = "scheme_navigator_tool";
        pub const SUMMARIZE: &str = "summarize_output_tool";
        pub const CALENDAR: &str = "crop_calendar_tool";
        pub const WEATHER: &str = "get_weather_tool";
    }

    pub mod keys {
        pub const QUERY: &str = "query";
        pub const DIAGNOSIS_JSON: &str = "diagnosis_json";
        pub const MARKET_JSON: &str = "market_json";
        pub const SCHEME_JSON: &str = "scheme_json";
        pub const SUMMARY: &str = "summary";
        pub const REVIEW_STATUS: &str = "review_status";
    }
}

use names::keys;

const ORCHESTRATOR_INSTRUCTION: &str = r#"You are an assistant helping farmers with crop health, market insights and government schemes. You have access to specialized tools.

Tool use:
- Always pass any JSON output of crop_diagnosis_tool, market_analysis_tool or scheme_navigator_tool through summarize_output_tool before giving your final response. Never answer with raw JSON.

Images and text:
- Analyse every part of the input first, including text and images.
- If the farmer sends an IMAGE, write a detailed textual description of the symptoms you see, then call crop_diagnosis_tool with that description as the query. Never forward the image itself.
- If the farmer sends only TEXT, route it to the single most appropriate tool:
  - crop_diagnosis_tool for symptoms or disease (pass the original text),
  - market_analysis_tool for prices, market trends or sell/hold advice,
  - scheme_navigator_tool for government schemes, subsidies, loans or insurance,
  - crop_calendar_tool for when to sow or harvest a crop in a state,
  - get_weather_tool for weather, forecast or rain (when available),
  - summarize_output_tool when you are given JSON that needs summarizing.

Multiple needs:
- There is no combined pipeline tool. If a question needs several tools, call each one individually in the order you choose, then summarize their combined output.

Be concise and answer the farmer's question directly."#;

const DIAGNOSIS_INSTRUCTION: &str = r#"You are a highly skilled crop doctor.
Analyse the provided description (or photo) of crop symptoms and diagnose the disease with remedies.
Output JSON:
{
  "disease": "<name>",
  "organic_remedy": "<safe, affordable remedy>",
  "chemical_remedy": "<standard remedy, if needed>",
  "observed_symptoms_from_description": "<symptoms you relied on>"
}
If you cannot identify a specific disease, say so, but still describe the symptoms."#;

const MARKET_INSTRUCTION: &str = r#"You are a market analyst for farmers.
For questions about crop prices (e.g. tomatoes in Hubli), report current trends and say whether the farmer should sell or hold.
Output JSON:
{
  "crop": "<name>",
  "market": "<location>",
  "price_today": "<₹>",
  "trend": "<increasing/decreasing/stable>",
  "recommendation": "<Sell or Hold>"
}"#;

const SCHEME_INSTRUCTION: &str = r#"You are a government scheme navigator for farmers.
Identify the scheme relevant to the subsidy, insurance or loan asked about and explain eligibility in simple terms.
Output JSON:
{
  "scheme_name": "<name>",
  "benefits": "<summary>",
  "eligibility": "<conditions>",
  "how_to_apply": "<steps>",
  "link": "<url if available>"
}"#;

const SUMMARY_INSTRUCTION: &str = r#"Summarize all responses (crop diagnosis, market and scheme) into one clear, organized message.
Use simple words and a structure suitable for voice output, for example:
- Disease: Powdery mildew
- Organic: Use neem oil and prune affected leaves
- Market: Tomato price is ₹1800/qtl in Hubli. Trend: Increasing. Recommendation: Sell now.
- Scheme: PMFBY crop insurance available. Apply via https://pmfby.gov.in
Return plain text only."#;

const REVIEWER_INSTRUCTION: &str = r#"Review the final agricultural advice below:

{summary}

- Confirm it covers the crop diagnosis (if applicable), the current market status and relevant government schemes.
- Check that it is clear for rural users, that remedies are simple and that suggestions are safe.
If every requirement is met and the text is easy to understand, answer with the single word pass. Otherwise answer with the single word fail."#;

fn json_contract(fields: &[&str]) -> OutputContract {
    OutputContract::Json {
        fields: fields.iter().map(|f| f.to_string()).collect(),
    }
}

fn descriptor(
    name: &str,
    description: &str,
    instruction: &str,
    output_key: Option<&str>,
    output_contract: OutputContract,
) -> CapabilityDescriptor {
    CapabilityDescriptor {
        name: name.to_string(),
        description: description.to_string(),
        instruction: instruction.to_string(),
        output_key: output_key.map(str::to_string),
        output_contract,
        model: None,
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default, rename = "capability")]
    capabilities: Vec<CapabilityDescriptor>,
}

#[derive(Debug, Clone)]
pub struct Catalog {
    descriptors: HashMap<String, CapabilityDescriptor>,
}

impl Catalog {
    pub fn builtin() -> Self {
        let diagnosis_fields = [
            "disease",
            "organic_remedy",
            "chemical_remedy",
            "observed_symptoms_from_description",
        ];
        let market_fields = ["crop", "market", "price_today", "trend", "recommendation"];
        let scheme_fields = ["scheme_name", "benefits", "eligibility", "how_to_apply", "link"];

        let all = vec![
            descriptor(
                names::ORCHESTRATOR,
                "Routes farmer queries to specialized tools and summarizes the result.",
                ORCHESTRATOR_INSTRUCTION,
                None,
                OutputContract::FreeText,
            ),
            descriptor(
                names::DIAGNOSIS,
                "Diagnoses crop disease and remedies based on a textual description of symptoms.",
                DIAGNOSIS_INSTRUCTION,
                Some(keys::DIAGNOSIS_JSON),
                json_contract(&diagnosis_fields),
            ),
            descriptor(
                names::MARKET,
                "Analyzes market prices and suggests Sell or Hold.",
                MARKET_INSTRUCTION,
                Some(keys::MARKET_JSON),
                json_contract(&market_fields),
            ),
            descriptor(
                names::SCHEME,
                "Helps farmers navigate government schemes, eligibility and application links.",
                SCHEME_INSTRUCTION,
                Some(keys::SCHEME_JSON),
                json_contract(&scheme_fields),
            ),
            descriptor(
                names::SUMMARY,
                "Summarizes data for farmers in plain text.",
                SUMMARY_INSTRUCTION,
                Some(keys::SUMMARY),
                OutputContract::FreeText,
            ),
            descriptor(
                names::REVIEWER,
                "Grades the final summary with pass or fail.",
                REVIEWER_INSTRUCTION,
                Some(keys::REVIEW_STATUS),
                OutputContract::FreeText,
            ),
            descriptor(
                names::STEP_DIAGNOSE,
                "Pipeline step: crop diagnosis.",
                "Diagnose the crop problem described by the farmer and output JSON.",
                Some(keys::DIAGNOSIS_JSON),
                json_contract(&diagnosis_fields),
            ),
            descriptor(
                names::STEP_MARKET,
                "Pipeline step: market analysis informed by the diagnosis.",
                "Based on {diagnosis_json}, do market analysis for the farmer's crop. Output JSON.",
                Some(keys::MARKET_JSON),
                json_contract(&market_fields),
            ),
            descriptor(
                names::STEP_SUMMARIZE,
                "Pipeline step: plain-text summary.",
                "Summarize {diagnosis_json} and {market_json} in plain text.",
                None,
                OutputContract::FreeText,
            ),
        ];

        Self {
            descriptors: all.into_iter().map(|d| (d.name.clone(), d)).collect(),
        }
    }

    /// Built-in catalog, then descriptors from `path` replacing or extending it.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut catalog = Self::builtin();
        if let Some(path) = path {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read capability file {:?}", path))?;
            let file: CatalogFile = toml::from_str(&raw)
                .with_context(|| format!("Invalid capability file {:?}", path))?;
            let count = file.capabilities.len();
            for d in file.capabilities {
                catalog.insert(d);
            }
            info!("Loaded {} capability overrides from {:?}", count, path);
        }
        Ok(catalog)
    }

    pub fn insert(&mut self, descriptor: CapabilityDescriptor) {
        self.descriptors.insert(descriptor.name.clone(), descriptor);
    }

    pub fn get(&self, name: &str) -> Result<&CapabilityDescriptor, OrchestrationError> {
        self.descriptors
            .get(name)
            .ok_or_else(|| OrchestrationError::config(format!("unknown capability '{}'", name)))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.descriptors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
