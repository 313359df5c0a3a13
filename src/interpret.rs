//! AI interpretation: prompt construction and the Gemini client.
//!
//! Prompts are deterministic functions of the forecast data and the resolved
//! interpretation options, so they can be asserted on in tests without
//! touching the network.

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{Error, Result};
use crate::forecast::ForecastSample;
use crate::metrics;
use crate::storage::Account;

/// Supported interpretation languages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    En,
    Tr,
    De,
    Fr,
    Es,
    It,
    Ru,
    Pt,
}

impl Language {
    /// Parse a two-letter code; unknown codes fall back to English.
    pub fn from_code(code: &str) -> Self {
        match code {
            "tr" => Self::Tr,
            "de" => Self::De,
            "fr" => Self::Fr,
            "es" => Self::Es,
            "it" => Self::It,
            "ru" => Self::Ru,
            "pt" => Self::Pt,
            _ => Self::En,
        }
    }

    /// Full language name, as spelled inside the prompt.
    pub fn full_name(&self) -> &'static str {
        match self {
            Self::En => "English",
            Self::Tr => "Turkish",
            Self::De => "German",
            Self::Fr => "French",
            Self::Es => "Spanish",
            Self::It => "Italian",
            Self::Ru => "Russian",
            Self::Pt => "Portuguese",
        }
    }
}

/// Unit system for the generated text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Units {
    #[default]
    Metric,
    Imperial,
}

impl Units {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Metric => "metric",
            Self::Imperial => "imperial",
        }
    }
}

/// Resolved interpretation options.
///
/// Explicit request values win over the account's stored preferences, which
/// win over the defaults (English, "basic", metric).
#[derive(Debug, Clone)]
pub struct InterpretOptions {
    pub language: Language,
    pub style: String,
    pub units: Units,
}

impl InterpretOptions {
    pub fn resolve(
        account: &Account,
        req_language: Option<&str>,
        req_style: Option<&str>,
        req_units: Option<&str>,
    ) -> Self {
        let language = req_language
            .or(Some(account.language.as_str()))
            .filter(|s| !s.is_empty())
            .map(Language::from_code)
            .unwrap_or_default();

        let style = req_style
            .or(Some(account.style.as_str()))
            .filter(|s| !s.is_empty())
            .unwrap_or("basic")
            .to_string();

        let units = match req_units.or(Some(account.units.as_str())) {
            Some("imperial") => Units::Imperial,
            _ => Units::Metric,
        };

        Self {
            language,
            style,
            units,
        }
    }
}

/// Style-specific prompt blocks.
fn style_instructions(style: &str) -> &'static str {
    match style {
        "ridge" => {
            "SPECIAL INSTRUCTIONS FOR RIDGE SOARING:\n\
1. PRIMARY FOCUS: Wind speed and direction are the most critical factors.\n\
2. IDEAL WIND: 20-25+ km/h (approx 13mph) is optimal for DHV1/EN-A paragliders.\n\
3. DANGER WARNINGS:\n\
   - Sustained winds > 40 km/h can cause problems (blown back).\n\
   - Gusts > 20 km/h (difference between sustained and gust) can make takeoff very hard/dangerous.\n\
4. Do NOT focus primarily on thermals; focus on ridge lift potential (wind perpendicular to ridge).\n"
        }
        "xcperfect" => {
            "SPECIAL INSTRUCTIONS FOR XC PERFECT ALERT:\n\
1. OBJECTIVE: You are the judge. Is today an EPIC 100km+ XC day?\n\
2. FORMAT: Start your response with either \"XC STATUS: GO!\" or \"XC STATUS: NO GO\" or \"XC STATUS: MARGINAL\".\n\
3. CRITERIA for GO:\n\
   - High Cloudbase (>2000m).\n\
   - Strong but safe thermals.\n\
   - Low wind or good tailwind.\n\
   - No rain/storms.\n\
4. TONE:\n\
   - If GO: Enthusiastic, hype up the pilot!\n\
   - If NO GO: Brutally honest. Save the pilot gas money.\n\
5. Provide a rough estimation of max potential distance (e.g. \"Potential for 50-80km triangle\").\n"
        }
        _ => "",
    }
}

/// Prompt for a single-location report. The model also receives the thermal
/// meteogram image alongside this text.
pub fn single_point_prompt(sample: &ForecastSample, options: &InterpretOptions) -> String {
    format!(
        "You are an expert paragliding meteorologist.\n\
The pilot has explicitly requested the analysis in: {units} units.\n\
INSTRUCTIONS:\n\
1. Tone/Complexity: {style}\n\
2. RESPONSE LANGUAGE: {language}\n\
3. Make sure the dates do not start 1 day before.\n\
4. PRIMARY SOURCE: Focus heavily on the meteogram image for all thermal-related analysis \
(e.g., cloud base, dry thermals, soaring altitude) and general weather patterns, \
rather than only raw text data.\n\
5. Specifically analyze and mention the potential for dry thermals and estimate the \
soaring altitude based on the meteogram.\n\
6. Include rain/precipitation status in your analysis.\n\
7. Add all tailored information necessary for {style}.\n\
8. If the weather is bad warn the pilot about the dangers.\n\
{extra}\
(CRITICAL: Write the entire response in {language}.)\n\
\n\
Raw Data (Supplementary):\n\
{data}\n",
        units = options.units.as_str(),
        style = options.style,
        language = options.language.full_name(),
        extra = style_instructions(&options.style),
        data = sample.hourly_summary,
    )
}

/// Prompt for a multi-point route report. Text only, no image.
pub fn route_prompt(samples: &[ForecastSample], options: &InterpretOptions) -> String {
    let data_summary = samples
        .iter()
        .enumerate()
        .map(|(i, s)| s.route_line(i))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Analyze this paragliding route by interpreting EACH point separately:\n\
\n\
{data_summary}\n\
\n\
INSTRUCTIONS:\n\
- Role: Expert XC Pilot.\n\
- Style: {style}\n\
- Language: {language}\n\
- Units: {units}\n\
\n\
STRUCTURE:\n\
1. **Point-by-Point Analysis**: Briefly analyze the conditions (Wind, Cloudbase, Thermals) \
for each point listed above.\n\
2. **Route Verdict**: Is the connection feasible? Where is the crux?\n\
\n\
(Make sure to provide value for every point since the pilot paid for each location analysis.)\n",
        style = options.style,
        language = options.language.full_name(),
        units = options.units.as_str(),
    )
}

/// Generates interpretation text from a prompt and an optional image.
#[async_trait]
pub trait Interpreter: Send + Sync {
    async fn generate(&self, prompt: &str, image_png: Option<&[u8]>) -> Result<String>;
}

/// Google Gemini generateContent client.
pub struct GeminiClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: String,
}

impl GeminiClient {
    pub fn new(api_key: &str, model: &str, timeout: std::time::Duration) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl Interpreter for GeminiClient {
    async fn generate(&self, prompt: &str, image_png: Option<&[u8]>) -> Result<String> {
        let mut parts = vec![json!({ "text": prompt })];
        if let Some(png) = image_png {
            parts.push(json!({
                "inline_data": {
                    "mime_type": "image/png",
                    "data": base64::engine::general_purpose::STANDARD.encode(png),
                }
            }));
        }

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        let response = self
            .client
            .post(&url)
            .json(&json!({ "contents": [{ "parts": parts }] }))
            .send()
            .await
            .and_then(|r| r.error_for_status());

        let response = match response {
            Ok(r) => {
                metrics::record_upstream_call("gemini", "ok");
                r
            }
            Err(e) => {
                metrics::record_upstream_call("gemini", "error");
                return Err(Error::Http(e));
            }
        };

        let body: GenerateContentResponse = response.json().await?;
        let text: String = body
            .candidates
            .first()
            .map(|c| {
                c.content
                    .parts
                    .iter()
                    .map(|p| p.text.as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(Error::Upstream(
                "model returned an empty response".to_string(),
            ));
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn account(language: &str, style: &str, units: &str) -> Account {
        Account {
            id: "acct-1".to_string(),
            email: "pilot@example.com".to_string(),
            credits: 3,
            language: language.to_string(),
            style: style.to_string(),
            units: units.to_string(),
            created_at: Utc::now(),
        }
    }

    fn sample() -> ForecastSample {
        ForecastSample {
            lat: 46.5,
            lon: 8.1,
            wind_speed_kmh: 14.0,
            wind_direction_deg: 270.0,
            cloud_cover_pct: 40.0,
            cape: 850.0,
            temperature_c: 21.5,
            hourly_summary: "=== FORECAST FOR DATE: 2024-06-01 ===".to_string(),
        }
    }

    #[test]
    fn test_language_from_code_falls_back_to_english() {
        assert_eq!(Language::from_code("de"), Language::De);
        assert_eq!(Language::from_code("xx"), Language::En);
        assert_eq!(Language::from_code(""), Language::En);
    }

    #[test]
    fn test_options_request_overrides_account() {
        let account = account("de", "ridge", "metric");

        let opts = InterpretOptions::resolve(&account, Some("fr"), None, Some("imperial"));
        assert_eq!(opts.language, Language::Fr);
        assert_eq!(opts.style, "ridge");
        assert_eq!(opts.units, Units::Imperial);

        let opts = InterpretOptions::resolve(&account, None, None, None);
        assert_eq!(opts.language, Language::De);
        assert_eq!(opts.style, "ridge");
        assert_eq!(opts.units, Units::Metric);
    }

    #[test]
    fn test_single_point_prompt_style_blocks() {
        let account = account("en", "xcperfect", "metric");
        let opts = InterpretOptions::resolve(&account, None, None, None);
        let prompt = single_point_prompt(&sample(), &opts);

        assert!(prompt.contains("XC PERFECT ALERT"));
        assert!(prompt.contains("RESPONSE LANGUAGE: English"));
        assert!(prompt.contains("FORECAST FOR DATE: 2024-06-01"));

        let opts = InterpretOptions::resolve(&account, None, Some("basic"), None);
        let prompt = single_point_prompt(&sample(), &opts);
        assert!(!prompt.contains("XC PERFECT ALERT"));
        assert!(!prompt.contains("RIDGE SOARING"));
    }

    #[test]
    fn test_route_prompt_lists_every_point() {
        let account = account("tr", "basic", "metric");
        let opts = InterpretOptions::resolve(&account, None, None, None);
        let prompt = route_prompt(&[sample(), sample(), sample()], &opts);

        assert!(prompt.contains("Point 1"));
        assert!(prompt.contains("Point 3"));
        assert!(prompt.contains("Language: Turkish"));
        assert!(prompt.contains("Route Verdict"));
    }
}
