//! Forecast lookup against weatherapi.com.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{instrument, warn};

use crate::catalog::names;
use crate::engine::{FunctionCall, ToolDeclaration};
use crate::settings::ToolsConfig;
use crate::tool::Tool;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentWeather {
    pub temperature: f64,
    pub condition: String,
    pub wind_kph: f64,
    pub precip_mm: f64,
    pub pressure_mb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastDay {
    pub date: String,
    pub avg_temp: f64,
    pub condition: String,
    pub icon_code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationInfo {
    pub country: String,
    pub region: String,
    pub lat: f64,
    pub lon: f64,
    pub localtime: String,
    pub timezone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AstroInfo {
    pub sunrise: String,
    pub sunset: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherResponse {
    pub current: CurrentWeather,
    pub forecast: Vec<ForecastDay>,
    pub location: LocationInfo,
    pub astro: AstroInfo,
}

// Wire shapes of forecast.json, reduced to what we map.

#[derive(Deserialize)]
struct ApiForecast {
    current: ApiCurrent,
    forecast: ApiForecastDays,
    location: ApiLocation,
}

#[derive(Deserialize)]
struct ApiCondition {
    text: String,
    #[serde(default)]
    icon: String,
}

#[derive(Deserialize)]
struct ApiCurrent {
    temp_c: f64,
    condition: ApiCondition,
    wind_kph: f64,
    precip_mm: f64,
    pressure_mb: f64,
}

#[derive(Deserialize)]
struct ApiForecastDays {
    forecastday: Vec<ApiForecastDay>,
}

#[derive(Deserialize)]
struct ApiForecastDay {
    date: String,
    day: ApiDay,
    astro: AstroInfo,
}

#[derive(Deserialize)]
struct ApiDay {
    avgtemp_c: f64,
    condition: ApiCondition,
}

#[derive(Deserialize)]
struct ApiLocation {
    country: String,
    region: String,
    lat: f64,
    lon: f64,
    localtime: String,
    tz_id: String,
}

impl TryFrom<ApiForecast> for WeatherResponse {
    type Error = anyhow::Error;

    fn try_from(data: ApiForecast) -> anyhow::Result<Self> {
        let astro = data
            .forecast
            .forecastday
            .first()
            .map(|d| d.astro.clone())
            .ok_or_else(|| anyhow::anyhow!("forecast contains no days"))?;

        Ok(Self {
            current: CurrentWeather {
                temperature: data.current.temp_c,
                condition: data.current.condition.text,
                wind_kph: data.current.wind_kph,
                precip_mm: data.current.precip_mm,
                pressure_mb: data.current.pressure_mb,
            },
            forecast: data
                .forecast
                .forecastday
                .into_iter()
                .map(|d| ForecastDay {
                    date: d.date,
                    avg_temp: d.day.avgtemp_c,
                    icon_code: d
                        .day
                        .condition
                        .icon
                        .rsplit('/')
                        .next()
                        .unwrap_or_default()
                        .to_string(),
                    condition: d.day.condition.text,
                })
                .collect(),
            location: LocationInfo {
                country: data.location.country,
                region: data.location.region,
                lat: data.location.lat,
                lon: data.location.lon,
                localtime: data.location.localtime,
                timezone: data.location.tz_id,
            },
            astro,
        })
    }
}

pub struct WeatherTool {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    days: u8,
}

impl WeatherTool {
    /// `None` when no weather API key is configured.
    pub fn from_config(config: &ToolsConfig) -> Option<Self> {
        let api_key = config.weather_api_key.clone()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Some(Self {
            client,
            api_key,
            base_url: config.weather_base_url.trim_end_matches('/').to_string(),
            days: config.forecast_days,
        })
    }

    #[instrument(skip(self))]
    pub async fn forecast(&self, location: &str) -> anyhow::Result<WeatherResponse> {
        let days = self.days.to_string();
        let response = self
            .client
            .get(format!("{}/forecast.json", self.base_url))
            .query(&[
                ("key", self.api_key.as_str()),
                ("q", location),
                ("days", days.as_str()),
                ("aqi", "yes"),
                ("alerts", "yes"),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("{} Error: {}", status.as_u16(), body));
        }

        let data: ApiForecast = response.json().await?;
        WeatherResponse::try_from(data)
    }
}

#[async_trait]
impl Tool for WeatherTool {
    fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration::new(
            names::tools::WEATHER,
            "Returns current weather and a multi-day forecast for a location.",
        )
        .param("location", "Town, district or city, e.g. Hubli")
    }

    async fn call(&self, call: &FunctionCall) -> String {
        let Some(location) = call.arg_str("location") else {
            return json!({ "error": "location is required" }).to_string();
        };
        match self.forecast(location).await {
            Ok(weather) => json!(weather).to_string(),
            Err(e) => {
                warn!("Weather lookup for '{}' failed: {}", location, e);
                json!({ "error": e.to_string() }).to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "location": {"country": "India", "region": "Karnataka", "lat": 15.35, "lon": 75.13,
                     "localtime": "2026-07-01 10:00", "tz_id": "Asia/Kolkata"},
        "current": {"temp_c": 27.5, "condition": {"text": "Light rain"}, "wind_kph": 12.0,
                    "precip_mm": 1.2, "pressure_mb": 1008.0},
        "forecast": {"forecastday": [
            {"date": "2026-07-01",
             "day": {"avgtemp_c": 26.1, "condition": {"text": "Patchy rain", "icon": "//cdn.weatherapi.com/weather/64x64/day/176.png"}},
             "astro": {"sunrise": "06:05 AM", "sunset": "07:02 PM"}}
        ]}
    }"#;

    #[test]
    fn maps_forecast_payload() {
        let data: ApiForecast = serde_json::from_str(SAMPLE).unwrap();
        let weather = WeatherResponse::try_from(data).unwrap();
        assert_eq!(weather.current.condition, "Light rain");
        assert_eq!(weather.forecast[0].icon_code, "176.png");
        assert_eq!(weather.location.timezone, "Asia/Kolkata");
        assert_eq!(weather.astro.sunrise, "06:05 AM");
    }

    #[test]
    fn not_registered_without_a_key() {
        assert!(WeatherTool::from_config(&ToolsConfig::default()).is_none());
    }
}
