use async_trait::async_trait;
use serde_json::{json, Value};

use super::open_meteo::{describe_weather_code, OpenMeteoClient};
use crate::tool::{Tool, ToolContext, ToolDefinition, ToolError};

/// Current weather for a city.
pub struct WeatherTool {
    client: OpenMeteoClient,
}

impl WeatherTool {
    pub fn new(client: OpenMeteoClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for WeatherTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "get_weather".to_string(),
            description: "Get the current weather for a city.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "city": {
                        "type": "string",
                        "minLength": 1,
                        "description": "City name, e.g. 'Berlin'"
                    }
                },
                "required": ["city"]
            }),
        }
    }

    async fn execute(&self, input: Value, _context: &ToolContext) -> Result<Value, ToolError> {
        let city = input
            .get("city")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidInput("missing 'city' field".to_string()))?;

        let place = self.client.geocode(city).await?;
        let forecast = self.client.forecast(&place, true).await?;
        let current = forecast.current.ok_or_else(|| {
            ToolError::ExecutionFailed("Weather service returned no current conditions".to_string())
        })?;

        Ok(json!({
            "city": place.name,
            "country": place.country,
            "temperature_c": current.temperature_2m,
            "wind_speed_kmh": current.wind_speed_10m,
            "conditions": describe_weather_code(current.weather_code),
        }))
    }
}
