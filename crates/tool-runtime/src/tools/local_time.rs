use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use serde_json::{json, Value};

use super::open_meteo::OpenMeteoClient;
use crate::tool::{Tool, ToolContext, ToolDefinition, ToolError};

/// Current local time at a location, resolved through the location's UTC offset.
pub struct LocalTimeTool {
    client: OpenMeteoClient,
}

impl LocalTimeTool {
    pub fn new(client: OpenMeteoClient) -> Self {
        Self { client }
    }
}

/// Shift `now` into the zone `offset_seconds` east of UTC.
pub fn local_time_at(now: DateTime<Utc>, offset_seconds: i32) -> Result<DateTime<FixedOffset>, ToolError> {
    let offset = FixedOffset::east_opt(offset_seconds).ok_or_else(|| {
        ToolError::ExecutionFailed(format!("Invalid UTC offset: {offset_seconds}s"))
    })?;
    Ok(now.with_timezone(&offset))
}

#[async_trait]
impl Tool for LocalTimeTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "get_local_time".to_string(),
            description: "Get the current local time for a location.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "location": {
                        "type": "string",
                        "minLength": 1,
                        "description": "City or place name"
                    }
                },
                "required": ["location"]
            }),
        }
    }

    async fn execute(&self, input: Value, _context: &ToolContext) -> Result<Value, ToolError> {
        let location = input
            .get("location")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidInput("missing 'location' field".to_string()))?;

        let place = self.client.geocode(location).await?;
        let forecast = self.client.forecast(&place, false).await?;
        let local = local_time_at(Utc::now(), forecast.utc_offset_seconds)?;

        Ok(json!({
            "location": place.name,
            "timezone": forecast.timezone,
            "local_time": local.to_rfc3339_opts(SecondsFormat::Secs, false),
        }))
    }
}
