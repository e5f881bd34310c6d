//! Built-in tool implementations for the chat agent.
//!
//! - `calculate`: arithmetic, gated on operand magnitude
//! - `get_weather`, `get_local_time`: Open-Meteo backed lookups
//! - `FnTool`: closure-backed tool for ad-hoc registrations

pub mod calculate;
pub mod fn_tool;
pub mod local_time;
pub mod open_meteo;
pub mod weather;

#[cfg(test)]
pub(crate) mod test_server;

pub use calculate::CalculateTool;
pub use fn_tool::FnTool;
pub use local_time::LocalTimeTool;
pub use open_meteo::OpenMeteoClient;
pub use weather::WeatherTool;
