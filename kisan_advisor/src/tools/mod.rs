//! Plain lookup tools that do not go through an LLM.

pub mod calendar;
pub mod weather;

pub use calendar::CropCalendar;
pub use weather::{WeatherResponse, WeatherTool};
