mod client;
mod extract;

pub use client::AnalystClient;
pub use extract::{extract_json, extract_object};
