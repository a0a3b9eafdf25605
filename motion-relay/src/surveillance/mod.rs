//! Synology Surveillance Station Web API client.

mod client;
pub mod models;

pub use client::SurveillanceClient;
