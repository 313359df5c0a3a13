//! thermalcast - credit-metered AI flight-condition reports
//!
//! thermalcast generates AI-written interpretations of paragliding weather
//! for a location or a route, paid for in account credits. The interesting
//! part is the pipeline around the AI call, not the AI call itself:
//!
//! - **Credit ledger**: credits are atomically reserved before any expensive
//!   upstream call and refunded when the work fails, with an append-only
//!   transaction row written alongside every balance change.
//! - **Rate limiter**: a per-account sliding window gates the email delivery
//!   path (side effects are easy to spam, forecasts are not).
//! - **Job runner**: email reports run off the request on spawned tasks;
//!   failures are caught at the job boundary, logged, and refunded.
//! - **Report pipeline**: orchestrates reserve -> fetch -> generate ->
//!   commit-or-refund so no request is ever left permanently charged.
//!
//! Forecast data (Open-Meteo), interpretation (Gemini), meteogram images
//! (Meteoblue) and delivery (Brevo) are external collaborators behind
//! traits; everything else is in-process with SQLite as the ledger.

pub mod api;
pub mod config;
pub mod email;
pub mod error;
pub mod forecast;
pub mod interpret;
pub mod jobs;
pub mod metrics;
pub mod pipeline;
pub mod rate_limit;
pub mod storage;

pub use error::{Error, Result};
