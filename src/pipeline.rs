//! Report pipeline orchestration.
//!
//! Every paid operation follows the same shape: validate the request, reserve
//! credits up front, do the expensive work, and refund the reservation if the
//! work fails before producing its artifact. The ledger is the source of
//! truth; the pipeline never adjusts a balance without going through it.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::email::{self, EmailAttachment, Mailer};
use crate::error::{Error, Result};
use crate::forecast::{ForecastProvider, ForecastSample, MeteogramSource};
use crate::interpret::{self, InterpretOptions, Interpreter};
use crate::jobs::JobRunner;
use crate::metrics;
use crate::rate_limit::SlidingWindow;
use crate::storage::{SqliteStorage, INTERPRETATION_COST};

/// Maximum number of route points sent to the model; longer routes are
/// down-sampled before pricing.
pub const MAX_ROUTE_POINTS: usize = 10;

/// A requested location.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Point {
    pub lat: f64,
    pub lon: f64,
    /// Altitude above sea level in meters, used for the meteogram.
    #[serde(default)]
    pub asl: f64,
}

impl Point {
    fn validate(&self) -> Result<()> {
        if !(-90.0..=90.0).contains(&self.lat) {
            return Err(Error::Validation(format!("invalid latitude: {}", self.lat)));
        }
        if !(-180.0..=180.0).contains(&self.lon) {
            return Err(Error::Validation(format!("invalid longitude: {}", self.lon)));
        }
        Ok(())
    }
}

/// Per-request overrides for the interpretation options.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestOptions {
    pub language: Option<String>,
    pub style: Option<String>,
    pub units: Option<String>,
}

/// Result of a synchronous interpretation.
#[derive(Debug, Clone, Serialize)]
pub struct InterpretOutcome {
    pub interpretation: String,
    pub report_id: String,
    pub remaining_credits: i64,
}

/// Result of a route interpretation.
#[derive(Debug, Clone, Serialize)]
pub struct RouteOutcome {
    pub interpretation: String,
    pub report_id: String,
    pub points_analyzed: usize,
    pub points_charged: usize,
    pub remaining_credits: i64,
}

/// Acknowledgement returned by the asynchronous email path.
#[derive(Debug, Clone, Serialize)]
pub struct EmailAck {
    pub message: String,
    pub remaining_credits: i64,
}

/// Down-sample a route of `len` points to at most `max`, always keeping the
/// first and last point and preserving order.
pub fn sample_route_indices(len: usize, max: usize) -> Vec<usize> {
    if len <= max || max < 2 {
        return (0..len).collect();
    }
    let mut indices: Vec<usize> = (0..max).map(|i| i * (len - 1) / (max - 1)).collect();
    indices.dedup();
    indices
}

/// Orchestrates the credit ledger, rate limiter, job runner, and upstream
/// collaborators into the paid report operations.
#[derive(Clone)]
pub struct ReportPipeline {
    storage: SqliteStorage,
    email_limiter: Arc<SlidingWindow>,
    jobs: JobRunner,
    forecast: Arc<dyn ForecastProvider>,
    interpreter: Arc<dyn Interpreter>,
    mailer: Arc<dyn Mailer>,
    meteograms: Arc<dyn MeteogramSource>,
}

impl ReportPipeline {
    pub fn new(
        storage: SqliteStorage,
        email_limiter: Arc<SlidingWindow>,
        jobs: JobRunner,
        forecast: Arc<dyn ForecastProvider>,
        interpreter: Arc<dyn Interpreter>,
        mailer: Arc<dyn Mailer>,
        meteograms: Arc<dyn MeteogramSource>,
    ) -> Self {
        Self {
            storage,
            email_limiter,
            jobs,
            forecast,
            interpreter,
            mailer,
            meteograms,
        }
    }

    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    pub fn job_runner(&self) -> &JobRunner {
        &self.jobs
    }

    /// Generate a single-location report and wait for the result.
    ///
    /// Reserves one credit before the upstream calls; any failure after the
    /// reservation refunds it. The report is persisted only when generation
    /// succeeds.
    pub async fn interpret_sync(
        &self,
        account_id: &str,
        point: Point,
        options: RequestOptions,
    ) -> Result<InterpretOutcome> {
        point.validate()?;
        let account = self
            .storage
            .get_account(account_id)
            .await?
            .ok_or_else(|| Error::AccountNotFound(account_id.to_string()))?;
        let resolved = InterpretOptions::resolve(
            &account,
            options.language.as_deref(),
            options.style.as_deref(),
            options.units.as_deref(),
        );

        let remaining = self
            .storage
            .reserve_credits(
                account_id,
                INTERPRETATION_COST,
                &format!("AI interpretation for {},{}", point.lat, point.lon),
            )
            .await?;

        let started = Instant::now();
        match self.generate_single(point, &resolved).await {
            Ok(text) => {
                let report = self
                    .storage
                    .save_report(account_id, point.lat, point.lon, &text)
                    .await?;
                metrics::record_report("single", "ok");
                metrics::record_report_duration(started.elapsed(), "single");
                info!(account = account_id, report = %report.id, "Report generated");
                Ok(InterpretOutcome {
                    interpretation: text,
                    report_id: report.id,
                    remaining_credits: remaining,
                })
            }
            Err(e) => {
                metrics::record_report("single", "failed");
                let remaining = self
                    .refund(account_id, INTERPRETATION_COST, "interpretation failed")
                    .await;
                warn!(account = account_id, error = %e, remaining, "Report failed, reservation refunded");
                Err(e)
            }
        }
    }

    async fn generate_single(&self, point: Point, options: &InterpretOptions) -> Result<String> {
        let sample = self.forecast.fetch(point.lat, point.lon).await?;
        // The meteogram is the primary source for thermal analysis; without
        // it the single-point report is not worth charging for.
        let meteogram = self
            .meteograms
            .fetch_png(point.lat, point.lon, point.asl)
            .await?;
        let prompt = interpret::single_point_prompt(&sample, options);
        self.interpreter.generate(&prompt, Some(&meteogram)).await
    }

    /// Generate a multi-point route report.
    ///
    /// Long routes are down-sampled to `MAX_ROUTE_POINTS` before pricing, so
    /// the account is charged one credit per analyzed point, not per
    /// submitted point. Individual failed point fetches are skipped; the
    /// operation fails (with a full refund) only when every point fails or
    /// generation fails.
    pub async fn interpret_route(
        &self,
        account_id: &str,
        route: &[Point],
        options: RequestOptions,
    ) -> Result<RouteOutcome> {
        if route.len() < 2 {
            return Err(Error::Validation(
                "route must contain at least 2 points".to_string(),
            ));
        }
        for point in route {
            point.validate()?;
        }
        let account = self
            .storage
            .get_account(account_id)
            .await?
            .ok_or_else(|| Error::AccountNotFound(account_id.to_string()))?;
        let resolved = InterpretOptions::resolve(
            &account,
            options.language.as_deref(),
            options.style.as_deref(),
            options.units.as_deref(),
        );

        let indices = sample_route_indices(route.len(), MAX_ROUTE_POINTS);
        let sampled: Vec<Point> = indices.iter().map(|&i| route[i]).collect();
        let cost = sampled.len() as i64 * INTERPRETATION_COST;

        let remaining = self
            .storage
            .reserve_credits(
                account_id,
                cost,
                &format!("Route analysis ({} points)", sampled.len()),
            )
            .await?;

        let started = Instant::now();
        match self.generate_route(&sampled, &resolved).await {
            Ok((text, analyzed)) => {
                let content = format!("**Route Analysis:**\n\n{}", text);
                let report = self
                    .storage
                    .save_report(account_id, sampled[0].lat, sampled[0].lon, &content)
                    .await?;
                metrics::record_report("route", "ok");
                metrics::record_report_duration(started.elapsed(), "route");
                info!(
                    account = account_id,
                    report = %report.id,
                    analyzed,
                    charged = sampled.len(),
                    "Route report generated"
                );
                Ok(RouteOutcome {
                    interpretation: text,
                    report_id: report.id,
                    points_analyzed: analyzed,
                    points_charged: sampled.len(),
                    remaining_credits: remaining,
                })
            }
            Err(e) => {
                metrics::record_report("route", "failed");
                let remaining = self
                    .refund(account_id, cost, "route analysis failed")
                    .await;
                warn!(account = account_id, error = %e, remaining, "Route report failed, reservation refunded");
                Err(e)
            }
        }
    }

    async fn generate_route(
        &self,
        sampled: &[Point],
        options: &InterpretOptions,
    ) -> Result<(String, usize)> {
        let mut samples: Vec<ForecastSample> = Vec::with_capacity(sampled.len());
        for point in sampled {
            match self.forecast.fetch(point.lat, point.lon).await {
                Ok(sample) => samples.push(sample),
                Err(e) => {
                    warn!(lat = point.lat, lon = point.lon, error = %e, "Skipping route point");
                }
            }
        }
        if samples.is_empty() {
            return Err(Error::Upstream(
                "failed to fetch weather data for any point in the route".to_string(),
            ));
        }

        let prompt = interpret::route_prompt(&samples, options);
        let text = self.interpreter.generate(&prompt, None).await?;
        Ok((text, samples.len()))
    }

    /// Generate a report in the background and email it to `recipient`.
    ///
    /// Returns as soon as the job is queued. The rate limiter is consulted
    /// before the reservation, so a throttled request costs nothing. If the
    /// background job fails at any stage, it refunds the reservation itself;
    /// no report is persisted by this path.
    pub async fn interpret_async_with_email(
        &self,
        account_id: &str,
        point: Point,
        recipient: &str,
        options: RequestOptions,
    ) -> Result<EmailAck> {
        point.validate()?;
        if !recipient.contains('@') {
            return Err(Error::Validation(format!(
                "invalid recipient address: {}",
                recipient
            )));
        }
        let account = self
            .storage
            .get_account(account_id)
            .await?
            .ok_or_else(|| Error::AccountNotFound(account_id.to_string()))?;
        let resolved = InterpretOptions::resolve(
            &account,
            options.language.as_deref(),
            options.style.as_deref(),
            options.units.as_deref(),
        );

        if !self.email_limiter.allow(account_id) {
            metrics::record_rate_limited("email");
            let retry_after = self
                .email_limiter
                .retry_after(account_id)
                .unwrap_or_default();
            return Err(Error::RateLimited { retry_after });
        }
        self.email_limiter.sweep();

        let remaining = self
            .storage
            .reserve_credits(
                account_id,
                INTERPRETATION_COST,
                &format!("Emailed report for {},{}", point.lat, point.lon),
            )
            .await?;

        // The job owns everything it needs; nothing borrows from this call.
        let pipeline = self.clone();
        let job_account = account_id.to_string();
        let recipient = recipient.to_string();
        let accepted = self.jobs.submit("report-email", async move {
            pipeline
                .run_email_job(&job_account, point, &recipient, &resolved)
                .await
        });

        if !accepted {
            let remaining = self
                .refund(account_id, INTERPRETATION_COST, "service shutting down")
                .await;
            return Err(Error::Validation(format!(
                "service is shutting down, report not queued (credits: {})",
                remaining
            )));
        }

        Ok(EmailAck {
            message: "Report queued; it will be emailed when ready.".to_string(),
            remaining_credits: remaining,
        })
    }

    async fn run_email_job(
        &self,
        account_id: &str,
        point: Point,
        recipient: &str,
        options: &InterpretOptions,
    ) -> Result<()> {
        let started = Instant::now();
        let result = async {
            let sample = self.forecast.fetch(point.lat, point.lon).await?;
            let meteogram = self
                .meteograms
                .fetch_png(point.lat, point.lon, point.asl)
                .await?;
            let prompt = interpret::single_point_prompt(&sample, options);
            let text = self.interpreter.generate(&prompt, Some(&meteogram)).await?;

            // Attachment reuses the bytes already fetched for generation.
            let message = email::report_email(
                recipient,
                point.lat,
                point.lon,
                &text,
                Some(EmailAttachment::meteogram(&meteogram)),
            );
            self.mailer.send(&message).await
        }
        .await;

        match result {
            Ok(()) => {
                metrics::record_report("email", "ok");
                metrics::record_report_duration(started.elapsed(), "email");
                Ok(())
            }
            Err(e) => {
                metrics::record_report("email", "failed");
                let remaining = self
                    .refund(account_id, INTERPRETATION_COST, "emailed report failed")
                    .await;
                warn!(account = account_id, error = %e, remaining, "Email job failed, reservation refunded");
                Err(e)
            }
        }
    }

    /// Refund a reservation, logging instead of failing when the refund
    /// itself cannot be written. Returns the balance after the attempt.
    async fn refund(&self, account_id: &str, cost: i64, reason: &str) -> i64 {
        match self
            .storage
            .refund_credits(account_id, cost, &format!("Refund: {}", reason))
            .await
        {
            Ok(balance) => balance,
            Err(e) => {
                error!(account = account_id, cost, error = %e, "Refund failed");
                self.storage.balance(account_id).await.unwrap_or(-1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_routes_keep_every_point() {
        assert_eq!(sample_route_indices(2, 10), vec![0, 1]);
        assert_eq!(
            sample_route_indices(10, 10),
            (0..10).collect::<Vec<usize>>()
        );
    }

    #[test]
    fn test_long_routes_keep_endpoints_and_order() {
        let indices = sample_route_indices(15, 10);
        assert_eq!(indices.len(), 10);
        assert_eq!(indices.first(), Some(&0));
        assert_eq!(indices.last(), Some(&14));
        assert!(indices.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_sampling_is_deterministic() {
        assert_eq!(sample_route_indices(15, 10), sample_route_indices(15, 10));
        assert_eq!(
            sample_route_indices(15, 10),
            vec![0, 1, 3, 4, 6, 7, 9, 10, 12, 14]
        );
    }

    #[test]
    fn test_huge_route_samples_down() {
        let indices = sample_route_indices(1000, 10);
        assert_eq!(indices.len(), 10);
        assert_eq!(indices.last(), Some(&999));
    }

    #[test]
    fn test_point_validation() {
        assert!(Point { lat: 46.5, lon: 8.1, asl: 1200.0 }.validate().is_ok());
        assert!(Point { lat: 91.0, lon: 8.1, asl: 0.0 }.validate().is_err());
        assert!(Point { lat: 46.5, lon: -181.0, asl: 0.0 }.validate().is_err());
    }
}
