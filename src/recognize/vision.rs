//! Recognition using Google Cloud Vision's `images:annotate` REST endpoint.

use std::time::Duration;

use base64::{Engine as _, prelude::BASE64_STANDARD};
use keen_retry::{ExponentialJitter, ResolvedResult, RetryResult};
use leaky_bucket::RateLimiter;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{
    prelude::*,
    rasterize::PageImage,
    rate_limit::RateLimit,
    retry::{IsKnownTransient, retry_result_ok, try_fatal, try_potentially_transient},
};

use super::{Recognizer, TextAnnotation};

/// Public Google Cloud Vision server.
pub const DEFAULT_API_BASE: &str = "https://vision.googleapis.com";

/// How often we retry a transient failure.
const RE_ATTEMPTS: u32 = 5;

/// Random spread applied to each backoff.
const JITTER_RATIO: f64 = 0.2;

/// Never back off longer than this between two attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// The longest single backoff which keeps all of our retries' sleeping within
/// half of `deadline`, leaving the rest for the requests themselves.
fn max_backoff_within(deadline: Duration) -> Duration {
    deadline
        .div_f64(2.0 * f64::from(RE_ATTEMPTS) * (1.0 + JITTER_RATIO))
        .clamp(Duration::from_millis(1), MAX_BACKOFF)
}

/// Recognizer wrapping Google Cloud Vision's `DOCUMENT_TEXT_DETECTION`.
pub struct VisionRecognizer {
    client: reqwest::Client,
    /// Full URL of the `images:annotate` endpoint.
    endpoint: String,
    /// Sent as a header, so it never shows up in logged URLs.
    api_key: String,
    rate_limiter: RateLimiter,
    /// Upper end of our retry backoff, sized to the per-call deadline.
    max_backoff: Duration,
}

impl VisionRecognizer {
    /// Create a recognizer whose calls are expected to finish within
    /// `deadline`, retries included.
    pub fn new(
        api_base: &str,
        api_key: &str,
        rate_limit: &RateLimit,
        deadline: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}/v1/images:annotate", api_base.trim_end_matches('/')),
            api_key: api_key.to_owned(),
            rate_limiter: rate_limit.to_rate_limiter(),
            max_backoff: max_backoff_within(deadline),
        }
    }

    /// Make a single request.
    async fn annotate_once(
        &self,
        body: &Value,
    ) -> RetryResult<(), (), TextAnnotation, anyhow::Error> {
        self.rate_limiter.acquire_one().await;

        let response = try_potentially_transient!(
            self.client
                .post(&self.endpoint)
                .header("x-goog-api-key", &self.api_key)
                .json(body)
                .send()
                .await
        );
        let response = try_potentially_transient!(response.error_for_status());
        let response: AnnotateResponse = try_fatal!(response.json().await);

        let Some(image_response) = response.responses.into_iter().next() else {
            return RetryResult::Fatal {
                input: (),
                error: anyhow!("Vision returned no responses"),
            };
        };
        if let Some(status) = image_response.error {
            let transient = status.is_known_transient();
            let error = anyhow::Error::new(status);
            return if transient {
                debug!("Potentially transient error: {:?}", error);
                RetryResult::Transient { input: (), error }
            } else {
                RetryResult::Fatal { input: (), error }
            };
        }
        // Pages without any text have no annotation at all.
        retry_result_ok(image_response.full_text_annotation.unwrap_or_default())
    }
}

#[async_trait]
impl Recognizer for VisionRecognizer {
    #[instrument(level = "debug", skip_all, fields(source = %image.source.display(), page = %image.page_idx, mime = %image.mime_type))]
    async fn recognize(&self, image: &PageImage) -> Result<TextAnnotation> {
        let data = image.read().await?;
        let body = json!({
            "requests": [{
                "image": { "content": BASE64_STANDARD.encode(&data) },
                "features": [{ "type": "DOCUMENT_TEXT_DETECTION" }],
            }]
        });
        drop(data);

        let jitter = ExponentialJitter::FromBackoffRange {
            backoff_range_millis: 1..=(self.max_backoff.as_millis() as _),
            re_attempts: RE_ATTEMPTS as _,
            jitter_ratio: JITTER_RATIO as _,
        };
        let result = self
            .annotate_once(&body)
            .await
            .retry_with_async(|_| async { self.annotate_once(&body).await })
            .with_exponential_jitter(|| jitter)
            .await
            .inspect_recovered(|_, _, retry_errors_list| {
                warn!(
                    "Vision succeeded after retrying {} times (failed attempts: [{}])",
                    retry_errors_list.len(),
                    keen_retry::loggable_retry_errors(retry_errors_list)
                )
            });

        match result {
            ResolvedResult::Ok { output, .. } | ResolvedResult::Recovered { output, .. } => {
                Ok(output)
            }
            ResolvedResult::Fatal { error, .. } => Err(error),
            ResolvedResult::GivenUp { fatal_error, .. }
            | ResolvedResult::Unrecoverable { fatal_error, .. } => Err(fatal_error),
        }
    }
}

/// Body of an `images:annotate` response.
#[derive(Debug, Deserialize)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<AnnotateImageResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageResponse {
    full_text_annotation: Option<TextAnnotation>,
    error: Option<VisionStatus>,
}

/// A per-image error reported inside a successful HTTP response.
#[derive(Debug, Deserialize, thiserror::Error)]
#[error("Vision error {code}: {message}")]
struct VisionStatus {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

impl IsKnownTransient for VisionStatus {
    fn is_known_transient(&self) -> bool {
        // gRPC RESOURCE_EXHAUSTED, UNAVAILABLE and DEADLINE_EXCEEDED.
        matches!(self.code, 8 | 14 | 4)
    }
}
