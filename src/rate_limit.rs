//! Request rate limits for remote recognition services, written as `10/s` or
//! `1800/m`.

use std::{fmt, str::FromStr, time::Duration};

use leaky_bucket::RateLimiter;

use crate::prelude::*;

/// The period a [`RateLimit`] is measured over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitPeriod {
    Second,
    Minute,
}

impl RateLimitPeriod {
    pub fn to_duration(self) -> Duration {
        match self {
            RateLimitPeriod::Second => Duration::from_secs(1),
            RateLimitPeriod::Minute => Duration::from_secs(60),
        }
    }
}

impl fmt::Display for RateLimitPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitPeriod::Second => write!(f, "s"),
            RateLimitPeriod::Minute => write!(f, "m"),
        }
    }
}

impl FromStr for RateLimitPeriod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "s" => Ok(RateLimitPeriod::Second),
            "m" => Ok(RateLimitPeriod::Minute),
            _ => Err(anyhow!("Unsupported rate limit period: {:?}", s)),
        }
    }
}

/// A maximum number of requests per period.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimit {
    pub max_requests: usize,
    pub per_period: RateLimitPeriod,
}

impl RateLimit {
    /// Build a [`RateLimiter`] enforcing this limit.
    ///
    /// The bucket starts full, so a fresh process may burst up to
    /// `max_requests` before being throttled.
    pub fn to_rate_limiter(&self) -> RateLimiter {
        let max = self.max_requests.max(1);
        RateLimiter::builder()
            .initial(max)
            .refill(max)
            .max(max)
            .interval(self.per_period.to_duration())
            .build()
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.max_requests, self.per_period)
    }
}

impl FromStr for RateLimit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parse = || -> Result<Self> {
            let (max_requests, per_period) = s
                .split_once('/')
                .ok_or_else(|| anyhow!("expected <count>/<period>"))?;
            let max_requests = max_requests.trim().parse::<usize>()?;
            if max_requests == 0 {
                return Err(anyhow!("rate limit must allow at least one request"));
            }
            Ok(Self {
                max_requests,
                per_period: per_period.trim().parse()?,
            })
        };
        parse().with_context(|| format!("Failed to parse rate limit: {:?}", s))
    }
}
