use std::env;
use std::time::Duration;

use crate::error::AppError;
use crate::models::outcome::MAX_OFFER_TIMEOUT_SECS;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub jwt_secret: Option<String>,
    pub match_queue_size: usize,
    pub hub: HubConfig,
    pub dispatch: DispatchConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Frames buffered per driver before the peer is considered dead.
    pub outbound_buffer: usize,
    pub auth_timeout: Duration,
    pub liveness_timeout: Duration,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub reap_interval: Duration,
}

impl HubConfig {
    /// Two pings must fit inside one liveness window, with slack for
    /// the write deadline.
    pub fn ping_interval_for(liveness_timeout: Duration) -> Duration {
        liveness_timeout * 9 / 20
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        let liveness_timeout = Duration::from_secs(60);
        Self {
            outbound_buffer: 64,
            auth_timeout: Duration::from_secs(5),
            liveness_timeout,
            ping_interval: Self::ping_interval_for(liveness_timeout),
            write_timeout: Duration::from_secs(10),
            reap_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub offer_timeout: Duration,
    pub max_candidates: usize,
    pub search_radius_km: f64,
    pub driver_earnings_share: f64,
    pub sweep_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            offer_timeout: Duration::from_secs(120),
            max_candidates: 10,
            search_radius_km: 5.0,
            driver_earnings_share: 0.80,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill_period: Duration,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 1,
            refill_period: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 8080,
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
            jwt_secret: None,
            match_queue_size: 1024,
            hub: HubConfig::default(),
            dispatch: DispatchConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let log_format = match env::var("LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        };

        let liveness_timeout = secs_or_default("LIVENESS_TIMEOUT_SECS", 60)?;
        let hub = HubConfig {
            outbound_buffer: parse_or_default("OUTBOUND_BUFFER_SIZE", 64)?,
            auth_timeout: secs_or_default("AUTH_TIMEOUT_SECS", 5)?,
            liveness_timeout,
            ping_interval: HubConfig::ping_interval_for(liveness_timeout),
            write_timeout: secs_or_default("WRITE_TIMEOUT_SECS", 10)?,
            reap_interval: secs_or_default("REAP_INTERVAL_SECS", 30)?,
        };

        let dispatch = DispatchConfig {
            offer_timeout: secs_or_default("OFFER_TIMEOUT_SECS", 120)?,
            max_candidates: parse_or_default("MAX_CANDIDATES", 10)?,
            search_radius_km: parse_or_default("SEARCH_RADIUS_KM", 5.0)?,
            driver_earnings_share: parse_or_default("DRIVER_EARNINGS_SHARE", 0.80)?,
            ..DispatchConfig::default()
        };

        let rate_limit = RateLimitConfig {
            capacity: parse_or_default("RATE_LIMIT_CAPACITY", 1)?,
            refill_period: secs_or_default("RATE_LIMIT_REFILL_SECS", 3)?,
            idle_timeout: secs_or_default("RATE_LIMIT_IDLE_SECS", 600)?,
            ..RateLimitConfig::default()
        };

        let config = Self {
            http_port: parse_or_default("HTTP_PORT", 8080)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format,
            jwt_secret: env::var("JWT_SECRET").ok(),
            match_queue_size: parse_or_default("MATCH_QUEUE_SIZE", 1024)?,
            hub,
            dispatch,
            rate_limit,
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the background tasks cannot run with. Zero
    /// periods would panic the keepalive and sweeper intervals.
    pub fn validate(&self) -> Result<(), AppError> {
        let periods = [
            ("AUTH_TIMEOUT_SECS", self.hub.auth_timeout),
            ("LIVENESS_TIMEOUT_SECS", self.hub.ping_interval),
            ("WRITE_TIMEOUT_SECS", self.hub.write_timeout),
            ("REAP_INTERVAL_SECS", self.hub.reap_interval),
            ("OFFER_TIMEOUT_SECS", self.dispatch.offer_timeout),
            ("RATE_LIMIT_REFILL_SECS", self.rate_limit.refill_period),
            ("RATE_LIMIT_IDLE_SECS", self.rate_limit.idle_timeout),
        ];
        if let Some((key, _)) = periods.iter().find(|(_, period)| period.is_zero()) {
            return Err(AppError::Internal(format!("invalid {key}: must be > 0")));
        }

        if self.dispatch.offer_timeout > Duration::from_secs(MAX_OFFER_TIMEOUT_SECS) {
            return Err(AppError::Internal(format!(
                "invalid OFFER_TIMEOUT_SECS: must be <= {MAX_OFFER_TIMEOUT_SECS}"
            )));
        }

        if self.rate_limit.capacity == 0 {
            return Err(AppError::Internal(
                "invalid RATE_LIMIT_CAPACITY: must be > 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.dispatch.driver_earnings_share) {
            return Err(AppError::Internal(
                "invalid DRIVER_EARNINGS_SHARE: must be within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}

fn secs_or_default(key: &str, default: u64) -> Result<Duration, AppError> {
    parse_or_default(key, default).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{Config, HubConfig};
    use crate::error::AppError;

    #[test]
    fn default_ping_interval_is_27s() {
        assert_eq!(HubConfig::default().ping_interval, Duration::from_secs(27));
    }

    #[test]
    fn two_pings_fit_in_liveness_window() {
        let hub = HubConfig::default();
        assert!(hub.ping_interval * 2 < hub.liveness_timeout);
    }

    #[test]
    fn defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn zero_liveness_timeout_is_rejected() {
        let mut config = Config::default();
        config.hub.liveness_timeout = Duration::ZERO;
        config.hub.ping_interval = HubConfig::ping_interval_for(Duration::ZERO);

        match config.validate() {
            Err(AppError::Internal(msg)) => assert!(msg.contains("LIVENESS_TIMEOUT_SECS")),
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn zero_reap_interval_is_rejected() {
        let mut config = Config::default();
        config.hub.reap_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn offer_timeout_is_bounded() {
        let mut config = Config::default();
        config.dispatch.offer_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        config.dispatch.offer_timeout = Duration::from_secs(u64::MAX);
        assert!(config.validate().is_err());
    }
}
