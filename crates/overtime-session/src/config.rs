//! Session configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};

/// Default timeout applied to every request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default interval between presence pings.
pub const DEFAULT_PRESENCE_INTERVAL: Duration = Duration::from_secs(30);

/// API environment the session talks to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Production,
    Staging,
    Development,
    /// Any other host, always stored with a trailing `/`.
    Custom(String),
}

impl Environment {
    /// Build a custom environment from a host URL.
    pub fn custom(host: impl Into<String>) -> Self {
        let mut host = host.into();
        if !host.ends_with('/') {
            host.push('/');
        }
        Environment::Custom(host)
    }

    /// Base URL that relative request paths are appended to.
    pub fn host_url(&self) -> &str {
        match self {
            Environment::Production | Environment::Development => "https://api.itsovertime.com/",
            Environment::Staging => "https://stg-api.itsovertime.com/",
            Environment::Custom(host) => host,
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Production => write!(f, "production"),
            Environment::Staging => write!(f, "staging"),
            Environment::Development => write!(f, "development"),
            Environment::Custom(host) => write!(f, "{}", host),
        }
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "staging" | "stg" => Ok(Environment::Staging),
            "development" | "dev" => Ok(Environment::Development),
            _ if s.starts_with("http://") || s.starts_with("https://") => {
                Ok(Environment::custom(s))
            }
            _ => Err(format!(
                "invalid environment '{}', expected production/staging/development or a URL",
                s
            )),
        }
    }
}

/// Identity of the host application, sent with presence pings and used for
/// build gating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInfo {
    pub display_name: String,
    pub version: String,
    pub build_number: u32,
    pub bundle_id: String,
}

impl AppInfo {
    /// Human-readable application label, e.g. `Overtime (2.1.0.341)`.
    pub fn application_name(&self) -> String {
        format!("{} ({}.{})", self.display_name, self.version, self.build_number)
    }
}

impl Default for AppInfo {
    fn default() -> Self {
        Self {
            display_name: "Unknown Overtime Application".to_string(),
            version: "Unknown Version".to_string(),
            build_number: 0,
            bundle_id: String::new(),
        }
    }
}

/// Retry policy for transient authentication failures.
///
/// Intervals grow exponentially with jitter. With `max_elapsed_time` unset the
/// loop only ends on success, on an explicit rejection, or on shutdown.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    pub randomization_factor: f64,
    pub max_elapsed_time: Option<Duration>,
}

impl RetryPolicy {
    /// Fresh backoff state for one retry loop.
    pub(crate) fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_multiplier(self.multiplier)
            .with_randomization_factor(self.randomization_factor)
            .with_max_elapsed_time(self.max_elapsed_time)
            .build()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
            randomization_factor: 0.5,
            max_elapsed_time: None,
        }
    }
}

/// Configuration for a [`SessionManager`](crate::SessionManager).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub environment: Environment,
    /// Only meaningful when anonymous login is disallowed.
    pub allow_offline_mode: bool,
    pub allow_anonymous_login: bool,
    pub app: AppInfo,
    pub request_timeout: Duration,
    pub presence_interval: Duration,
    pub retry: RetryPolicy,
}

impl SessionConfig {
    /// Create a configuration for the given environment with defaults.
    pub fn new(environment: Environment) -> Self {
        Self {
            environment,
            ..Default::default()
        }
    }

    pub fn with_offline_mode(mut self, allow: bool) -> Self {
        self.allow_offline_mode = allow;
        self
    }

    pub fn with_anonymous_login(mut self, allow: bool) -> Self {
        self.allow_anonymous_login = allow;
        self
    }

    pub fn with_app(mut self, app: AppInfo) -> Self {
        self.app = app;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_presence_interval(mut self, interval: Duration) -> Self {
        self.presence_interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            allow_offline_mode: false,
            allow_anonymous_login: true,
            app: AppInfo::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            presence_interval: DEFAULT_PRESENCE_INTERVAL,
            retry: RetryPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_hosts() {
        assert_eq!(
            Environment::Production.host_url(),
            "https://api.itsovertime.com/"
        );
        assert_eq!(
            Environment::Development.host_url(),
            "https://api.itsovertime.com/"
        );
        assert_eq!(
            Environment::Staging.host_url(),
            "https://stg-api.itsovertime.com/"
        );
    }

    #[test]
    fn test_custom_environment_adds_trailing_slash() {
        let env = Environment::custom("http://127.0.0.1:8080");
        assert_eq!(env.host_url(), "http://127.0.0.1:8080/");

        let env = Environment::custom("http://127.0.0.1:8080/");
        assert_eq!(env.host_url(), "http://127.0.0.1:8080/");
    }

    #[test]
    fn test_environment_from_str() {
        assert_eq!("staging".parse::<Environment>(), Ok(Environment::Staging));
        assert_eq!("PROD".parse::<Environment>(), Ok(Environment::Production));
        assert_eq!(
            "http://localhost:3000".parse::<Environment>(),
            Ok(Environment::custom("http://localhost:3000"))
        );
        assert!("moon".parse::<Environment>().is_err());
    }

    #[test]
    fn test_application_name() {
        let app = AppInfo {
            display_name: "Overtime".to_string(),
            version: "2.1.0".to_string(),
            build_number: 341,
            bundle_id: "tv.overtime.app".to_string(),
        };
        assert_eq!(app.application_name(), "Overtime (2.1.0.341)");
    }

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert!(config.allow_anonymous_login);
        assert!(!config.allow_offline_mode);
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.presence_interval, Duration::from_secs(30));
        assert_eq!(config.retry.max_elapsed_time, None);
    }
}
