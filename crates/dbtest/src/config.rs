use std::env;
use std::time::Duration;

use tracing::warn;

/// What the monitor does when a server process dies without being asked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrashPolicy {
    /// Log the captured output and poison the driver: every later operation
    /// returns [`crate::DriverError::Crashed`].
    #[default]
    Report,
    /// Log as for `Report`, then abort the whole test process.
    Abort,
}

impl CrashPolicy {
    /// Parse the `DBTEST_CRASH_POLICY` spelling (`report` or `abort`).
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "report" => Some(Self::Report),
            "abort" => Some(Self::Abort),
            _ => None,
        }
    }
}

/// Operational parameters handed to a driver before it starts.
///
/// Immutable once a driver has been started with it. Timeouts must be
/// non-zero; zero is not rejected here and makes every bounded wait fail
/// immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Upper bound for establishing the first client connection.
    pub connect_timeout: Duration,
    /// Grace period `stop()` waits for the server process to exit.
    pub stop_timeout: Duration,
    /// Reaction to an unexpected server exit.
    pub crash_policy: CrashPolicy,
}

impl Config {
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

    pub const CONNECT_TIMEOUT_ENV: &str = "DBTEST_CONNECT_TIMEOUT_SECS";
    pub const STOP_TIMEOUT_ENV: &str = "DBTEST_STOP_TIMEOUT_SECS";
    pub const CRASH_POLICY_ENV: &str = "DBTEST_CRASH_POLICY";

    /// Build a config with an explicit connect timeout and default
    /// everything else.
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            stop_timeout: Self::DEFAULT_STOP_TIMEOUT,
            crash_policy: CrashPolicy::default(),
        }
    }

    /// Build a config from the environment.
    ///
    /// Priority: `DBTEST_*` env vars, then the compile-time defaults.
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same resolution as [`Config::from_env`] with an injectable lookup.
    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(secs) = lookup(Self::CONNECT_TIMEOUT_ENV)
            .and_then(|v| parse_secs(Self::CONNECT_TIMEOUT_ENV, &v))
        {
            config.connect_timeout = secs;
        }
        if let Some(secs) =
            lookup(Self::STOP_TIMEOUT_ENV).and_then(|v| parse_secs(Self::STOP_TIMEOUT_ENV, &v))
        {
            config.stop_timeout = secs;
        }
        if let Some(raw) = lookup(Self::CRASH_POLICY_ENV) {
            match CrashPolicy::parse(&raw) {
                Some(policy) => config.crash_policy = policy,
                None => warn!(
                    var = Self::CRASH_POLICY_ENV,
                    value = %raw,
                    "ignoring unknown crash policy (expected \"report\" or \"abort\")"
                ),
            }
        }

        config
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_crash_policy(mut self, policy: CrashPolicy) -> Self {
        self.crash_policy = policy;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CONNECT_TIMEOUT)
    }
}

fn parse_secs(var: &str, value: &str) -> Option<Duration> {
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
        _ => {
            warn!(var, value, "ignoring invalid timeout (expected positive seconds)");
            None
        }
    }
}
