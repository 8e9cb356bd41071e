//! Tracing configuration and initialization.

use tracing_subscriber::{
    EnvFilter,
    fmt::format::FmtSpan,
    layer::SubscriberExt as _,
    util::{SubscriberInitExt as _, TryInitError},
};

/// Environment variable holding the log filter.
pub const LOG_ENV: &str = "INOCACHE_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrcMode {
    /// One line per event, no timestamps.
    Compact,
    /// Full events plus span close timings.
    Verbose,
    /// Output captured by the test harness.
    Test,
}

/// Tracing subscriber builder for hosts embedding the cache.
#[derive(Debug)]
pub struct Trc {
    mode: TrcMode,
    env_filter: EnvFilter,
}

impl Default for Trc {
    fn default() -> Self {
        let maybe_env_filter =
            EnvFilter::try_from_env(LOG_ENV).or_else(|_| EnvFilter::try_from_default_env());

        match maybe_env_filter {
            // An explicit filter usually means someone is debugging, so show everything.
            Ok(env_filter) => Self {
                mode: TrcMode::Verbose,
                env_filter,
            },
            Err(_) => Self {
                mode: TrcMode::Compact,
                env_filter: EnvFilter::new("info"),
            },
        }
    }
}

impl Trc {
    /// Route output through the libtest capture writer.
    #[must_use]
    pub fn for_tests() -> Self {
        Self {
            mode: TrcMode::Test,
            ..Self::default()
        }
    }

    /// Force the verbose format.
    #[must_use]
    pub fn verbose(mut self) -> Self {
        self.mode = TrcMode::Verbose;
        self
    }

    /// Replace the filter directive.
    #[must_use]
    pub fn with_filter(mut self, directive: &str) -> Self {
        self.env_filter = EnvFilter::new(directive);
        self
    }

    /// Install the subscriber globally.
    ///
    /// Fails if a global subscriber is already set.
    pub fn init(self) -> Result<(), TryInitError> {
        match self.mode {
            TrcMode::Compact => tracing_subscriber::registry()
                .with(self.env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .without_time()
                        .compact(),
                )
                .try_init(),
            TrcMode::Verbose => tracing_subscriber::registry()
                .with(self.env_filter)
                .with(tracing_subscriber::fmt::layer().with_span_events(FmtSpan::CLOSE))
                .try_init(),
            TrcMode::Test => tracing_subscriber::registry()
                .with(self.env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_test_writer()
                        .with_span_events(FmtSpan::CLOSE),
                )
                .try_init(),
        }
    }
}
