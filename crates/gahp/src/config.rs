use std::{collections::BTreeMap, path::PathBuf, time::Duration};

/// Tuning knobs for helper processes and the request multiplexer.
///
/// Build one with [`GahpConfig::builder`] and hand it to
/// [`crate::GahpRegistry::new`]; every helper checked out of that registry
/// shares the same configuration.
#[derive(Debug, Clone)]
pub struct GahpConfig {
    pub(crate) max_pending_requests: usize,
    pub(crate) response_timeout: Duration,
    pub(crate) poll_interval: Duration,
    pub(crate) async_poll_stretch: u32,
    pub(crate) blocking_poll_interval: Duration,
    pub(crate) teardown_grace: Duration,
    pub(crate) credential_check_interval: Duration,
    pub(crate) use_response_prefix: bool,
    pub(crate) scratch_dir: Option<PathBuf>,
    pub(crate) env_passthrough: Vec<String>,
    pub(crate) extra_env: BTreeMap<String, String>,
}

impl Default for GahpConfig {
    fn default() -> Self {
        Self {
            max_pending_requests: 50,
            response_timeout: Duration::from_secs(20),
            poll_interval: Duration::from_secs(5),
            // Even with async notification negotiated we still poll, just
            // rarely, in case a notification is lost in the pipe.
            async_poll_stretch: 12,
            blocking_poll_interval: Duration::from_secs(1),
            teardown_grace: Duration::from_secs(60),
            credential_check_interval: Duration::from_secs(60),
            use_response_prefix: true,
            scratch_dir: None,
            env_passthrough: vec!["PATH".to_string()],
            extra_env: BTreeMap::new(),
        }
    }
}

impl GahpConfig {
    pub fn builder() -> GahpConfigBuilder {
        GahpConfigBuilder::default()
    }
}

/// Builder for [`GahpConfig`].
#[derive(Debug, Clone, Default)]
pub struct GahpConfigBuilder {
    config: GahpConfig,
}

impl GahpConfigBuilder {
    /// Cap on simultaneously in-flight requests per helper (default 50).
    pub fn max_pending_requests(mut self, max: usize) -> Self {
        self.config.max_pending_requests = max.max(1);
        self
    }

    /// How long to wait for any byte of a synchronous reply before declaring
    /// the helper wedged (default 20s).
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_timeout = timeout;
        self
    }

    /// Fallback polling interval when the helper lacks async notification
    /// (default 5s).
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// With async notification negotiated, only every Nth timer tick runs
    /// the safety-net poll (default 12).
    pub fn async_poll_stretch(mut self, stretch: u32) -> Self {
        self.config.async_poll_stretch = stretch.max(1);
        self
    }

    /// Sleep between re-polls in a blocking-mode wait (default 1s).
    pub fn blocking_poll_interval(mut self, interval: Duration) -> Self {
        self.config.blocking_poll_interval = interval;
        self
    }

    /// How long an unreferenced helper process lingers before teardown, so
    /// short-lived sessions do not thrash process spawns (default 60s).
    pub fn teardown_grace(mut self, grace: Duration) -> Self {
        self.config.teardown_grace = grace;
        self
    }

    /// Interval of the proactive credential refresh sweep (default 60s).
    pub fn credential_check_interval(mut self, interval: Duration) -> Self {
        self.config.credential_check_interval = interval;
        self
    }

    /// Disable negotiating a response prefix (enabled by default).
    pub fn use_response_prefix(mut self, enabled: bool) -> Self {
        self.config.use_response_prefix = enabled;
        self
    }

    /// Scratch directory exported to the helper as `GAHP_TEMP`. When unset,
    /// a temporary directory is created per helper and removed with it.
    pub fn scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.scratch_dir = Some(dir.into());
        self
    }

    /// Adds a variable name to pass through from the daemon's environment.
    /// Everything else is scrubbed; the default list is just `PATH`.
    pub fn env_passthrough(mut self, name: impl Into<String>) -> Self {
        self.config.env_passthrough.push(name.into());
        self
    }

    /// Sets an explicit environment variable for the helper, e.g. a
    /// CA-bundle path for proxy-aware helpers.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.extra_env.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> GahpConfig {
        self.config
    }
}
