//! Config for the runner behaviors
//!
//! Configuration can be created programmatically using [`Configuration::new()`] or by reading
//! environment variables using [`Configuration::from_env()`].
//!
//! # Environment Variables
//!
//! The following environment variables can be used to override configuration values. All
//! values are optional, and case-insensitive. Set the value to `"true"` to enable a flag.
//!
//! - `RUNNER_VERBOSE`: Print battle progress and scores to stdout (default: `true`)
//! - `RUNNER_LOG`: Enable logging to a file (default: `false`)
//! - `RUNNER_ALLOW_UNCONTAINED`: Run workers without cgroup limits when cgroups are unavailable (default: `false`)
//! - `RUNNER_DEBUG_WORKER_STDERR`: Let worker stderr through (default: `false`)

/// Configuration for runner behaviors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Configuration {
    pub(crate) verbose: bool,
    pub(crate) log: bool,
    pub(crate) allow_uncontained: bool,
    pub(crate) debug_worker_stderr: bool,
}

impl Configuration {
    /// Create a new configuration with default parameters.
    ///
    /// By default:
    /// - Battle progress is printed to stdout.
    /// - Logging to file is disabled.
    /// - Workers that cannot be contained are an error.
    /// - Worker stderr output is discarded.
    pub fn new() -> Self {
        Self {
            verbose: true,
            log: false,
            allow_uncontained: false,
            debug_worker_stderr: false,
        }
    }

    /// Create configuration from environment variables.
    ///
    /// Any value other than `"true"` (ignoring case) disables a set flag; unset variables keep
    /// their default.
    pub fn from_env() -> Self {
        fn get_env_flag(var: &str, default: bool) -> bool {
            match std::env::var(var) {
                Ok(val) => val.eq_ignore_ascii_case("true"),
                Err(_) => default,
            }
        }

        Self {
            verbose: get_env_flag("RUNNER_VERBOSE", true),
            log: get_env_flag("RUNNER_LOG", false),
            allow_uncontained: get_env_flag("RUNNER_ALLOW_UNCONTAINED", false),
            debug_worker_stderr: get_env_flag("RUNNER_DEBUG_WORKER_STDERR", false),
        }
    }

    /// Enable or disable progress output.
    pub fn with_verbose(mut self, value: bool) -> Self {
        self.verbose = value;
        self
    }

    /// Enable or disable logging to file.
    pub fn with_log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }

    /// Allow or forbid running workers without resource limits.
    pub fn with_allow_uncontained(mut self, value: bool) -> Self {
        self.allow_uncontained = value;
        self
    }

    /// Enable or disable worker stderr output (debug purposes only).
    pub fn with_debug_worker_stderr(mut self, value: bool) -> Self {
        self.debug_worker_stderr = value;
        self
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}
