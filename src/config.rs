//! Runtime configuration, built via a small mutable-reference builder.

/// Builder for a runtime instance.
///
/// ```no_run
/// let mut config = coro_rt::Config::new();
/// config.set_blocking_pool_size(4);
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    pub(crate) blocking_pool_size: usize,
    pub(crate) poller_events_capacity: usize,
    pub(crate) catch_panics: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}

impl Config {
    /// New config with defaults: blocking pool size = hardware parallelism,
    /// poller batch capacity = 1024.
    pub fn new() -> Self {
        Config {
            blocking_pool_size: num_cpus::get(),
            poller_events_capacity: 1024,
            catch_panics: true,
        }
    }

    /// Number of OS threads backing the process-wide blocking executor.
    pub fn set_blocking_pool_size(&mut self, n: usize) -> &mut Self {
        self.blocking_pool_size = n.max(1);
        self
    }

    /// Number of readiness events drained from the kernel per `Poller::wait`.
    pub fn set_poller_events_capacity(&mut self, n: usize) -> &mut Self {
        self.poller_events_capacity = n.max(1);
        self
    }

    /// Whether an outermost task's panic is captured and reported through
    /// the failure sink rather than unwinding the worker thread.
    pub fn set_catch_panics(&mut self, catch: bool) -> &mut Self {
        self.catch_panics = catch;
        self
    }
}
