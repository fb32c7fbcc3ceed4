use std::time::Duration;

const DEFAULT_POLL_DELAY: Duration = Duration::from_micros(1);
const DEFAULT_MAX_POLL_DELAY: Duration = Duration::from_millis(10);

/// Session and backend configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Options {
    poll_delay: Duration,
    max_poll_delay: Duration,
    follow_children: bool,
    track_modules: bool,
    kill_on_exit: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            poll_delay: DEFAULT_POLL_DELAY,
            max_poll_delay: DEFAULT_MAX_POLL_DELAY,
            follow_children: true,
            track_modules: true,
            kill_on_exit: true,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initial delay before re-polling debuggees for a new event.
    pub fn poll_delay(&self) -> Duration {
        self.poll_delay
    }

    pub fn set_poll_delay(&mut self, poll_delay: Duration) -> &mut Self {
        self.poll_delay = poll_delay;
        self
    }

    /// Upper bound for the exponential poll backoff.
    pub fn max_poll_delay(&self) -> Duration {
        self.max_poll_delay
    }

    pub fn set_max_poll_delay(&mut self, max_poll_delay: Duration) -> &mut Self {
        self.max_poll_delay = max_poll_delay;
        self
    }

    /// Whether forked and cloned children are debugged too.
    pub fn follow_children(&self) -> bool {
        self.follow_children
    }

    pub fn set_follow_children(&mut self, follow: bool) -> &mut Self {
        self.follow_children = follow;
        self
    }

    /// Whether module load and unload events are reported.
    pub fn track_modules(&self) -> bool {
        self.track_modules
    }

    pub fn set_track_modules(&mut self, track: bool) -> &mut Self {
        self.track_modules = track;
        self
    }

    /// Whether debuggees still tracked when the session ends are killed (`true`) or
    /// detached from (`false`).
    pub fn kill_on_exit(&self) -> bool {
        self.kill_on_exit
    }

    pub fn set_kill_on_exit(&mut self, kill: bool) -> &mut Self {
        self.kill_on_exit = kill;
        self
    }
}
