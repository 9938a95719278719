//! Runtime-tunable constants read once at startup.
//!
//! This crate is not a config-file reader: YAML/env/argument parsing
//! belongs in whatever embeds it. What it owns is the *shape* of the
//! handful of keys it consults, with sane defaults, plus a thin
//! environment-variable override so an embedder without its own
//! config layer can still tune the runtime.

use std::env;
use std::sync::OnceLock;
use std::time::Duration;

/// Default stack size for a spawned coroutine: 128 KiB.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Default `connect()` timeout: 5 seconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Default read timeout for a server-accepted connection: 120 seconds.
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 120_000;

/// The IOManager idle loop never blocks in `epoll_wait` longer than
/// this, even with no timers pending, so that `stop()` makes progress.
pub const MAX_EPOLL_TIMEOUT_MS: i32 = 3_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// `coroutine.stack_size` / `fiber.stack_size`.
    pub coroutine_stack_size: usize,
    /// `tcp.connect.timeout`.
    pub tcp_connect_timeout_ms: u64,
    /// `tcp_server.read_timeout`.
    pub tcp_server_read_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            coroutine_stack_size: DEFAULT_STACK_SIZE,
            tcp_connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            tcp_server_read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
        }
    }
}

impl RuntimeConfig {
    /// Build from defaults overridden by `CORIO_STACK_SIZE`,
    /// `CORIO_CONNECT_TIMEOUT_MS`, `CORIO_READ_TIMEOUT_MS` when set and
    /// parseable. Never touches the filesystem.
    pub fn from_env() -> Self {
        let mut cfg = RuntimeConfig::default();
        if let Some(v) = env_usize("CORIO_STACK_SIZE") {
            cfg.coroutine_stack_size = v;
        }
        if let Some(v) = env_u64("CORIO_CONNECT_TIMEOUT_MS") {
            cfg.tcp_connect_timeout_ms = v;
        }
        if let Some(v) = env_u64("CORIO_READ_TIMEOUT_MS") {
            cfg.tcp_server_read_timeout_ms = v;
        }
        cfg
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp_connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp_server_read_timeout_ms)
    }
}

static GLOBAL: OnceLock<RuntimeConfig> = OnceLock::new();

/// The process-wide config, built from the environment on first use.
/// The hook layer consults this for connect/read timeouts rather than
/// threading a `RuntimeConfig` through every syscall wrapper.
pub fn global() -> &'static RuntimeConfig {
    GLOBAL.get_or_init(RuntimeConfig::from_env)
}

fn env_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|s| s.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.coroutine_stack_size, 128 * 1024);
        assert_eq!(cfg.tcp_connect_timeout_ms, 5000);
        assert_eq!(cfg.tcp_server_read_timeout_ms, 120_000);
    }
}
