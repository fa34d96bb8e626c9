//! Configuration loaded from environment variables at startup.
//!
//! Centralizes all SESH_* env var access into a single Config struct so
//! the rest of the crate never calls env::var directly.

use std::path::PathBuf;
use std::sync::Mutex;

/// Global configuration instance, lazily initialized and resettable for tests.
static CONFIG: Mutex<Option<Config>> = Mutex::new(None);

/// Configuration loaded from the environment.
#[derive(Clone, Debug)]
pub struct Config {
    /// Registry directory override (SESH_DIR). When unset, the registry
    /// lives at `<temp-root>/sesh-<uid>`.
    pub dir_override: Option<PathBuf>,
    /// Shell for session children (SHELL or /bin/bash)
    pub shell: String,
    /// Verbose logging flag (SESH_DEBUG=1)
    pub debug: bool,
}

impl Config {
    /// Initialize global config from environment variables (call once at startup).
    /// Subsequent calls are no-ops.
    pub fn init() {
        let mut config = CONFIG.lock().unwrap();
        if config.is_none() {
            *config = Some(Self::from_env());
        }
    }

    /// Get a copy of the global config (must call init() first).
    /// Panics if init() was not called.
    pub fn get() -> Config {
        CONFIG
            .lock()
            .unwrap()
            .clone()
            .expect("Config::init() must be called before Config::get()")
    }

    /// Reset global config (test-only).
    #[cfg(test)]
    pub fn reset() {
        *CONFIG.lock().unwrap() = None;
    }

    fn from_env() -> Self {
        use std::env;

        let dir_override = env::var("SESH_DIR")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let shell = env::var("SHELL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "/bin/bash".to_string());

        let debug = env::var("SESH_DEBUG").map(|v| v == "1").unwrap_or(false);

        Self {
            dir_override,
            shell,
            debug,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    /// Helper to set env var for test scope
    fn with_env<F>(key: &str, value: &str, f: F)
    where
        F: FnOnce(),
    {
        // SAFETY: Tests are serialized via serial_test, so no other
        // thread is reading or writing the environment concurrently.
        unsafe {
            env::set_var(key, value);
        }
        f();
        unsafe {
            env::remove_var(key);
        }
    }

    fn without_env<F>(keys: &[&str], f: F)
    where
        F: FnOnce(),
    {
        let saved: Vec<_> = keys.iter().map(|k| (k, env::var(k).ok())).collect();

        // SAFETY: Tests are serialized via serial_test.
        for key in keys {
            unsafe {
                env::remove_var(key);
            }
        }

        f();

        for (key, val) in saved {
            if let Some(v) = val {
                unsafe {
                    env::set_var(key, v);
                }
            }
        }
    }

    #[test]
    #[serial]
    fn test_dir_override_unset_by_default() {
        Config::reset();
        without_env(&["SESH_DIR"], || {
            Config::init();
            assert_eq!(Config::get().dir_override, None);
        });
    }

    #[test]
    #[serial]
    fn test_dir_override_respects_env() {
        Config::reset();
        with_env("SESH_DIR", "/custom/sesh", || {
            Config::init();
            assert_eq!(
                Config::get().dir_override,
                Some(PathBuf::from("/custom/sesh"))
            );
        });
    }

    #[test]
    #[serial]
    fn test_empty_dir_override_ignored() {
        Config::reset();
        with_env("SESH_DIR", "", || {
            Config::init();
            assert_eq!(Config::get().dir_override, None);
        });
    }

    #[test]
    #[serial]
    fn test_shell_defaults_to_bash() {
        Config::reset();
        without_env(&["SHELL"], || {
            Config::init();
            assert_eq!(Config::get().shell, "/bin/bash");
        });
    }

    #[test]
    #[serial]
    fn test_shell_respects_env() {
        Config::reset();
        with_env("SHELL", "/usr/bin/zsh", || {
            Config::init();
            assert_eq!(Config::get().shell, "/usr/bin/zsh");
        });
    }

    #[test]
    #[serial]
    fn test_debug_flag() {
        Config::reset();
        with_env("SESH_DEBUG", "1", || {
            Config::init();
            assert!(Config::get().debug);
        });

        Config::reset();
        with_env("SESH_DEBUG", "0", || {
            Config::init();
            assert!(!Config::get().debug);
        });
    }

    #[test]
    #[serial]
    fn test_reset_allows_reinit() {
        Config::reset();
        with_env("SESH_DIR", "/first", || {
            Config::init();
            assert_eq!(Config::get().dir_override, Some(PathBuf::from("/first")));
        });

        Config::reset();
        with_env("SESH_DIR", "/second", || {
            Config::init();
            assert_eq!(Config::get().dir_override, Some(PathBuf::from("/second")));
        });
    }
}
