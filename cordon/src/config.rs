// SPDX-License-Identifier: AGPL-3.0-only

//! Process-wide configuration: the fixed points every other module reads
//! at construction time instead of hardcoding.

use std::{env, path::PathBuf};

/// Default memory ceiling applied to a command's cgroup: 10 MiB.
pub const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 10 * 1024 * 1024;

/// Default `io.bfq.weight` applied to a command's cgroup.
pub const DEFAULT_IO_WEIGHT: u32 = 1;

/// Default CPU ceiling applied to a command's cgroup, as a percentage of one core.
pub const DEFAULT_CPU_LIMIT_PCT: u32 = 10;

const DEFAULT_APP_NAME: &str = "cordon";

/// Process-wide, immutable configuration.
///
/// Constructed once by whichever binary owns `main` and threaded by
/// reference into the cgroup manager, launcher, and process log.
#[derive(Debug, Clone)]
pub struct Config
{
    /// Name used as the cgroup root's leaf component and as a tracing tag.
    pub app_name: String,

    /// Directory under which capture files are created.
    pub capture_dir: PathBuf,

    /// Default memory ceiling for a freshly started command.
    pub default_memory_limit_bytes: u64,

    /// Default io.bfq.weight for a freshly started command.
    pub default_io_weight: u32,

    /// Default CPU percentage ceiling for a freshly started command.
    pub default_cpu_limit_pct: u32,
}

impl Config
{
    /// Resolve configuration from the environment, falling back to
    /// compiled-in defaults for anything unset. Never panics.
    pub fn from_env() -> Self
    {
        let app_name = env::var("CORDON_APP_NAME")
            .unwrap_or_else(|_| DEFAULT_APP_NAME.to_owned());
        let capture_dir = env::var_os("CORDON_CAPTURE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(env::temp_dir);
        Self{
            app_name,
            capture_dir,
            default_memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            default_io_weight: DEFAULT_IO_WEIGHT,
            default_cpu_limit_pct: DEFAULT_CPU_LIMIT_PCT,
        }
    }

    /// The root of the cgroup v2 subtree this process manages.
    pub fn cgroup_root(&self) -> PathBuf
    {
        PathBuf::from("/sys/fs/cgroup").join(&self.app_name)
    }

    /// The tracing env-filter directive to install, honoring
    /// `<APP_NAME>_LOG` uppercased, falling back to `info`.
    pub fn log_filter(&self) -> String
    {
        let var_name = format!("{}_LOG", self.app_name.to_uppercase());
        env::var(var_name).unwrap_or_else(|_| "info".to_owned())
    }
}

impl Default for Config
{
    fn default() -> Self
    {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn defaults_are_stable()
    {
        assert_eq!(DEFAULT_MEMORY_LIMIT_BYTES, 10 * 1024 * 1024);
        assert_eq!(DEFAULT_IO_WEIGHT, 1);
        assert_eq!(DEFAULT_CPU_LIMIT_PCT, 10);
    }

    #[test]
    fn cgroup_root_is_derived_from_app_name()
    {
        let config = Config{app_name: "banana".to_owned(), ..Config::from_env()};
        assert_eq!(config.cgroup_root(), PathBuf::from("/sys/fs/cgroup/banana"));
    }
}
