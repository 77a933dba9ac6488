// SPDX-License-Identifier: AGPL-3.0-only

//! cgroup v2 resource control: a root subtree shared by every command,
//! and one subdirectory per command holding its own limits.

use {
    crate::error::{Error, ResultExt},
    nix::{errno::Errno, fcntl::OFlag, sys::stat::Mode, unistd},
    std::{fs, path::{Path, PathBuf}},
    tracing::{debug, warn},
};

/// The root of the cgroup v2 subtree this process manages.
///
/// Created by [`CgroupRoot::setup`] before any command is started, torn
/// down by [`CgroupRoot::tear_down`] when the process is done.
pub struct CgroupRoot
{
    root: PathBuf,
}

impl CgroupRoot
{
    /// Verify cgroup v2 is mounted, create the root directory, and enable
    /// the memory/io/cpu controllers for its children.
    pub fn setup(root: PathBuf) -> Result<Self, Error>
    {
        if !cgroup2_mounted()? {
            return Err(Error::other(
                "cgroup v2 is not mounted",
                std::io::Error::new(std::io::ErrorKind::Unsupported, "no cgroup2 entry in /proc/mounts"),
            ));
        }

        fs::create_dir_all(&root)
            .context(format!("creating cgroup root {}", root.display()))?;

        retrying_write_file(&root.join("cgroup.subtree_control"), b"+memory +io +cpu")?;

        debug!(root = %root.display(), "cgroup root set up");
        Ok(Self{root})
    }

    /// Recursively remove the root directory.
    pub fn tear_down(&self) -> Result<(), Error>
    {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).context(format!("removing cgroup root {}", self.root.display())),
        }
    }

    /// Construct the per-command subdirectory for `command_id`, creating it.
    pub fn container(&self, command_id: &str) -> Result<CgroupContainer, Error>
    {
        let path = self.root.join(command_id);
        fs::create_dir_all(&path)
            .context(format!("creating cgroup {}", path.display()))?;
        debug!(%command_id, path = %path.display(), "cgroup container created");
        Ok(CgroupContainer{path})
    }

    /// Build a root referring to `path` without touching cgroup v2 sysfs.
    /// For tests that need a `CgroupRoot` to thread through a `Controller`
    /// but never actually start a command against it.
    #[cfg(test)]
    pub(crate) fn for_tests(path: PathBuf) -> Self
    {
        Self{root: path}
    }
}

/// Error specific to a per-command resource-limit write.
#[derive(Debug, thiserror::Error)]
pub enum CgroupError
{
    /// A hard failure writing to the cgroup's sysfs interface.
    #[error(transparent)]
    Io(#[from] Error),

    /// `io.bfq.weight` could not be written, most likely because the
    /// kernel was not built with the bfq I/O scheduler. Non-fatal: the
    /// open question in the design notes resolves this as a warning.
    #[error("io.bfq.weight is unsupported on this kernel: {0}")]
    IoWeightUnsupported(Error),
}

/// A single command's cgroup: one directory under the root.
pub struct CgroupContainer
{
    path: PathBuf,
}

impl CgroupContainer
{
    /// Add `pid` to this cgroup. Must happen before limits are applied so
    /// that the limits cover the whole of the future process tree.
    pub fn add_process(&self, pid: nix::unistd::Pid) -> Result<(), Error>
    {
        retrying_write_file(&self.path.join("cgroup.procs"), pid.to_string().as_bytes())
    }

    /// Set the memory ceiling, in bytes.
    pub fn memory_limit(&self, bytes: u64) -> Result<(), Error>
    {
        retrying_write_file(&self.path.join("memory.max"), bytes.to_string().as_bytes())
    }

    /// Set the io.bfq.weight, downgrading a failure to a distinguishable,
    /// non-fatal variant when bfq is unavailable.
    pub fn io_weight(&self, weight: u32) -> Result<(), CgroupError>
    {
        let contents = format!("default {}", weight);
        match retrying_write_file(&self.path.join("io.bfq.weight"), contents.as_bytes()) {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(path = %self.path.display(), %err, "io.bfq.weight write failed, ignoring");
                Err(CgroupError::IoWeightUnsupported(err))
            },
        }
    }

    /// Set the CPU ceiling as a percentage of one core, over a 1-second period.
    pub fn cpu_limit_pct(&self, percent: u32) -> Result<(), Error>
    {
        let contents = format!("{} 1000000", percent * 10000);
        retrying_write_file(&self.path.join("cpu.max"), contents.as_bytes())
    }

    /// Recursively remove this cgroup's directory.
    pub fn close(&self) -> Result<(), Error>
    {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).context(format!("removing cgroup {}", self.path.display())),
        }
    }
}

/// Scan `/proc/mounts` for an entry whose first field is `cgroup2`.
fn cgroup2_mounted() -> Result<bool, Error>
{
    let mounts = fs::read_to_string("/proc/mounts").context("reading /proc/mounts")?;
    Ok(mounts.lines().any(|line| line.split_whitespace().next() == Some("cgroup2")))
}

/// Write `contents` to `path`, retrying only on `EINTR`.
///
/// Any other error, including a partial write, is reported immediately;
/// cgroup control files are small enough that a short write never happens
/// in practice, but we do not assume it.
fn retrying_write_file(path: &Path, contents: &[u8]) -> Result<(), Error>
{
    let context = || format!("writing {}", path.display());
    loop {
        let fd = nix::fcntl::open(path, OFlag::O_WRONLY | OFlag::O_TRUNC, Mode::empty())
            .context(context())?;
        let result = unistd::write(&fd, contents);
        match result {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(Error::from_raw_os_error(context(), errno as i32)),
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn cgroup2_mounted_reads_real_proc_mounts()
    {
        // Whatever the answer is on this host, the scan itself must not error.
        let _ = cgroup2_mounted().expect("scanning /proc/mounts must not fail");
    }
}
