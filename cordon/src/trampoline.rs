// SPDX-License-Identifier: AGPL-3.0-only

//! The code path executed by the freshly re-exec'd, now single-threaded
//! child: mount `/proc`, set the hostname, bring up loopback, drop
//! privileges, then replace itself with the user's program.
//!
//! This module never returns control to its caller in the success path;
//! every failure terminates the process with the sentinel exit code 42,
//! matching the contract the [`crate::launcher`] waits on.

use {
    cordon_os::{self as os, cstr::CStringArray},
    std::{env, ffi::CString, os::unix::ffi::OsStrExt, path::Path, process::Command as StdCommand},
};

/// The well-known first argument that selects trampoline mode instead of
/// the binary's ordinary entry point.
pub const DISPATCH_TOKEN: &str = "executeCommand";

/// Exit code used for any setup failure before the final `exec`.
pub const SETUP_FAILURE_EXIT_CODE: i32 = 42;

/// Exit code of the line that must be unreachable after a successful `exec`.
pub const UNREACHABLE_EXIT_CODE: i32 = 125;

const CONTAINER_UID: libc::uid_t = 65534;
const CONTAINER_GID: libc::gid_t = 65534;

/// Environment baked into every command, replacing whatever the trampoline
/// itself inherited.
pub const CHILD_ENV: &[(&str, &str)] = &[
    ("HOME", "/root"),
    ("PATH", "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"),
    ("TERM", "xterm"),
];

/// Run the trampoline. `argv` is the user's program followed by its own
/// arguments, i.e. everything after the dispatch token. Never returns.
pub fn run(argv: &[CString]) -> !
{
    let Some((program, rest)) = argv.split_first() else {
        eprintln!("cordon trampoline: missing program to execute");
        os::_exit(SETUP_FAILURE_EXIT_CODE);
    };

    if let Err(err) = os::mount("proc", "/proc", "proc", 0, "") {
        eprintln!("cordon trampoline: mount /proc failed: {err}");
        os::_exit(SETUP_FAILURE_EXIT_CODE);
    }

    if let Err(err) = os::sethostname("container") {
        eprintln!("cordon trampoline: sethostname failed: {err}");
        os::_exit(SETUP_FAILURE_EXIT_CODE);
    }

    if let Err(err) = bring_up_loopback() {
        eprintln!("cordon trampoline: bringing up loopback failed: {err}");
        os::_exit(SETUP_FAILURE_EXIT_CODE);
    }

    // Drop to the unprivileged container user. Group first: once the uid
    // is dropped, permission to change the gid back is gone.
    if let Err(err) = os::setresgid(CONTAINER_GID, CONTAINER_GID, CONTAINER_GID) {
        eprintln!("cordon trampoline: setresgid failed: {err}");
        os::_exit(SETUP_FAILURE_EXIT_CODE);
    }
    if let Err(err) = os::setresuid(CONTAINER_UID, CONTAINER_UID, CONTAINER_UID) {
        eprintln!("cordon trampoline: setresuid failed: {err}");
        os::_exit(SETUP_FAILURE_EXIT_CODE);
    }

    let resolved = match resolve_program(program) {
        Ok(resolved) => resolved,
        Err(err) => {
            eprintln!("cordon trampoline: resolving program failed: {err}");
            os::_exit(SETUP_FAILURE_EXIT_CODE);
        },
    };

    let mut full_argv = CStringArray::new();
    full_argv.push(resolved.clone());
    for arg in rest {
        full_argv.push(arg.clone());
    }

    let envp: CStringArray = CHILD_ENV.iter()
        .map(|(key, value)| CString::new(format!("{key}={value}")).unwrap())
        .collect();

    let err = os::execve(resolved, &full_argv, &envp);
    eprintln!("cordon trampoline: exec failed: {err}");
    os::_exit(SETUP_FAILURE_EXIT_CODE);

    // execve(2) only returns on failure, and the line above never returns
    // either; this can't run. Kept as a distinct, named sentinel in case
    // that assumption is ever wrong, the same way the original trampoline
    // falls through to its own "should never happen" exit unconditionally
    // after the exec failure branch.
    #[allow(unreachable_code)]
    os::_exit(UNREACHABLE_EXIT_CODE);
}

/// Bring the loopback interface up, per the design's explicit allowance
/// to do so by invoking `ip link set lo up` or an equivalent mechanism.
fn bring_up_loopback() -> std::io::Result<()>
{
    let status = StdCommand::new("ip").args(["link", "set", "lo", "up"]).status()?;
    if !status.success() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("ip link set lo up exited with {status}"),
        ));
    }
    Ok(())
}

/// If `program` contains no path separator, resolve it against `PATH`.
/// Otherwise return it unchanged.
fn resolve_program(program: &CString) -> std::io::Result<CString>
{
    let bytes = program.as_bytes();
    if bytes.contains(&b'/') {
        return Ok(program.clone());
    }

    let path_var = CHILD_ENV.iter()
        .find(|(key, _)| *key == "PATH")
        .map(|(_, value)| *value)
        .unwrap_or_default();

    for dir in env::split_paths(path_var) {
        let candidate = dir.join(program.to_str().unwrap_or_default());
        if is_executable(&candidate) {
            return CString::new(candidate.as_os_str().as_bytes())
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err));
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("{:?} not found in PATH", program),
    ))
}

fn is_executable(path: &Path) -> bool
{
    use std::os::unix::fs::PermissionsExt;
    path.metadata().map(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn resolve_program_keeps_paths_with_separators() {
        let program = CString::new("/bin/true").unwrap();
        let resolved = resolve_program(&program).unwrap();
        assert_eq!(resolved, program);
    }

    #[test]
    fn resolve_program_finds_true_on_path() {
        let program = CString::new("true").unwrap();
        let resolved = resolve_program(&program).expect("true(1) should be on PATH");
        assert!(resolved.to_str().unwrap().ends_with("/true"));
    }

    #[test]
    fn resolve_program_reports_missing_binary() {
        let program = CString::new("this-binary-does-not-exist-9f3c").unwrap();
        assert!(resolve_program(&program).is_err());
    }
}
