// SPDX-License-Identifier: AGPL-3.0-only

//! Shared error plumbing used by the lower-level, syscall-adjacent modules.
//!
//! [`Error`] wraps an [`io::Error`] with a short, static-ish context string,
//! the same shape the trampoline and launcher use to report *where* a
//! syscall failed rather than just that one did.

use std::{borrow::Cow, fmt, io};

/// An I/O error annotated with the operation that produced it.
#[derive(Debug)]
pub struct Error
{
    inner: io::Error,
    context: Cow<'static, str>,
}

impl Error
{
    /// Build an error from a raw `errno` value.
    pub fn from_raw_os_error(context: impl Into<Cow<'static, str>>, errno: i32) -> Self
    {
        Self{inner: io::Error::from_raw_os_error(errno), context: context.into()}
    }

    /// Build an error from the current value of `errno`.
    pub fn last_os_error(context: impl Into<Cow<'static, str>>) -> Self
    {
        Self{inner: io::Error::last_os_error(), context: context.into()}
    }

    /// Build an error from an arbitrary [`io::Error`].
    pub fn other(context: impl Into<Cow<'static, str>>, inner: io::Error) -> Self
    {
        Self{inner, context: context.into()}
    }

    /// The underlying I/O error, stripped of its context.
    pub fn into_inner(self) -> io::Error
    {
        self.inner
    }
}

impl fmt::Display for Error
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}: {}", self.context, self.inner)
    }
}

impl std::error::Error for Error
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)>
    {
        Some(&self.inner)
    }
}

/// Attach context to a plain [`io::Result`].
pub trait ResultExt<T>
{
    /// Wrap the error, if any, with a context string.
    fn context(self, context: impl Into<Cow<'static, str>>) -> Result<T, Error>;
}

impl<T> ResultExt<T> for io::Result<T>
{
    fn context(self, context: impl Into<Cow<'static, str>>) -> Result<T, Error>
    {
        self.map_err(|inner| Error::other(context, inner))
    }
}

impl<T> ResultExt<T> for Result<T, nix::errno::Errno>
{
    fn context(self, context: impl Into<Cow<'static, str>>) -> Result<T, Error>
    {
        self.map_err(|errno| Error::from_raw_os_error(context, errno as i32))
    }
}
