// SPDX-License-Identifier: Apache-2.0

//! An error type shared across every Beskar crate.
//!
//! Unlike a plain `anyhow::Error`, [`Error`] carries a [`ErrorKind`] drawn
//! from the taxonomy every API and inter-component boundary in the cluster
//! agrees on (spec §7): `NotFound`, `AlreadyExists`, `Unavailable`, and so
//! on. Callers at the HTTP edge map `ErrorKind` to a status code once,
//! instead of re-deriving "is this a 404 or a 500" from a string message at
//! every call site.

use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// The error-kind taxonomy used at every API and inter-component boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
	/// Bad repository name, missing required field, malformed GPG key.
	InvalidArgument,
	/// Absent repository, manifest, or artifact.
	NotFound,
	/// Duplicate repository creation; sync already running; deletion in progress.
	AlreadyExists,
	/// Sync requested on a non-mirror repository; delete with non-empty content
	/// and `deleteContents=false`.
	FailedPrecondition,
	/// Handler not started; sync channel saturated; barrier timeout; handler
	/// in the wrong state.
	Unavailable,
	/// Underlying DB, blob store, or transport failure not classifiable above.
	Internal,
	/// Operation deliberately unsupported.
	NotImplemented,
}

impl ErrorKind {
	pub fn as_str(self) -> &'static str {
		match self {
			ErrorKind::InvalidArgument => "invalid_argument",
			ErrorKind::NotFound => "not_found",
			ErrorKind::AlreadyExists => "already_exists",
			ErrorKind::FailedPrecondition => "failed_precondition",
			ErrorKind::Unavailable => "unavailable",
			ErrorKind::Internal => "internal",
			ErrorKind::NotImplemented => "not_implemented",
		}
	}
}

impl fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// An error carrying a [`ErrorKind`], a message, and an optional source.
pub struct Error {
	kind: ErrorKind,
	message: Cow<'static, str>,
	source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl Error {
	pub fn new<S>(kind: ErrorKind, message: S) -> Self
	where
		S: Into<Cow<'static, str>>,
	{
		Error {
			kind,
			message: message.into(),
			source: None,
		}
	}

	pub fn with_source<S, E>(kind: ErrorKind, message: S, source: E) -> Self
	where
		S: Into<Cow<'static, str>>,
		E: StdError + Send + Sync + 'static,
	{
		Error {
			kind,
			message: message.into(),
			source: Some(Box::new(source)),
		}
	}

	pub fn kind(&self) -> ErrorKind {
		self.kind
	}

	pub fn invalid_argument<S: Into<Cow<'static, str>>>(message: S) -> Self {
		Error::new(ErrorKind::InvalidArgument, message)
	}

	pub fn not_found<S: Into<Cow<'static, str>>>(message: S) -> Self {
		Error::new(ErrorKind::NotFound, message)
	}

	pub fn already_exists<S: Into<Cow<'static, str>>>(message: S) -> Self {
		Error::new(ErrorKind::AlreadyExists, message)
	}

	pub fn failed_precondition<S: Into<Cow<'static, str>>>(message: S) -> Self {
		Error::new(ErrorKind::FailedPrecondition, message)
	}

	pub fn unavailable<S: Into<Cow<'static, str>>>(message: S) -> Self {
		Error::new(ErrorKind::Unavailable, message)
	}

	pub fn internal<S: Into<Cow<'static, str>>>(message: S) -> Self {
		Error::new(ErrorKind::Internal, message)
	}

	pub fn not_implemented<S: Into<Cow<'static, str>>>(message: S) -> Self {
		Error::new(ErrorKind::NotImplemented, message)
	}
}

impl fmt::Debug for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} ({})", self.message, self.kind)?;
		if let Some(source) = &self.source {
			write!(f, ": {}", source)?;
		}
		Ok(())
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.message)
	}
}

impl StdError for Error {
	fn source(&self) -> Option<&(dyn StdError + 'static)> {
		self.source.as_ref().map(|e| e.as_ref() as &(dyn StdError + 'static))
	}
}

/// A limited analogue of `anyhow!`, scoped to [`ErrorKind::Internal`] since
/// that's the kind almost every ad hoc call site wants.
#[macro_export]
macro_rules! bk_error {
	($msg:literal $(,)?) => {
		$crate::error::Error::internal($msg)
	};
	($fmt:expr, $($arg:tt)*) => {
		$crate::error::Error::internal(format!($fmt, $($arg)*))
	};
}

macro_rules! wrap_internal {
	($from:ty) => {
		impl From<$from> for Error {
			fn from(err: $from) -> Error {
				Error::with_source(ErrorKind::Internal, err.to_string(), err)
			}
		}
	};
}

wrap_internal!(std::io::Error);
wrap_internal!(serde_json::Error);

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn kind_round_trips_through_display() {
		let err = Error::not_found("repository artifacts/yum/epel not found");
		assert_eq!(err.kind(), ErrorKind::NotFound);
		assert_eq!(err.to_string(), "repository artifacts/yum/epel not found");
	}

	#[test]
	fn with_source_chains_through_std_error() {
		let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
		let err = Error::with_source(ErrorKind::Internal, "failed to open db", io_err);
		assert!(std::error::Error::source(&err).is_some());
	}

	#[test]
	fn macro_builds_internal_error() {
		let err = bk_error!("boom {}", 42);
		assert_eq!(err.kind(), ErrorKind::Internal);
		assert_eq!(err.to_string(), "boom 42");
	}
}
