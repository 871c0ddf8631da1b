#![deny(missing_docs)]

//! Error handling for the ntuple crates.
//!
//! Every fallible operation returns an [`NtupleResult`]. Errors carry a message and, for the
//! message-bearing kinds, a captured [`Backtrace`]. Use [`ntuple_err!`] to construct an error
//! and [`ntuple_bail!`] to return one early.

mod mode;

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::fmt::{Debug, Display, Formatter};
use std::ops::Deref;
use std::{env, fmt};

pub use mode::*;

/// A string that can be used as an error message.
#[derive(Debug)]
pub struct ErrString(Cow<'static, str>);

#[allow(clippy::fallible_impl_from, clippy::panic)]
impl<T> From<T> for ErrString
where
    T: Into<Cow<'static, str>>,
{
    fn from(msg: T) -> Self {
        if env::var("NTUPLE_PANIC_ON_ERR").as_deref().unwrap_or("") == "1" {
            panic!("{}\nBacktrace:\n{}", msg.into(), Backtrace::capture());
        } else {
            Self(msg.into())
        }
    }
}

impl AsRef<str> for ErrString {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for ErrString {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for ErrString {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// The kind of an [`NtupleError`], without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// An entity already exists in the target namespace and may not be replaced.
    SchemaConflict,
    /// Two datasets that should be merged disagree on their row shape.
    ShapeIncompatible,
    /// A column asks for more dimensions than the container supports.
    UnsupportedRank,
    /// The backing container failed to create, open, read, write or extend something.
    BackingStore,
    /// Moving rows between containers failed.
    Transfer,
    /// A caller supplied an argument that violates an operation's precondition.
    InvalidArgument,
}

/// The top-level error type for the ntuple crates.
#[derive(thiserror::Error)]
#[non_exhaustive]
pub enum NtupleError {
    /// An entity already exists and overwriting it was not permitted.
    #[error("schema conflict: {0}\nBacktrace:\n{1}")]
    SchemaConflict(ErrString, Box<Backtrace>),
    /// Row shapes (non-leading extents or element types) are incompatible.
    #[error("incompatible shape: {0}\nBacktrace:\n{1}")]
    ShapeIncompatible(ErrString, Box<Backtrace>),
    /// The requested rank exceeds the maximum the container supports.
    #[error("unsupported rank: {0}\nBacktrace:\n{1}")]
    UnsupportedRank(ErrString, Box<Backtrace>),
    /// A failure reported by the backing container.
    #[error("backing store failure: {0}\nBacktrace:\n{1}")]
    BackingStore(ErrString, Box<Backtrace>),
    /// A failure while transferring rows during a merge.
    #[error("transfer failure: {0}\nBacktrace:\n{1}")]
    Transfer(ErrString, Box<Backtrace>),
    /// An invalid argument was supplied.
    #[error("{0}\nBacktrace:\n{1}")]
    InvalidArgument(ErrString, Box<Backtrace>),
    /// An error wrapped with additional context.
    #[error("{0}: {1}")]
    Context(ErrString, Box<NtupleError>),
}

impl NtupleError {
    /// Adds additional context to an error.
    pub fn with_context<T: Into<ErrString>>(self, msg: T) -> Self {
        NtupleError::Context(msg.into(), Box::new(self))
    }

    /// Returns the kind of this error, looking through any added context.
    pub fn kind(&self) -> ErrorKind {
        match self {
            NtupleError::SchemaConflict(..) => ErrorKind::SchemaConflict,
            NtupleError::ShapeIncompatible(..) => ErrorKind::ShapeIncompatible,
            NtupleError::UnsupportedRank(..) => ErrorKind::UnsupportedRank,
            NtupleError::BackingStore(..) => ErrorKind::BackingStore,
            NtupleError::Transfer(..) => ErrorKind::Transfer,
            NtupleError::InvalidArgument(..) => ErrorKind::InvalidArgument,
            NtupleError::Context(_, inner) => inner.kind(),
        }
    }

    /// The error message without the captured backtrace.
    pub fn message(&self) -> String {
        match self {
            NtupleError::SchemaConflict(msg, _)
            | NtupleError::ShapeIncompatible(msg, _)
            | NtupleError::UnsupportedRank(msg, _)
            | NtupleError::BackingStore(msg, _)
            | NtupleError::Transfer(msg, _)
            | NtupleError::InvalidArgument(msg, _) => msg.to_string(),
            NtupleError::Context(msg, inner) => format!("{msg}: {}", inner.message()),
        }
    }
}

impl Debug for NtupleError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// A type alias for Results that return [`NtupleError`]s as their error type.
pub type NtupleResult<T> = Result<T, NtupleError>;

/// Construct a new [`NtupleError`].
///
/// `ntuple_err!("...")` builds an `InvalidArgument`; prefix the message with a kind to pick
/// another one, e.g. `ntuple_err!(BackingStore: "chunk {} missing", idx)`.
#[macro_export]
macro_rules! ntuple_err {
    (SchemaConflict: $fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::ntuple_err!(@variant SchemaConflict, $fmt $(, $arg)*)
    };
    (ShapeIncompatible: $fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::ntuple_err!(@variant ShapeIncompatible, $fmt $(, $arg)*)
    };
    (UnsupportedRank: $fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::ntuple_err!(@variant UnsupportedRank, $fmt $(, $arg)*)
    };
    (BackingStore: $fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::ntuple_err!(@variant BackingStore, $fmt $(, $arg)*)
    };
    (Transfer: $fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::ntuple_err!(@variant Transfer, $fmt $(, $arg)*)
    };
    (@variant $variant:ident, $fmt:literal $(, $arg:expr)*) => {{
        use std::backtrace::Backtrace;
        $crate::NtupleError::$variant(format!($fmt $(, $arg)*).into(), Box::new(Backtrace::capture()))
    }};
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::ntuple_err!(@variant InvalidArgument, $fmt $(, $arg)*)
    };
}

/// Return early with an [`NtupleError`]; accepts the same forms as [`ntuple_err!`].
#[macro_export]
macro_rules! ntuple_bail {
    ($($tt:tt)+) => {
        return Err($crate::ntuple_err!($($tt)+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_looks_through_context() {
        let err = ntuple_err!(ShapeIncompatible: "extents {:?} vs {:?}", [3], [4])
            .with_context("/events/px");
        assert_eq!(err.kind(), ErrorKind::ShapeIncompatible);
        assert_eq!(err.message(), "/events/px: extents [3] vs [4]");
    }

    #[test]
    fn default_kind_is_invalid_argument() {
        let err = ntuple_err!("expected {} cells", 3);
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(err.message(), "expected 3 cells");
    }

    #[test]
    fn bail_returns_early() {
        fn check(rank: usize) -> NtupleResult<usize> {
            if rank > 32 {
                ntuple_bail!(UnsupportedRank: "rank {} exceeds 32", rank);
            }
            Ok(rank)
        }

        assert_eq!(check(3).ok(), Some(3));
        assert_eq!(check(40).map_err(|e| e.kind()).err(), Some(ErrorKind::UnsupportedRank));
    }
}
