use crate::NtupleError;

/// How errors produced by the table writer and the concatenator are reported.
///
/// Errors are always returned to the caller as `Err`; the mode only decides which of them are
/// additionally written to the log. It is passed explicitly to every component that reports
/// errors, so two components in one process can use different modes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ErrorMode {
    /// Log every error at `error` level, including the ones that are returned.
    #[default]
    Print,
    /// Leave returned errors to the caller; only log errors that cannot be returned, such as a
    /// failed flush while a table is dropped or a dataset skipped during a merge.
    Raise,
    /// Only log at `debug` level.
    Silent,
}

impl ErrorMode {
    /// Report an error that is about to be returned to the caller.
    pub fn report(&self, err: &NtupleError) {
        if matches!(self, ErrorMode::Print) {
            log::error!("{}", err.message());
        }
    }

    /// Report an error that is swallowed instead of returned.
    pub fn report_suppressed(&self, err: &NtupleError) {
        match self {
            ErrorMode::Print | ErrorMode::Raise => log::error!("{}", err.message()),
            ErrorMode::Silent => log::debug!("suppressed: {}", err.message()),
        }
    }

    /// Report `err` and hand it back, for use in `map_err`.
    pub fn reported(&self, err: NtupleError) -> NtupleError {
        self.report(&err);
        err
    }
}
