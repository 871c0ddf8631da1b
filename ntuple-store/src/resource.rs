use std::fmt::{Debug, Formatter};

use ntuple_error::{NtupleResult, ntuple_err};

type Release<T> = Box<dyn FnOnce(T) -> NtupleResult<()> + Send + Sync>;

/// A scoped resource: a value paired with the function that releases it.
///
/// The release function runs exactly once, either through [`Resource::release`], which
/// returns its error, or when the guard is dropped, in which case a failure is logged.
pub struct Resource<T> {
    what: &'static str,
    value: Option<T>,
    release: Option<Release<T>>,
}

impl<T> Resource<T> {
    pub fn new<F>(what: &'static str, value: T, release: F) -> Self
    where
        F: FnOnce(T) -> NtupleResult<()> + Send + Sync + 'static,
    {
        Self {
            what,
            value: Some(value),
            release: Some(Box::new(release)),
        }
    }

    /// Acquire a resource through `setup`; nothing needs releasing if setup fails.
    pub fn acquire<S, F>(what: &'static str, setup: S, release: F) -> NtupleResult<Self>
    where
        S: FnOnce() -> NtupleResult<T>,
        F: FnOnce(T) -> NtupleResult<()> + Send + Sync + 'static,
    {
        Ok(Self::new(what, setup()?, release))
    }

    /// Whether the resource is still held.
    pub fn is_valid(&self) -> bool {
        self.value.is_some()
    }

    pub fn get(&self) -> NtupleResult<&T> {
        self.value
            .as_ref()
            .ok_or_else(|| ntuple_err!(BackingStore: "{} has already been released", self.what))
    }

    pub fn get_mut(&mut self) -> NtupleResult<&mut T> {
        let what = self.what;
        self.value
            .as_mut()
            .ok_or_else(|| ntuple_err!(BackingStore: "{} has already been released", what))
    }

    /// Release the resource now, returning the release error if any.
    ///
    /// Releasing an already released resource is a no-op.
    pub fn release(&mut self) -> NtupleResult<()> {
        match (self.value.take(), self.release.take()) {
            (Some(value), Some(release)) => release(value),
            _ => Ok(()),
        }
    }
}

impl<T> Drop for Resource<T> {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            log::error!("failed to release {}: {}", self.what, err.message());
        }
    }
}

impl<T> Debug for Resource<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("what", &self.what)
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use ntuple_error::{ErrorKind, ntuple_err};

    use super::*;

    #[test]
    fn releases_once_on_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        {
            let counter = released.clone();
            let resource = Resource::new("counter", 5u32, move |v| {
                counter.fetch_add(v as usize, Ordering::SeqCst);
                Ok(())
            });
            assert!(resource.is_valid());
            assert_eq!(*resource.get().unwrap(), 5);
        }
        assert_eq!(released.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn explicit_release_reports_error_and_invalidates() {
        let mut resource = Resource::new("file", (), |_| Err(ntuple_err!(BackingStore: "disk full")));
        assert_eq!(resource.release().unwrap_err().kind(), ErrorKind::BackingStore);
        assert!(!resource.is_valid());
        assert!(resource.get().is_err());
        // A second release has nothing left to do.
        assert!(resource.release().is_ok());
    }

    #[test]
    fn failed_setup_acquires_nothing() {
        let result = Resource::<u8>::acquire(
            "handle",
            || Err(ntuple_err!(BackingStore: "no such file")),
            |_| panic!("release must not run"),
        );
        assert!(result.is_err());
    }
}
