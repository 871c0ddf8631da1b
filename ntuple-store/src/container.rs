use std::fmt::{Debug, Formatter};
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind as IoErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ntuple_error::{NtupleError, NtupleResult, ntuple_bail, ntuple_err};
use parking_lot::Mutex;

use crate::footer::{ChunkRef, EOF_SIZE, Footer, decode_eof, decode_footer, encode_eof};
use crate::group::Group;
use crate::resource::Resource;

/// How [`Container::create`] treats an existing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CreateMode {
    /// Replace any existing file.
    Truncate,
    /// Fail if the file already exists.
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// A handle to an open container file.
///
/// Handles are cheap to clone and may be shared between threads; every clone refers to the
/// same open file. The footer is rewritten on [`Container::flush`] and when the last handle
/// is dropped.
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

struct ContainerInner {
    path: PathBuf,
    writable: bool,
    state: Mutex<Resource<ContainerState>>,
}

pub(crate) struct ContainerState {
    pub(crate) file: File,
    pub(crate) footer: Footer,
    writable: bool,
    /// Where the next blob is written; always the current end of the file.
    end: u64,
    dirty: bool,
}

impl Container {
    /// Create a new, empty container at `path`.
    pub fn create(path: impl AsRef<Path>, mode: CreateMode) -> NtupleResult<Self> {
        let path = path.as_ref();
        let mut options = OpenOptions::new();
        options.read(true).write(true);
        match mode {
            CreateMode::Truncate => options.create(true).truncate(true),
            CreateMode::Exclusive => options.create_new(true),
        };
        let file = options.open(path).map_err(|e| match e.kind() {
            IoErrorKind::AlreadyExists => {
                ntuple_err!(BackingStore: "{} already exists", path.display())
            }
            _ => ntuple_err!(BackingStore: "cannot create {}: {}", path.display(), e),
        })?;

        let mut state = ContainerState {
            file,
            footer: Footer::default(),
            writable: true,
            end: 0,
            dirty: true,
        };
        // An empty container is already a valid file.
        state.write_footer()?;
        log::debug!("created container {}", path.display());
        Ok(Self::from_state(path, state))
    }

    /// Open an existing container.
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> NtupleResult<Self> {
        let path = path.as_ref();
        let writable = mode == OpenMode::ReadWrite;
        let mut file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .map_err(|e| ntuple_err!(BackingStore: "cannot open {}: {}", path.display(), e))?;

        let footer = read_footer(&mut file)
            .map_err(|e| e.with_context(format!("reading {}", path.display())))?;
        let end = file.seek(SeekFrom::End(0)).map_err(io_error("seeking to the end"))?;
        let state = ContainerState {
            file,
            footer,
            writable,
            end,
            dirty: false,
        };
        log::debug!("opened container {} ({:?})", path.display(), mode);
        Ok(Self::from_state(path, state))
    }

    /// Open `path` for writing, creating it if it does not exist.
    pub fn open_or_create(path: impl AsRef<Path>) -> NtupleResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::open(path, OpenMode::ReadWrite)
        } else {
            Self::create(path, CreateMode::Exclusive)
        }
    }

    fn from_state(path: &Path, state: ContainerState) -> Self {
        Self {
            inner: Arc::new(ContainerInner {
                path: path.to_path_buf(),
                writable: state.writable,
                state: Mutex::new(Resource::new("container file", state, ContainerState::close)),
            }),
        }
    }

    pub fn root(&self) -> Group {
        Group::new(self.clone(), Vec::new())
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn is_writable(&self) -> bool {
        self.inner.writable
    }

    /// Whether the underlying file is still open.
    pub fn is_valid(&self) -> bool {
        self.inner.state.lock().is_valid()
    }

    /// Whether two handles refer to the same open file.
    pub fn same_handle(&self, other: &Container) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Persist the current tree so that the file can be reopened as it is now.
    pub fn flush(&self) -> NtupleResult<()> {
        self.check_writable()?;
        self.read(|state| {
            if state.dirty {
                state.write_footer()?;
            }
            state.file.sync_data().map_err(io_error("syncing"))?;
            Ok(())
        })
    }

    /// Close the file now if this is the last handle, returning any error from the final
    /// footer write. Otherwise this only flushes.
    pub fn close(self) -> NtupleResult<()> {
        match Arc::try_unwrap(self.inner) {
            Ok(inner) => inner.state.into_inner().release(),
            Err(inner) => Container { inner }.flush(),
        }
    }

    /// Run `f` against the open state.
    pub(crate) fn read<R>(
        &self,
        f: impl FnOnce(&mut ContainerState) -> NtupleResult<R>,
    ) -> NtupleResult<R> {
        let mut guard = self.inner.state.lock();
        f(guard.get_mut()?)
    }

    /// Run `f` against the open state, which must be writable.
    pub(crate) fn write<R>(
        &self,
        f: impl FnOnce(&mut ContainerState) -> NtupleResult<R>,
    ) -> NtupleResult<R> {
        self.check_writable()?;
        self.read(|state| {
            state.dirty = true;
            f(state)
        })
    }
}

impl Container {
    fn check_writable(&self) -> NtupleResult<()> {
        if !self.inner.writable {
            ntuple_bail!(BackingStore: "{} is open read-only", self.inner.path.display());
        }
        Ok(())
    }
}

impl Debug for Container {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("path", &self.inner.path)
            .field("writable", &self.inner.writable)
            .finish()
    }
}

impl ContainerState {
    /// Append a blob to the file.
    pub(crate) fn write_blob(&mut self, bytes: &[u8]) -> NtupleResult<ChunkRef> {
        let offset = self.end;
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(bytes))
            .map_err(|e| {
                ntuple_err!(BackingStore: "writing {} bytes at offset {}: {}", bytes.len(), offset, e)
            })?;
        self.end += bytes.len() as u64;
        Ok(ChunkRef {
            offset,
            len: bytes.len() as u64,
        })
    }

    pub(crate) fn read_blob(&mut self, chunk: ChunkRef) -> NtupleResult<Vec<u8>> {
        let mut bytes = vec![0u8; chunk.len as usize];
        self.file
            .seek(SeekFrom::Start(chunk.offset))
            .and_then(|_| self.file.read_exact(&mut bytes))
            .map_err(|e| {
                ntuple_err!(BackingStore: "reading {} bytes at offset {}: {}", chunk.len, chunk.offset, e)
            })?;
        Ok(bytes)
    }

    fn write_footer(&mut self) -> NtupleResult<()> {
        let json = serde_json::to_vec(&self.footer)
            .map_err(|e| ntuple_err!(BackingStore: "cannot serialize the footer: {}", e))?;
        let footer = self.write_blob(&json)?;
        self.write_blob(&encode_eof(footer.offset))?;
        self.dirty = false;
        Ok(())
    }

    fn close(mut self) -> NtupleResult<()> {
        if self.writable && self.dirty {
            self.write_footer()?;
            self.file.sync_all().map_err(io_error("syncing"))?;
        }
        Ok(())
    }
}

fn read_footer(file: &mut File) -> NtupleResult<Footer> {
    let len = file
        .seek(SeekFrom::End(0))
        .map_err(io_error("seeking to the end"))?;
    if len < EOF_SIZE as u64 {
        ntuple_bail!(BackingStore: "not an ntuple container: file is {} bytes", len);
    }
    let mut eof = [0u8; EOF_SIZE];
    file.seek(SeekFrom::End(-(EOF_SIZE as i64)))
        .and_then(|_| file.read_exact(&mut eof))
        .map_err(io_error("reading the end-of-file marker"))?;
    let footer_offset = decode_eof(&eof)?;

    let footer_end = len - EOF_SIZE as u64;
    if footer_offset > footer_end {
        ntuple_bail!(BackingStore: "footer offset {} is past the end of the file", footer_offset);
    }
    let mut bytes = vec![0u8; (footer_end - footer_offset) as usize];
    file.seek(SeekFrom::Start(footer_offset))
        .and_then(|_| file.read_exact(&mut bytes))
        .map_err(io_error("reading the footer"))?;
    decode_footer(&bytes)
}

/// Turn an I/O error on the container file into a store failure naming what was attempted.
fn io_error(what: &'static str) -> impl FnOnce(io::Error) -> NtupleError {
    move |e| ntuple_err!(BackingStore: "{}: {}", what, e)
}

#[cfg(test)]
mod tests {
    use ntuple_error::ErrorKind;

    use super::*;
    use crate::attribute::AttrValue;

    #[test]
    fn empty_container_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.ntpl");
        drop(Container::create(&path, CreateMode::Exclusive).unwrap());

        let container = Container::open(&path, OpenMode::ReadOnly).unwrap();
        assert!(!container.is_writable());
        assert!(container.root().members().unwrap().is_empty());
    }

    #[test]
    fn exclusive_create_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("once.ntpl");
        Container::create(&path, CreateMode::Exclusive)
            .unwrap()
            .close()
            .unwrap();
        let err = Container::create(&path, CreateMode::Exclusive).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackingStore);
        assert!(Container::create(&path, CreateMode::Truncate).is_ok());
    }

    #[test]
    fn garbage_is_not_a_container() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.ntpl");
        std::fs::write(&path, b"definitely not a container file").unwrap();
        let err = Container::open(&path, OpenMode::ReadOnly).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackingStore);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn full_device_is_a_store_failure() {
        let err = Container::create("/dev/full", CreateMode::Truncate).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackingStore);
    }

    #[test]
    fn read_only_handles_reject_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.ntpl");
        Container::create(&path, CreateMode::Exclusive)
            .unwrap()
            .close()
            .unwrap();
        let container = Container::open(&path, OpenMode::ReadOnly).unwrap();
        assert!(container.root().create_group("events").is_err());
        assert!(container.flush().is_err());
    }

    #[test]
    fn latest_footer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("twice.ntpl");
        let container = Container::create(&path, CreateMode::Exclusive).unwrap();
        container.root().set_attribute("run", AttrValue::Int(1)).unwrap();
        container.flush().unwrap();
        container.root().set_attribute("run", AttrValue::Int(2)).unwrap();
        container.close().unwrap();

        let reopened = Container::open(&path, OpenMode::ReadOnly).unwrap();
        assert_eq!(
            reopened.root().attribute("run").unwrap(),
            Some(AttrValue::Int(2))
        );
    }

    #[test]
    fn clones_share_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let container = Container::create(dir.path().join("shared.ntpl"), CreateMode::Exclusive)
            .unwrap();
        let other = container.clone();
        assert!(container.same_handle(&other));
        other.root().create_group("events").unwrap();
        assert!(container.root().contains("events").unwrap());
        // Not the last handle, so this only flushes.
        other.close().unwrap();
        assert!(container.is_valid());
    }
}
