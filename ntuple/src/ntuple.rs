use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt::{Debug, Formatter};
use std::path::PathBuf;

use itertools::Itertools;
use ntuple_error::{ErrorMode, NtupleResult, ntuple_bail, ntuple_err};
use ntuple_store::{
    Container, CreateMode, Dataset, DatasetSpec, ElementType, Filter, Group, Values,
};
use parking_lot::ReentrantMutex;

use crate::cell::Cell;
use crate::column::{ColumnDescriptor, Representation};

pub const DEFAULT_CAPACITY: usize = 1000;

/// How a [`Locator::Path`] is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PathMode {
    /// Create the file, replacing any existing one.
    Create,
    /// Create the file; fail if it exists.
    CreateExclusive,
    /// Open the file for writing, creating it if it does not exist.
    #[default]
    Open,
}

/// Where an [`Ntuple`] places its group.
#[derive(Debug, Clone)]
pub enum Locator {
    /// Inside an existing group.
    Group(Group),
    /// At the root of an open container.
    Container(Container),
    /// At the root of the container at `path`.
    Path { path: PathBuf, mode: PathMode },
}

impl Locator {
    pub fn path(path: impl Into<PathBuf>, mode: PathMode) -> Self {
        Locator::Path {
            path: path.into(),
            mode,
        }
    }

    fn parent_group(self) -> NtupleResult<Group> {
        Ok(match self {
            Locator::Group(group) => group,
            Locator::Container(container) => container.root(),
            Locator::Path { path, mode } => match mode {
                PathMode::Create => Container::create(path, CreateMode::Truncate)?,
                PathMode::CreateExclusive => Container::create(path, CreateMode::Exclusive)?,
                PathMode::Open => Container::open_or_create(path)?,
            }
            .root(),
        })
    }
}

impl From<Group> for Locator {
    fn from(group: Group) -> Self {
        Locator::Group(group)
    }
}

impl From<Container> for Locator {
    fn from(container: Container) -> Self {
        Locator::Container(container)
    }
}

/// Configuration of an [`Ntuple`].
#[derive(Debug, Clone)]
pub struct NtupleBuilder {
    name: String,
    columns: Vec<ColumnDescriptor>,
    representation: Option<Representation>,
    overwrite: bool,
    capacity: usize,
    chunk_rows: Option<u64>,
    compression: Option<Vec<Filter>>,
    error_mode: ErrorMode,
}

impl NtupleBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            representation: None,
            overwrite: false,
            capacity: DEFAULT_CAPACITY,
            chunk_rows: None,
            compression: Some(vec![Filter::DEFAULT_DEFLATE]),
            error_mode: ErrorMode::default(),
        }
    }

    pub fn column(mut self, column: ColumnDescriptor) -> Self {
        self.columns.push(column);
        self
    }

    pub fn columns(mut self, columns: impl IntoIterator<Item = ColumnDescriptor>) -> Self {
        self.columns.extend(columns);
        self
    }

    /// Store every column with `representation`, whatever its own setting.
    pub fn representation(mut self, representation: Representation) -> Self {
        self.representation = Some(representation);
        self
    }

    /// Replace datasets that already exist under the table's group.
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Rows buffered in memory before they are flushed.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Rows per stored chunk. Defaults to the capacity, up to
    /// [`DEFAULT_CHUNK_ROWS`](ntuple_store::DEFAULT_CHUNK_ROWS), so that a full buffer
    /// flushes into whole chunks.
    pub fn chunk_rows(mut self, chunk_rows: u64) -> Self {
        self.chunk_rows = Some(chunk_rows);
        self
    }

    fn effective_chunk_rows(&self) -> u64 {
        self.chunk_rows
            .unwrap_or_else(|| (self.capacity as u64).min(ntuple_store::DEFAULT_CHUNK_ROWS))
    }

    /// The filter pipeline of every column, or `None` to store chunks uncompressed.
    pub fn compression(mut self, filters: Option<Vec<Filter>>) -> Self {
        self.compression = filters;
        self
    }

    pub fn error_mode(mut self, error_mode: ErrorMode) -> Self {
        self.error_mode = error_mode;
        self
    }

    pub fn build(self, locator: impl Into<Locator>) -> NtupleResult<Ntuple> {
        let error_mode = self.error_mode;
        self.try_build(locator.into())
            .map_err(|e| error_mode.reported(e))
    }

    fn try_build(self, locator: Locator) -> NtupleResult<Ntuple> {
        if self.columns.is_empty() {
            ntuple_bail!("ntuple {} has no columns", self.name);
        }
        if self.capacity == 0 {
            ntuple_bail!("ntuple {} must buffer at least one row", self.name);
        }
        let mut names = HashSet::new();
        if let Some(duplicate) = self.columns.iter().find(|c| !names.insert(c.name())) {
            ntuple_bail!("ntuple {} has two columns named {}", self.name, duplicate.name());
        }

        let group = locator.parent_group()?.require_group(&self.name)?;

        let chunk_rows = self.effective_chunk_rows();
        let columns: Vec<ColumnDescriptor> = match self.representation {
            Some(representation) => self
                .columns
                .into_iter()
                .map(|c| c.with_representation(representation))
                .collect(),
            None => self.columns,
        };
        let filters = self.compression.unwrap_or_default();

        // Check every column first so that a conflict leaves the group untouched.
        if !self.overwrite {
            for column in &columns {
                if group.contains(column.name())? {
                    ntuple_bail!(
                        SchemaConflict: "{} already exists",
                        group.child_path(column.name())
                    );
                }
            }
        }

        let mut datasets = Vec::with_capacity(columns.len());
        for column in &columns {
            if group.contains(column.name())? {
                log::debug!("replacing {}", group.child_path(column.name()));
                group.unlink(column.name())?;
            }
            let spec = DatasetSpec::new(column.element(), column.extents())
                .with_byte_order(column.stored_byte_order())
                .with_chunk_rows(chunk_rows)
                .with_filters(filters.clone());
            datasets.push(group.create_dataset(column.name(), &spec)?);
        }

        let buffers = columns
            .iter()
            .map(|c| Values::with_capacity(c.element(), self.capacity * c.element_size()))
            .collect();
        log::debug!(
            "created ntuple {} with columns [{}]",
            group.path(),
            columns.iter().join(", ")
        );

        Ok(Ntuple {
            state: ReentrantMutex::new(RefCell::new(TableState {
                buffers,
                pending: vec![0; columns.len()],
                written: vec![0; columns.len()],
            })),
            group,
            columns,
            datasets,
            capacity: self.capacity,
            error_mode: self.error_mode,
        })
    }
}

struct TableState {
    buffers: Vec<Values>,
    /// Rows buffered per column. Equal for every column unless a flush partly failed.
    pending: Vec<usize>,
    /// Rows on disk per column.
    written: Vec<u64>,
}

/// A buffered, typed, columnar table.
///
/// Rows are inserted one at a time and held in one buffer per column. When the buffers hold
/// `capacity` rows they are flushed, each column to its own dataset in the table's group.
/// The remaining rows are flushed when the table is dropped.
///
/// Inserts and flushes from several threads are serialized.
pub struct Ntuple {
    group: Group,
    columns: Vec<ColumnDescriptor>,
    datasets: Vec<Dataset>,
    capacity: usize,
    error_mode: ErrorMode,
    state: ReentrantMutex<RefCell<TableState>>,
}

impl Ntuple {
    pub fn builder(name: impl Into<String>) -> NtupleBuilder {
        NtupleBuilder::new(name)
    }

    /// Insert one row, one cell per column.
    ///
    /// The row is validated as a whole before anything is buffered, so a failed insert leaves
    /// the table unchanged.
    pub fn insert(&self, row: &[Cell]) -> NtupleResult<()> {
        self.validate(row).map_err(|e| self.error_mode.reported(e))?;

        let guard = self.state.lock();
        let full = guard
            .borrow()
            .pending
            .iter()
            .any(|pending| *pending >= self.capacity);
        if full {
            self.flush()?;
        }

        let mut state = guard.borrow_mut();
        let TableState {
            buffers, pending, ..
        } = &mut *state;
        for (i, (cell, column)) in row.iter().zip(&self.columns).enumerate() {
            append(&mut buffers[i], cell, column);
            pending[i] += 1;
        }
        Ok(())
    }

    fn validate(&self, row: &[Cell]) -> NtupleResult<()> {
        if row.len() != self.columns.len() {
            ntuple_bail!(
                "{} expects {} cells per row, got {}",
                self.group.path(),
                self.columns.len(),
                row.len()
            );
        }
        for (cell, column) in row.iter().zip(&self.columns) {
            if let Cell::Fixed { element, bytes } = cell {
                if element.byte_width().is_some_and(|width| bytes.len() % width != 0) {
                    ntuple_bail!(
                        "column {} got {} bytes, not a whole number of {} elements",
                        column.name(),
                        bytes.len(),
                        element
                    );
                }
            }
            let (Some(element), Some(len)) = (cell.element(), cell.len()) else {
                continue;
            };
            if element != column.element() {
                ntuple_bail!(
                    "column {} holds {} elements, got {}",
                    column.name(),
                    column.element(),
                    element
                );
            }
            if len != column.element_size() {
                ntuple_bail!(
                    "column {} takes {} elements per row, got {}",
                    column.name(),
                    column.element_size(),
                    len
                );
            }
        }
        Ok(())
    }

    /// Write every buffered row to disk.
    ///
    /// Each column is written independently. A column that fails keeps its rows buffered for
    /// the next flush; the error names every failed column.
    pub fn flush(&self) -> NtupleResult<()> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let TableState {
            buffers,
            pending,
            written,
        } = &mut *state;

        let mut failures = Vec::new();
        for (i, dataset) in self.datasets.iter().enumerate() {
            if pending[i] == 0 {
                continue;
            }
            let rows = pending[i] as u64;
            let result = dataset
                .extend(written[i] + rows)
                .and_then(|()| dataset.write_rows(written[i], &buffers[i]));
            match result {
                Ok(()) => {
                    buffers[i].clear();
                    pending[i] = 0;
                    written[i] += rows;
                }
                Err(err) => {
                    log::debug!("flush of {} failed: {}", dataset.path(), err.message());
                    failures.push((self.columns[i].name(), err));
                }
            }
        }

        if failures.is_empty() {
            return Ok(());
        }
        let err = ntuple_err!(
            BackingStore: "failed to flush {} of {}: {}",
            if failures.len() == 1 { "column" } else { "columns" },
            self.group.path(),
            failures
                .iter()
                .map(|(name, err)| format!("{name} ({})", err.message()))
                .join(", ")
        );
        Err(self.error_mode.reported(err))
    }

    /// Rows inserted but not yet flushed.
    pub fn buffered_rows(&self) -> usize {
        let guard = self.state.lock();
        let state = guard.borrow();
        state.pending.iter().copied().max().unwrap_or_default()
    }

    /// Rows flushed to every column's dataset.
    pub fn rows_written(&self) -> u64 {
        let guard = self.state.lock();
        let state = guard.borrow();
        state.written.iter().copied().min().unwrap_or_default()
    }

    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The group holding one dataset per column.
    pub fn group(&self) -> &Group {
        &self.group
    }

    pub fn dataset(&self, index: usize) -> Option<&Dataset> {
        self.datasets.get(index)
    }

    pub fn error_mode(&self) -> ErrorMode {
        self.error_mode
    }
}

/// Append one validated cell to a column buffer.
fn append(buffer: &mut Values, cell: &Cell, column: &ColumnDescriptor) {
    match (buffer, cell) {
        (Values::Fixed { bytes, .. }, Cell::Fixed { bytes: cell, .. }) => {
            bytes.extend_from_slice(cell);
        }
        (Values::Text(values), Cell::Text(cell)) => values.extend(cell.iter().cloned()),
        (Values::Fixed { element, bytes }, Cell::Default) => {
            let width = element.byte_width().unwrap_or(1);
            bytes.resize(bytes.len() + column.element_size() * width, 0);
        }
        (Values::Text(values), Cell::Default) => {
            values.resize(values.len() + column.element_size(), String::new());
        }
        (buffer, cell) => {
            // Ruled out by validation.
            log::error!(
                "dropping {:?} cell for {} column {}",
                cell.element().unwrap_or(ElementType::Text),
                buffer.element(),
                column.name()
            );
        }
    }
}

impl Drop for Ntuple {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            self.error_mode
                .report_suppressed(&err.with_context("flush on drop"));
        }
    }
}

impl Debug for Ntuple {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ntuple")
            .field("group", &self.group.path())
            .field("columns", &self.columns)
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use ntuple_error::ErrorKind;
    use ntuple_store::{ByteOrder, OpenMode};
    use rstest::rstest;

    use super::*;
    use crate::row;

    fn columns() -> Vec<ColumnDescriptor> {
        vec![
            ColumnDescriptor::scalar("run", ElementType::U32).unwrap(),
            ColumnDescriptor::new("p", ElementType::F64, &[3]).unwrap(),
            ColumnDescriptor::scalar("tag", ElementType::Text).unwrap(),
        ]
    }

    fn scratch() -> (tempfile::TempDir, Container) {
        let dir = tempfile::tempdir().unwrap();
        let container =
            Container::create(dir.path().join("table.ntpl"), CreateMode::Exclusive).unwrap();
        (dir, container)
    }

    #[test]
    fn rows_round_trip_through_flush() {
        let (_dir, container) = scratch();
        let table = Ntuple::builder("events")
            .columns(columns())
            .capacity(2)
            .chunk_rows(2)
            .build(container.clone())
            .unwrap();
        for i in 0..5u32 {
            let p = [f64::from(i), 0.5, -1.0];
            table.insert(&row![i, p, format!("e{i}")]).unwrap();
        }
        // Two automatic flushes of two rows, one row still buffered.
        assert_eq!(table.rows_written(), 4);
        assert_eq!(table.buffered_rows(), 1);
        table.flush().unwrap();
        assert_eq!(table.buffered_rows(), 0);

        let group = container.root().open_group("events").unwrap();
        let run = group.open_dataset("run").unwrap();
        assert_eq!(run.shape().unwrap(), vec![5, 1]);
        assert_eq!(
            run.read_all().unwrap().to_vec::<u32>().unwrap(),
            vec![0, 1, 2, 3, 4]
        );
        let p = group.open_dataset("p").unwrap().read_rows(4, 1).unwrap();
        assert_eq!(p.to_vec::<f64>().unwrap(), vec![4.0, 0.5, -1.0]);
        let tags = group.open_dataset("tag").unwrap().read_all().unwrap();
        assert_eq!(tags.as_strings().unwrap()[3], "e3");
    }

    #[test]
    fn default_cells_fill_with_defaults() {
        let (_dir, container) = scratch();
        let table = Ntuple::builder("events")
            .columns(columns())
            .build(container.clone())
            .unwrap();
        table.insert(&[Cell::Default, Cell::Default, Cell::Default]).unwrap();
        table.insert(&row![7u32, None::<f64>, "x"]).unwrap();
        table.flush().unwrap();

        let group = table.group();
        assert_eq!(
            group.open_dataset("run").unwrap().read_all().unwrap().to_vec::<u32>().unwrap(),
            vec![0, 7]
        );
        assert_eq!(
            group.open_dataset("p").unwrap().read_all().unwrap().to_vec::<f64>().unwrap(),
            vec![0.0; 6]
        );
        assert_eq!(
            group.open_dataset("tag").unwrap().read_all().unwrap().as_strings().unwrap(),
            &["".to_string(), "x".to_string()]
        );
    }

    #[test]
    fn bad_rows_are_rejected_whole() {
        let (_dir, container) = scratch();
        let table = Ntuple::builder("events")
            .columns(columns())
            .error_mode(ErrorMode::Silent)
            .build(container)
            .unwrap();
        table.insert(&row![1u32, [1.0f64, 2.0, 3.0], "ok"]).unwrap();

        for bad in [
            row![2u32, [1.0f64, 2.0], "short"].to_vec(),
            row![2i32, [1.0f64, 2.0, 3.0], "wrong type"].to_vec(),
            row![2u32, [1.0f64, 2.0, 3.0]].to_vec(),
        ] {
            let err = table.insert(&bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        }
        assert_eq!(table.buffered_rows(), 1);
    }

    #[test]
    fn partial_elements_are_rejected() {
        let (_dir, container) = scratch();
        let table = Ntuple::builder("t")
            .column(ColumnDescriptor::scalar("x", ElementType::U32).unwrap())
            .error_mode(ErrorMode::Silent)
            .build(container)
            .unwrap();
        let ragged = Cell::Fixed {
            element: ElementType::U32,
            bytes: vec![1, 0, 0, 0, 9],
        };
        let err = table.insert(&[ragged]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(table.buffered_rows(), 0);

        table.insert(&row![7u32]).unwrap();
        table.flush().unwrap();
        assert_eq!(
            table.dataset(0).unwrap().read_all().unwrap().to_vec::<u32>().unwrap(),
            vec![7]
        );
    }

    #[rstest]
    #[case(DEFAULT_CAPACITY, None, DEFAULT_CAPACITY as u64)]
    #[case(10, None, 10)]
    #[case(100_000, None, ntuple_store::DEFAULT_CHUNK_ROWS)]
    #[case(10, Some(4), 4)]
    fn chunks_follow_the_capacity(
        #[case] capacity: usize,
        #[case] chunk_rows: Option<u64>,
        #[case] expected: u64,
    ) {
        let (_dir, container) = scratch();
        let mut builder = Ntuple::builder("t")
            .column(ColumnDescriptor::scalar("x", ElementType::U8).unwrap())
            .capacity(capacity);
        if let Some(chunk_rows) = chunk_rows {
            builder = builder.chunk_rows(chunk_rows);
        }
        let table = builder.build(container).unwrap();
        assert_eq!(table.dataset(0).unwrap().chunk_rows().unwrap(), expected);
    }

    #[test]
    fn empty_flush_is_a_no_op() {
        let (_dir, container) = scratch();
        let table = Ntuple::builder("events")
            .columns(columns())
            .build(container)
            .unwrap();
        table.flush().unwrap();
        table.flush().unwrap();
        assert_eq!(table.rows_written(), 0);
        assert_eq!(table.dataset(0).unwrap().rows().unwrap(), 0);
    }

    #[test]
    fn existing_columns_conflict_unless_overwritten() {
        let (_dir, container) = scratch();
        let table = Ntuple::builder("events")
            .columns(columns())
            .build(container.clone())
            .unwrap();
        table.insert(&row![1u32, [0.0f64; 3], "a"]).unwrap();
        drop(table);

        let err = Ntuple::builder("events")
            .columns(columns())
            .error_mode(ErrorMode::Raise)
            .build(container.clone())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaConflict);
        // The conflict left the existing data alone.
        let run = container.root().open_group("events").unwrap().open_dataset("run").unwrap();
        assert_eq!(run.rows().unwrap(), 1);

        let table = Ntuple::builder("events")
            .columns(columns())
            .overwrite(true)
            .build(container)
            .unwrap();
        assert_eq!(table.dataset(0).unwrap().rows().unwrap(), 0);
    }

    #[test]
    fn drop_flushes_the_remainder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dropped.ntpl");
        {
            let table = Ntuple::builder("t")
                .column(ColumnDescriptor::scalar("x", ElementType::I64).unwrap())
                .build(Locator::path(&path, PathMode::CreateExclusive))
                .unwrap();
            for i in 0..10i64 {
                table.insert(&row![i]).unwrap();
            }
        }
        let container = Container::open(&path, OpenMode::ReadOnly).unwrap();
        let x = container.root().open_group("t").unwrap().open_dataset("x").unwrap();
        assert_eq!(x.read_all().unwrap().to_vec::<i64>().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn representation_override_applies_to_every_column() {
        let (_dir, container) = scratch();
        let table = Ntuple::builder("events")
            .columns(columns())
            .representation(Representation::BigEndianIeee)
            .compression(None)
            .build(container)
            .unwrap();
        for dataset in (0..3).filter_map(|i| table.dataset(i)) {
            assert_eq!(dataset.byte_order().unwrap(), ByteOrder::Big);
            assert!(dataset.filters().unwrap().is_empty());
        }
    }

    #[test]
    fn invalid_configurations() {
        let (_dir, container) = scratch();
        let no_columns = Ntuple::builder("t").error_mode(ErrorMode::Silent).build(container.clone());
        assert_eq!(no_columns.unwrap_err().kind(), ErrorKind::InvalidArgument);

        let duplicate = Ntuple::builder("t")
            .column(ColumnDescriptor::scalar("x", ElementType::I8).unwrap())
            .column(ColumnDescriptor::scalar("x", ElementType::I8).unwrap())
            .error_mode(ErrorMode::Silent)
            .build(container);
        assert_eq!(duplicate.unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn tables_are_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Ntuple>();
    }
}
