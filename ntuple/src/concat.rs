//! Concatenation of many containers into one growing output, by a group of workers.
//!
//! Every worker constructs a [`Concatenator`] over the same output and calls
//! [`Concatenator::add_file`] with the same inputs in the same order. The workers visit
//! each input's groups and datasets in lock-step: rank 0 performs metadata changes on the
//! output and the outcome is agreed by all, then every worker transfers its share of each
//! dataset's rows as computed by [`crate::numerology`].

use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};
use std::path::Path;

use humansize::{BINARY, format_size};
use itertools::Itertools;
use ntuple_error::{ErrorKind, ErrorMode, NtupleError, NtupleResult, ntuple_bail, ntuple_err};
use ntuple_store::comm::Communicator;
use ntuple_store::{
    AttrValue, Container, Dataset, DatasetSpec, ElementType, Group, NodeKind, OpenMode, Values,
};
use regex::Regex;

use crate::numerology::{ConcatState, NumerologyResult};

pub const DEFAULT_MEMORY_BYTES: u64 = 256 << 20;

/// Configuration of a [`Concatenator`].
#[derive(Debug, Clone)]
pub struct ConcatOptions {
    /// Bytes of rows each worker may hold in memory at once.
    pub memory_bytes: u64,
    /// Name of a text dataset recording, for every row, the file it came from.
    pub provenance: Option<String>,
    /// When non-empty, only top-level groups whose name matches one of these are merged.
    pub group_filters: Vec<Regex>,
    /// Create output datasets with the filter pipeline of the first input.
    pub propagate_filters: bool,
    /// Synchronize all workers around every write.
    pub collective: bool,
    pub error_mode: ErrorMode,
}

impl Default for ConcatOptions {
    fn default() -> Self {
        Self {
            memory_bytes: DEFAULT_MEMORY_BYTES,
            provenance: None,
            group_filters: Vec::new(),
            propagate_filters: true,
            collective: false,
            error_mode: ErrorMode::default(),
        }
    }
}

impl ConcatOptions {
    pub fn with_memory_bytes(mut self, memory_bytes: u64) -> Self {
        self.memory_bytes = memory_bytes;
        self
    }

    pub fn with_provenance(mut self, name: impl Into<String>) -> Self {
        self.provenance = Some(name.into());
        self
    }

    pub fn with_group_filter(mut self, filter: Regex) -> Self {
        self.group_filters.push(filter);
        self
    }

    pub fn with_propagate_filters(mut self, propagate_filters: bool) -> Self {
        self.propagate_filters = propagate_filters;
        self
    }

    pub fn with_collective(mut self, collective: bool) -> Self {
        self.collective = collective;
        self
    }

    pub fn with_error_mode(mut self, error_mode: ErrorMode) -> Self {
        self.error_mode = error_mode;
        self
    }

    fn group_allowed(&self, name: &str) -> bool {
        self.group_filters.is_empty() || self.group_filters.iter().any(|r| r.is_match(name))
    }
}

/// What a concatenation did. Identical on every worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConcatSummary {
    /// Inputs that could be opened.
    pub files: usize,
    /// Datasets merged without error, counted once per input.
    pub datasets: usize,
    /// Rows transferred by datasets merged without error.
    pub rows: u64,
    /// One entry per failed file, group or dataset.
    pub failures: Vec<ConcatFailure>,
}

impl ConcatSummary {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A file, group or dataset that could not be merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcatFailure {
    pub kind: ErrorKind,
    /// The error message, prefixed with the path that failed.
    pub message: String,
}

impl Display for ConcatFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

struct OutputState {
    dataset: Dataset,
    spec: DatasetSpec,
    state: ConcatState,
}

/// Where the rows of one merged dataset come from.
enum Source<'a> {
    Dataset(&'a Dataset),
    /// A text value repeated for every row.
    Repeat(&'a str),
}

impl Source<'_> {
    fn read(&self, start: u64, count: u64) -> NtupleResult<Values> {
        match self {
            Source::Dataset(dataset) => dataset.read_rows(start, count),
            Source::Repeat(value) => Ok(Values::Text(vec![value.to_string(); count as usize])),
        }
    }
}

/// One worker's side of a concatenation.
pub struct Concatenator<C: Communicator> {
    output: Container,
    comm: C,
    options: ConcatOptions,
    states: HashMap<String, OutputState>,
    summary: ConcatSummary,
}

impl<C: Communicator> Concatenator<C> {
    pub fn new(output: Container, comm: C, options: ConcatOptions) -> NtupleResult<Self> {
        if !output.is_writable() {
            ntuple_bail!("{} is not open for writing", output.path().display());
        }
        if options.memory_bytes == 0 {
            ntuple_bail!("the memory budget must be positive");
        }
        if comm.rank() == 0 {
            log::info!(
                "merging into {} with {} worker(s), {} each",
                output.path().display(),
                comm.size(),
                format_size(options.memory_bytes, BINARY)
            );
        }
        Ok(Self {
            output,
            comm,
            options,
            states: HashMap::new(),
            summary: ConcatSummary::default(),
        })
    }

    pub fn options(&self) -> &ConcatOptions {
        &self.options
    }

    pub fn summary(&self) -> &ConcatSummary {
        &self.summary
    }

    /// Merge the container at `path`. Returns whether every dataset in it merged cleanly.
    pub fn add_file(&mut self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let label = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let opened = self.open_input(path);
        match self.agree(opened, "opening the input") {
            Ok(input) => self.add_container(&input, &label),
            Err(err) => self.fail(&path.display().to_string(), err),
        }
    }

    fn open_input(&self, path: &Path) -> NtupleResult<Container> {
        if let (Ok(input), Ok(output)) = (path.canonicalize(), self.output.path().canonicalize()) {
            if input == output {
                ntuple_bail!("{} is the output itself", path.display());
            }
        }
        Container::open(path, OpenMode::ReadOnly)
    }

    /// Merge an open container, recording `label` as its provenance.
    pub fn add_container(&mut self, input: &Container, label: &str) -> bool {
        if self.comm.rank() == 0 {
            log::info!("merging {}", input.path().display());
        }
        self.summary.files += 1;
        let failures = self.summary.failures.len();
        let output = self.output.root();
        self.visit_group(&input.root(), &output, label);
        self.summary.failures.len() == failures
    }

    fn visit_group(&mut self, input: &Group, output: &Group, label: &str) {
        let members = match self.agree(input.members(), "listing members") {
            Ok(members) => members,
            Err(err) => {
                self.fail(&input.path(), err);
                return;
            }
        };

        let provenance = self
            .options
            .provenance
            .clone()
            .filter(|name| !members.iter().any(|(member, _)| member == name));
        let mut first_dataset = None;

        for (name, kind) in members {
            match kind {
                NodeKind::Group => {
                    if input.is_root() && !self.options.group_allowed(&name) {
                        log::debug!("skipping group {}", input.child_path(&name));
                        continue;
                    }
                    match self.output_group(input, output, &name) {
                        Ok((input_child, output_child)) => {
                            self.visit_group(&input_child, &output_child, label)
                        }
                        Err(err) => {
                            self.fail(&output.child_path(&name), err);
                        }
                    }
                }
                NodeKind::Dataset => {
                    let opened = self.agree(input.open_dataset(&name), "opening the input dataset");
                    match opened {
                        Ok(dataset) => {
                            self.merge_dataset(&dataset, output, &name);
                            first_dataset.get_or_insert(dataset);
                        }
                        Err(err) => {
                            self.fail(&input.child_path(&name), err);
                        }
                    }
                }
            }
        }

        if let (Some(name), Some(first)) = (provenance, first_dataset) {
            self.merge_provenance(&first, output, &name, label);
        }
    }

    /// Open the input group `name` and create-or-open its output counterpart, carrying over
    /// attributes the output group does not have yet.
    fn output_group(
        &self,
        input: &Group,
        output: &Group,
        name: &str,
    ) -> NtupleResult<(Group, Group)> {
        let input_child = self.agree(input.open_group(name), "opening the input group")?;
        let output_child = self.on_rank_zero(
            "creating the output group",
            || {
                let group = output.require_group(name)?;
                for (key, value) in input_child.attributes()? {
                    if group.attribute(&key)?.is_none() {
                        group.set_attribute(&key, value)?;
                    }
                }
                Ok(group)
            },
            || output.open_group(name),
        )?;
        Ok((input_child, output_child))
    }

    fn merge_dataset(&mut self, input: &Dataset, output: &Group, name: &str) -> bool {
        let path = output.child_path(name);
        let shape = input
            .spec()
            .and_then(|spec| Ok((spec, input.rows()?, input.attributes()?)));
        let result = self
            .agree(shape, "reading the input shape")
            .and_then(|(spec, rows, attributes)| {
                self.prepare(output, name, &spec, rows, || Ok(attributes))?;
                self.transfer(&path, &Source::Dataset(input), rows)
            });
        self.record(&path, result)
    }

    fn merge_provenance(&mut self, first: &Dataset, output: &Group, name: &str, label: &str) -> bool {
        let path = output.child_path(name);
        let result = self
            .agree(first.spec().and_then(|spec| Ok((spec, first.rows()?))), "reading the input shape")
            .and_then(|(first_spec, rows)| {
                let mut spec = DatasetSpec::new(ElementType::Text, &[1])
                    .with_chunk_rows(first_spec.chunk_rows);
                if self.options.propagate_filters {
                    spec = spec.with_filters(first_spec.filters);
                }
                self.prepare(output, name, &spec, rows, || Ok(Default::default()))?;
                self.transfer(&path, &Source::Repeat(label), rows)
            });
        self.record(&path, result)
    }

    /// Create or check the output dataset for `name` and grow it by `rows`.
    fn prepare<F>(
        &mut self,
        output: &Group,
        name: &str,
        spec: &DatasetSpec,
        rows: u64,
        attributes: F,
    ) -> NtupleResult<()>
    where
        F: FnOnce() -> NtupleResult<BTreeMap<String, AttrValue>>,
    {
        let path = output.child_path(name);
        if !self.states.contains_key(&path) {
            let state = self.first_sighting(output, name, spec, attributes)?;
            self.states.insert(path.clone(), state);
        }
        let entry = self
            .states
            .get(&path)
            .ok_or_else(|| ntuple_err!("no state for {}", path))?;
        check_compatible(&entry.spec, spec)?;

        let dataset = entry.dataset.clone();
        let target = entry.state.total_rows + rows;
        if rows > 0 {
            self.on_rank_zero("extending the output", || dataset.extend(target), || Ok(()))?;
        }
        Ok(())
    }

    /// Set up the output dataset for a path seen for the first time: create it, or reopen
    /// it if the output already has it.
    fn first_sighting<F>(
        &self,
        output: &Group,
        name: &str,
        spec: &DatasetSpec,
        attributes: F,
    ) -> NtupleResult<OutputState>
    where
        F: FnOnce() -> NtupleResult<BTreeMap<String, AttrValue>>,
    {
        let dataset = self.on_rank_zero(
            "creating the output dataset",
            || {
                if output.contains(name)? {
                    let dataset = output.open_dataset(name)?;
                    check_compatible(&dataset.spec()?, spec)?;
                    log::debug!("appending to {}", dataset.path());
                    return Ok(dataset);
                }
                let mut out_spec = spec.clone();
                if !self.options.propagate_filters {
                    out_spec.filters.clear();
                }
                let dataset = output.create_dataset(name, &out_spec)?;
                for (key, value) in attributes()? {
                    dataset.set_attribute(&key, value)?;
                }
                Ok(dataset)
            },
            || output.open_dataset(name),
        )?;

        let out_spec = self.agree(dataset.spec(), "reading the output shape")?;
        let total_rows = self.agree(dataset.rows(), "reading the output shape")?;
        let state = ConcatState::new(
            out_spec.row_size_bytes(),
            out_spec.chunk_rows,
            self.options.memory_bytes,
            total_rows,
        )?;
        if self.comm.rank() == 0 {
            log::debug!(
                "{}: {} rows per worker and iteration",
                dataset.path(),
                state.buffer_rows
            );
        }
        Ok(OutputState {
            dataset,
            spec: out_spec,
            state,
        })
    }

    /// Move `rows` rows from `source` to the end of the output dataset at `path`.
    ///
    /// Every worker runs every iteration, moving zero rows when it has no share or has
    /// already failed, so that collective synchronization stays matched.
    fn transfer(&mut self, path: &str, source: &Source<'_>, rows: u64) -> NtupleResult<()> {
        let entry = self
            .states
            .get_mut(path)
            .ok_or_else(|| ntuple_err!("no state for {}", path))?;
        let ranks = self.comm.size();
        let rank = self.comm.rank();

        let mut written = 0;
        let mut failure: Option<NtupleError> = None;
        while written < rows {
            let plan = entry.state.plan(written, rows, ranks);
            let share = if failure.is_some() {
                NumerologyResult::default()
            } else {
                plan.for_rank(rank)
            };

            let read = if share.rows > 0 {
                source.read(share.input_offset, share.rows)
            } else {
                Ok(Values::empty(entry.spec.element))
            };
            if self.options.collective {
                self.comm.barrier();
            }
            let result = read.and_then(|values| {
                if share.rows > 0 {
                    entry.dataset.write_rows(share.output_offset, &values)
                } else {
                    Ok(())
                }
            });
            if self.options.collective {
                self.comm.barrier();
            }

            if let Err(err) = result {
                failure = Some(ntuple_err!(
                    Transfer: "rows [{}, {}) on worker {}: {}",
                    share.output_offset,
                    share.output_offset + share.rows,
                    rank,
                    err.message()
                ));
            }
            written += plan.iteration_rows;
            entry.state.advance(&plan);
        }

        self.agree(failure.map_or(Ok(()), Err), "transferring rows")?;
        self.summary.rows += rows;
        Ok(())
    }

    /// Flush the output and return the summary agreed by all workers.
    pub fn finish(mut self) -> ConcatSummary {
        let flushed = if self.comm.rank() == 0 {
            self.output.flush()
        } else {
            Ok(())
        };
        if let Err(err) = self.agree(flushed, "flushing the output") {
            let path = self.output.path().display().to_string();
            self.fail(&path, err);
        }
        if self.comm.rank() == 0 {
            if self.summary.is_success() {
                log::info!(
                    "merged {} rows of {} datasets from {} files",
                    self.summary.rows,
                    self.summary.datasets,
                    self.summary.files
                );
            } else {
                log::warn!(
                    "merge finished with {} failures: {}",
                    self.summary.failures.len(),
                    self.summary.failures.iter().join("; ")
                );
            }
        }
        self.summary
    }

    /// Run `create` on rank 0 and, once it succeeded there, `open` on every other rank.
    /// Every rank sees the same outcome.
    fn on_rank_zero<T>(
        &self,
        what: &str,
        create: impl FnOnce() -> NtupleResult<T>,
        open: impl FnOnce() -> NtupleResult<T>,
    ) -> NtupleResult<T> {
        if self.comm.rank() == 0 {
            let created = self.agree(create(), what)?;
            self.agree(Ok(created), what)
        } else {
            self.agree(Ok(()), what)?;
            self.agree(open(), what)
        }
    }

    /// Make a result symmetric: it is an error on every rank if it is an error on any.
    fn agree<T>(&self, result: NtupleResult<T>, what: &str) -> NtupleResult<T> {
        let ok = self.comm.all_agree(result.is_ok());
        match result {
            Ok(value) if ok => Ok(value),
            Ok(_) => Err(ntuple_err!(BackingStore: "{} failed on another worker", what)),
            Err(err) => Err(err),
        }
    }

    fn record(&mut self, path: &str, result: NtupleResult<()>) -> bool {
        match result {
            Ok(()) => {
                self.summary.datasets += 1;
                true
            }
            Err(err) => self.fail(path, err),
        }
    }

    fn fail(&mut self, path: &str, err: NtupleError) -> bool {
        let err = err.with_context(path.to_string());
        if self.comm.rank() == 0 {
            self.options.error_mode.report_suppressed(&err);
        }
        self.summary.failures.push(ConcatFailure {
            kind: err.kind(),
            message: err.message(),
        });
        false
    }
}

/// Two datasets can be merged when their rows have the same shape and element type.
fn check_compatible(output: &DatasetSpec, input: &DatasetSpec) -> NtupleResult<()> {
    if output.extents != input.extents {
        ntuple_bail!(
            ShapeIncompatible: "rows of shape {:?} cannot be appended to rows of shape {:?}",
            input.extents,
            output.extents
        );
    }
    if output.element != input.element {
        ntuple_bail!(
            ShapeIncompatible: "{} elements cannot be appended to {} elements",
            input.element,
            output.element
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use ntuple_store::comm::SingleProcess;
    use ntuple_store::{CreateMode, Filter};

    use super::*;

    fn write_input(path: &Path, values: &[i32], extents: &[u64]) {
        let container = Container::create(path, CreateMode::Exclusive).unwrap();
        let events = container.root().create_group("events").unwrap();
        events.set_attribute("source", path.display().to_string()).unwrap();
        let spec = DatasetSpec::new(ElementType::I32, extents)
            .with_chunk_rows(4)
            .with_filters([Filter::DEFAULT_DEFLATE]);
        let x = events.create_dataset("x", &spec).unwrap();
        let per_row = spec.elements_per_row();
        x.extend((values.len() / per_row) as u64).unwrap();
        x.write_rows(0, &Values::from_slice(values)).unwrap();
        container.close().unwrap();
    }

    #[test]
    fn single_worker_appends_inputs_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.ntpl");
        let b = dir.path().join("b.ntpl");
        write_input(&a, &[1, 2, 3, 4, 5], &[1]);
        write_input(&b, &[6, 7], &[1]);

        let output = Container::create(dir.path().join("out.ntpl"), CreateMode::Exclusive).unwrap();
        let mut concat = Concatenator::new(
            output.clone(),
            SingleProcess,
            ConcatOptions::default().with_provenance("file"),
        )
        .unwrap();
        assert!(concat.add_file(&a));
        assert!(concat.add_file(&b));
        let summary = concat.finish();
        assert!(summary.is_success(), "{:?}", summary.failures);
        assert_eq!(summary.files, 2);
        assert_eq!(summary.rows, 14);

        let events = output.root().open_group("events").unwrap();
        let x = events.open_dataset("x").unwrap();
        assert_eq!(
            x.read_all().unwrap().to_vec::<i32>().unwrap(),
            vec![1, 2, 3, 4, 5, 6, 7]
        );
        assert_eq!(x.filters().unwrap(), vec![Filter::DEFAULT_DEFLATE]);
        let file = events.open_dataset("file").unwrap().read_all().unwrap();
        assert_eq!(
            file.as_strings().unwrap().iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["a.ntpl"; 5].into_iter().chain(vec!["b.ntpl"; 2]).collect::<Vec<_>>()
        );
        // Group attributes come from the first input that has the group.
        assert_eq!(
            events.attribute("source").unwrap(),
            Some(a.display().to_string().into())
        );
    }

    #[test]
    fn incompatible_shapes_fail_only_that_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.ntpl");
        let b = dir.path().join("b.ntpl");
        write_input(&a, &[1, 2, 3, 4], &[2]);
        write_input(&b, &[1, 2, 3], &[3]);

        let output = Container::create(dir.path().join("out.ntpl"), CreateMode::Exclusive).unwrap();
        let mut concat = Concatenator::new(
            output.clone(),
            SingleProcess,
            ConcatOptions::default().with_error_mode(ErrorMode::Silent),
        )
        .unwrap();
        assert!(concat.add_file(&a));
        assert!(!concat.add_file(&b));
        let summary = concat.finish();
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].kind, ErrorKind::ShapeIncompatible);
        assert!(summary.failures[0].message.contains("/events/x"));
        assert_eq!(
            output.root().open_group("events").unwrap().open_dataset("x").unwrap().rows().unwrap(),
            2
        );
    }

    #[test]
    fn missing_inputs_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let output = Container::create(dir.path().join("out.ntpl"), CreateMode::Exclusive).unwrap();
        let mut concat = Concatenator::new(
            output,
            SingleProcess,
            ConcatOptions::default().with_error_mode(ErrorMode::Silent),
        )
        .unwrap();
        assert!(!concat.add_file(dir.path().join("nope.ntpl")));
        let summary = concat.finish();
        assert_eq!(summary.files, 0);
        assert!(!summary.is_success());
    }

    #[test]
    fn the_output_is_not_an_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.ntpl");
        let output = Container::create(&path, CreateMode::Exclusive).unwrap();
        output.flush().unwrap();
        let mut concat = Concatenator::new(
            output,
            SingleProcess,
            ConcatOptions::default().with_error_mode(ErrorMode::Silent),
        )
        .unwrap();
        assert!(!concat.add_file(&path));
    }

    #[test]
    fn group_filters_apply_to_top_level_groups() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.ntpl");
        {
            let container = Container::create(&input, CreateMode::Exclusive).unwrap();
            let root = container.root();
            for group in ["keep", "drop"] {
                let g = root.create_group(group).unwrap();
                let ds = g
                    .create_dataset("n", &DatasetSpec::new(ElementType::U8, &[1]))
                    .unwrap();
                ds.extend(1).unwrap();
                ds.write_rows(0, &Values::from_slice(&[9u8])).unwrap();
            }
            let top = root
                .create_dataset("top", &DatasetSpec::new(ElementType::U8, &[1]))
                .unwrap();
            top.extend(1).unwrap();
        }

        let output = Container::create(dir.path().join("out.ntpl"), CreateMode::Exclusive).unwrap();
        let options = ConcatOptions::default().with_group_filter(Regex::new("^ke").unwrap());
        let mut concat = Concatenator::new(output.clone(), SingleProcess, options).unwrap();
        assert!(concat.add_file(&input));
        assert!(concat.finish().is_success());

        let root = output.root();
        assert!(root.contains("keep").unwrap());
        assert!(!root.contains("drop").unwrap());
        assert!(root.contains("top").unwrap());
    }

    #[test]
    fn read_only_outputs_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.ntpl");
        Container::create(&path, CreateMode::Exclusive)
            .unwrap()
            .close()
            .unwrap();
        let output = Container::open(&path, OpenMode::ReadOnly).unwrap();
        assert!(Concatenator::new(output, SingleProcess, ConcatOptions::default()).is_err());
    }
}
