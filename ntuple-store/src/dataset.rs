use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use itertools::Itertools;
use ntuple_error::{NtupleResult, ntuple_bail};

use crate::MAX_RANK;
use crate::attribute::AttrValue;
use crate::chunk::{decode_chunk, encode_chunk};
use crate::container::{Container, ContainerState};
use crate::dtype::{ByteOrder, ElementType};
use crate::filter::Filter;
use crate::footer::DatasetNode;
use crate::values::Values;

pub const DEFAULT_CHUNK_ROWS: u64 = 1024;

/// Creation properties of a dataset.
///
/// A dataset is a sequence of rows; every row has the same trailing `extents` and the
/// leading (row) dimension grows without bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSpec {
    pub element: ElementType,
    pub byte_order: ByteOrder,
    /// Shape of a single row; empty for scalar rows.
    pub extents: Vec<u64>,
    pub chunk_rows: u64,
    pub filters: Vec<Filter>,
}

impl DatasetSpec {
    pub fn new(element: ElementType, extents: &[u64]) -> Self {
        Self {
            element,
            byte_order: ByteOrder::native(),
            extents: extents.to_vec(),
            chunk_rows: DEFAULT_CHUNK_ROWS,
            filters: Vec::new(),
        }
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    pub fn with_chunk_rows(mut self, chunk_rows: u64) -> Self {
        self.chunk_rows = chunk_rows;
        self
    }

    pub fn with_filters(mut self, filters: impl Into<Vec<Filter>>) -> Self {
        self.filters = filters.into();
        self
    }

    pub fn elements_per_row(&self) -> usize {
        self.extents.iter().product::<u64>() as usize
    }

    /// In-memory size of one row, the unit used for memory budgets.
    pub fn row_size_bytes(&self) -> u64 {
        (self.elements_per_row() * self.element.memory_width()) as u64
    }

    pub fn validate(&self) -> NtupleResult<()> {
        if self.extents.len() + 1 > MAX_RANK {
            ntuple_bail!(
                UnsupportedRank: "{} trailing extents plus the row dimension exceed the maximum rank {}",
                self.extents.len(),
                MAX_RANK
            );
        }
        if self.extents.contains(&0) {
            ntuple_bail!("extents must be positive, got {:?}", self.extents);
        }
        if self.chunk_rows == 0 {
            ntuple_bail!("chunk rows must be positive");
        }
        self.filters.iter().try_for_each(Filter::validate)
    }

    fn from_node(node: &DatasetNode) -> Self {
        Self {
            element: node.element,
            byte_order: node.byte_order,
            extents: node.extents.clone(),
            chunk_rows: node.chunk_rows,
            filters: node.filters.clone(),
        }
    }
}

impl Display for DatasetSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{} (∞, {}) chunked by {}",
            self.element,
            if self.element.is_fixed_width() {
                format!(":{}", self.byte_order)
            } else {
                String::new()
            },
            self.extents.iter().join(", "),
            self.chunk_rows
        )?;
        if !self.filters.is_empty() {
            write!(f, " [{}]", self.filters.iter().join(", "))?;
        }
        Ok(())
    }
}

/// A handle to an extensible, chunked dataset.
#[derive(Debug, Clone)]
pub struct Dataset {
    container: Container,
    path: Vec<String>,
}

impl Dataset {
    pub(crate) fn new(container: Container, path: Vec<String>) -> Self {
        Self { container, path }
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn path(&self) -> String {
        format!("/{}", self.path.join("/"))
    }

    pub fn name(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or_default()
    }

    /// Whether the dataset still exists in an open container.
    pub fn is_valid(&self) -> bool {
        self.node(|_| Ok(())).is_ok()
    }

    fn node<R>(&self, f: impl FnOnce(&DatasetNode) -> NtupleResult<R>) -> NtupleResult<R> {
        self.container
            .read(|state| f(state.footer.root.dataset(&self.path)?))
    }

    pub fn spec(&self) -> NtupleResult<DatasetSpec> {
        self.node(|node| Ok(DatasetSpec::from_node(node)))
    }

    /// Number of rows, the current leading dimension.
    pub fn rows(&self) -> NtupleResult<u64> {
        self.node(|node| Ok(node.rows))
    }

    pub fn extents(&self) -> NtupleResult<Vec<u64>> {
        self.node(|node| Ok(node.extents.clone()))
    }

    /// The full current shape: rows followed by the trailing extents.
    pub fn shape(&self) -> NtupleResult<Vec<u64>> {
        self.node(|node| Ok(std::iter::once(node.rows).chain(node.extents.iter().copied()).collect()))
    }

    /// The maximum shape; `None` marks the unbounded row dimension.
    pub fn max_shape(&self) -> NtupleResult<Vec<Option<u64>>> {
        self.node(|node| {
            Ok(std::iter::once(None)
                .chain(node.extents.iter().copied().map(Some))
                .collect())
        })
    }

    pub fn chunk_rows(&self) -> NtupleResult<u64> {
        self.node(|node| Ok(node.chunk_rows))
    }

    pub fn element(&self) -> NtupleResult<ElementType> {
        self.node(|node| Ok(node.element))
    }

    pub fn byte_order(&self) -> NtupleResult<ByteOrder> {
        self.node(|node| Ok(node.byte_order))
    }

    pub fn filters(&self) -> NtupleResult<Vec<Filter>> {
        self.node(|node| Ok(node.filters.clone()))
    }

    pub fn elements_per_row(&self) -> NtupleResult<usize> {
        self.node(|node| Ok(node.elements_per_row()))
    }

    pub fn row_size_bytes(&self) -> NtupleResult<u64> {
        self.spec().map(|spec| spec.row_size_bytes())
    }

    /// Grow the row dimension to `rows`. New rows read as default values until written.
    pub fn extend(&self, rows: u64) -> NtupleResult<()> {
        self.container.write(|state| {
            let node = state.footer.root.dataset_mut(&self.path)?;
            if rows < node.rows {
                ntuple_bail!(
                    BackingStore: "cannot shrink {} from {} to {} rows",
                    self.path(),
                    node.rows,
                    rows
                );
            }
            node.rows = rows;
            node.chunks
                .resize(DatasetNode::chunk_count(rows, node.chunk_rows), None);
            Ok(())
        })
    }

    /// Write whole rows starting at row `start`. The rows must lie within the current extent.
    pub fn write_rows(&self, start: u64, values: &Values) -> NtupleResult<()> {
        self.container
            .write(|state| write_rows(state, &self.path, start, values))
            .map_err(|e| e.with_context(format!("writing {}", self.path())))
    }

    /// Read `count` rows starting at row `start`.
    pub fn read_rows(&self, start: u64, count: u64) -> NtupleResult<Values> {
        self.container
            .read(|state| read_rows(state, &self.path, start, count))
            .map_err(|e| e.with_context(format!("reading {}", self.path())))
    }

    pub fn read_all(&self) -> NtupleResult<Values> {
        self.read_rows(0, self.rows()?)
    }

    pub fn set_attribute(&self, name: &str, value: impl Into<AttrValue>) -> NtupleResult<()> {
        let value = value.into();
        self.container.write(|state| {
            state
                .footer
                .root
                .dataset_mut(&self.path)?
                .attributes
                .insert(name.to_string(), value);
            Ok(())
        })
    }

    pub fn attribute(&self, name: &str) -> NtupleResult<Option<AttrValue>> {
        self.node(|node| Ok(node.attributes.get(name).cloned()))
    }

    pub fn attributes(&self) -> NtupleResult<BTreeMap<String, AttrValue>> {
        self.node(|node| Ok(node.attributes.clone()))
    }
}

/// Load chunk `index`, or defaults if it was never written.
fn load_chunk(state: &mut ContainerState, node: &DatasetNode, index: usize) -> NtupleResult<Values> {
    let elements = node.chunk_rows as usize * node.elements_per_row();
    match node.chunks.get(index).copied().flatten() {
        Some(chunk) => {
            let data = state.read_blob(chunk)?;
            decode_chunk(data, node.element, node.byte_order, &node.filters, elements)
        }
        None => Ok(Values::defaults(node.element, elements)),
    }
}

fn write_rows(
    state: &mut ContainerState,
    path: &[String],
    start: u64,
    values: &Values,
) -> NtupleResult<()> {
    // Work on a copy of the node so chunks can be read and appended while it is updated.
    let mut node = state.footer.root.dataset(path)?.clone();
    if values.element() != node.element {
        ntuple_bail!(
            "cannot write {} elements to a {} dataset",
            values.element(),
            node.element
        );
    }
    let per_row = node.elements_per_row();
    if values.len() % per_row != 0 {
        ntuple_bail!(
            "{} elements do not form whole rows of {} elements",
            values.len(),
            per_row
        );
    }
    let count = (values.len() / per_row) as u64;
    if start + count > node.rows {
        ntuple_bail!(
            BackingStore: "rows [{}, {}) lie beyond the extent of {} rows",
            start,
            start + count,
            node.rows
        );
    }
    if count == 0 {
        return Ok(());
    }

    let chunk_rows = node.chunk_rows;
    let end = start + count;
    for index in (start / chunk_rows)..=((end - 1) / chunk_rows) {
        let chunk_start = index * chunk_rows;
        let lo = start.max(chunk_start);
        let hi = end.min(chunk_start + chunk_rows);
        let src = values.slice((lo - start) as usize * per_row, (hi - lo) as usize * per_row)?;

        let chunk = if lo == chunk_start && hi == chunk_start + chunk_rows {
            src
        } else {
            let mut chunk = load_chunk(state, &node, index as usize)?;
            chunk.splice_in((lo - chunk_start) as usize * per_row, &src)?;
            chunk
        };

        let encoded = encode_chunk(&chunk, node.byte_order, &node.filters)?;
        let chunk_ref = state.write_blob(&encoded)?;
        node.chunks[index as usize] = Some(chunk_ref);
    }

    *state.footer.root.dataset_mut(path)? = node;
    Ok(())
}

fn read_rows(
    state: &mut ContainerState,
    path: &[String],
    start: u64,
    count: u64,
) -> NtupleResult<Values> {
    let node = state.footer.root.dataset(path)?.clone();
    let end = start + count;
    if end > node.rows {
        ntuple_bail!(
            BackingStore: "rows [{}, {}) lie beyond the extent of {} rows",
            start,
            end,
            node.rows
        );
    }
    let per_row = node.elements_per_row();
    let mut out = Values::with_capacity(node.element, count as usize * per_row);
    if count == 0 {
        return Ok(out);
    }

    let chunk_rows = node.chunk_rows;
    for index in (start / chunk_rows)..=((end - 1) / chunk_rows) {
        let chunk_start = index * chunk_rows;
        let lo = start.max(chunk_start);
        let hi = end.min(chunk_start + chunk_rows);
        let chunk = load_chunk(state, &node, index as usize)?;
        out.extend_from(
            &chunk.slice((lo - chunk_start) as usize * per_row, (hi - lo) as usize * per_row)?,
        )?;
    }
    Ok(out)
}
