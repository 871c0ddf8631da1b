//! Row numerology: how the rows of one input dataset are split between workers.
//!
//! Rows move in iterations. In each one every worker reads a contiguous range of the input
//! and writes it to a contiguous range of the output. Iterations are sized to the memory
//! budget of all workers together and, wherever the output allows it, every worker's range
//! is a whole number of chunks starting on a chunk boundary so that no two workers touch the
//! same output chunk.

use ntuple_error::{NtupleResult, ntuple_bail};

/// Per-dataset merge state, shared by every worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcatState {
    /// In-memory size of one row in bytes.
    pub row_size_bytes: u64,
    /// Rows per output chunk.
    pub chunk_rows: u64,
    /// Rows one worker may hold per iteration; a positive multiple of `chunk_rows`.
    pub buffer_rows: u64,
    /// Rows of the output dataset that are already accounted for.
    pub total_rows: u64,
}

impl ConcatState {
    /// State for an output dataset holding `total_rows` rows, with each worker allowed to
    /// buffer `memory_bytes`.
    pub fn new(
        row_size_bytes: u64,
        chunk_rows: u64,
        memory_bytes: u64,
        total_rows: u64,
    ) -> NtupleResult<Self> {
        if chunk_rows == 0 {
            ntuple_bail!("chunk rows must be positive");
        }
        Ok(Self {
            row_size_bytes,
            chunk_rows,
            buffer_rows: buffer_rows(memory_bytes, row_size_bytes, chunk_rows),
            total_rows,
        })
    }

    /// Split the next iteration of an input with `input_rows` rows, of which `written` have
    /// already been transferred, between `ranks` workers.
    pub fn plan(&self, written: u64, input_rows: u64, ranks: usize) -> IterationPlan {
        plan(self, written, input_rows, ranks)
    }

    /// Account for an iteration that has been transferred.
    pub fn advance(&mut self, plan: &IterationPlan) {
        self.total_rows += plan.iteration_rows;
    }
}

/// `max(1, memory_bytes / (row_size_bytes * chunk_rows)) * chunk_rows`.
///
/// Rows of zero size count as one byte so that an empty row shape still has a finite
/// buffer.
pub fn buffer_rows(memory_bytes: u64, row_size_bytes: u64, chunk_rows: u64) -> u64 {
    let chunk_bytes = row_size_bytes.max(1).saturating_mul(chunk_rows);
    (memory_bytes / chunk_bytes).max(1) * chunk_rows
}

/// The rows every worker moves in one iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationPlan {
    /// Rows moved by all workers together.
    pub iteration_rows: u64,
    /// Rows moved by each worker, indexed by rank. Zero is a valid assignment.
    pub rows: Vec<u64>,
    /// First input row read by each worker.
    pub input_offsets: Vec<u64>,
    /// First output row written by each worker.
    pub output_offsets: Vec<u64>,
}

impl IterationPlan {
    pub fn is_empty(&self) -> bool {
        self.iteration_rows == 0
    }

    /// The assignment of a single worker.
    pub fn for_rank(&self, rank: usize) -> NumerologyResult {
        NumerologyResult {
            iteration_rows: self.iteration_rows,
            rows: self.rows.get(rank).copied().unwrap_or_default(),
            input_offset: self.input_offsets.get(rank).copied().unwrap_or_default(),
            output_offset: self.output_offsets.get(rank).copied().unwrap_or_default(),
        }
    }
}

/// One worker's share of an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NumerologyResult {
    pub iteration_rows: u64,
    pub rows: u64,
    pub input_offset: u64,
    pub output_offset: u64,
}

/// Plan the next iteration for every rank.
pub fn plan(state: &ConcatState, written: u64, input_rows: u64, ranks: usize) -> IterationPlan {
    let ranks = ranks.max(1);
    let c = state.chunk_rows;
    let remaining = input_rows.saturating_sub(written);

    let iteration = (remaining - remaining % c).min(state.buffer_rows.saturating_mul(ranks as u64));

    // Complete the output's partially filled last chunk first, on rank 0.
    let misalignment = state.total_rows % c;
    let shortfall = if misalignment != 0 && iteration >= c - misalignment {
        c - misalignment
    } else {
        0
    };

    let chunks = (iteration - shortfall) / c;
    let base = chunks / ranks as u64;
    let extra = (chunks % ranks as u64) as usize;
    let mut rows: Vec<u64> = (0..ranks)
        .map(|rank| (base + u64::from(rank < extra)) * c)
        .collect();
    rows[0] += shortfall;

    // A tail of at most one chunk would otherwise need an iteration of its own.
    let assigned = shortfall + chunks * c;
    let tail = remaining - assigned;
    if tail > 0 && tail <= c {
        let tail_rank = if extra > 0 { extra } else { ranks - 1 };
        rows[tail_rank] += tail;
    }

    let iteration_rows = rows.iter().sum();
    let mut input_offsets = Vec::with_capacity(ranks);
    let mut output_offsets = Vec::with_capacity(ranks);
    let mut before = 0;
    for count in &rows {
        input_offsets.push(written + before);
        output_offsets.push(state.total_rows + before);
        before += count;
    }

    IterationPlan {
        iteration_rows,
        rows,
        input_offsets,
        output_offsets,
    }
}

/// The next iteration's assignment for `rank` alone.
pub fn numerology(
    state: &ConcatState,
    written: u64,
    input_rows: u64,
    ranks: usize,
    rank: usize,
) -> NumerologyResult {
    plan(state, written, input_rows, ranks).for_rank(rank)
}
