use std::mem;

use parking_lot::Mutex;

/// A single row value.
///
/// Column semantics beyond scalar equality live in the caller's row table
/// and prober implementations.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int64(i64),
    Utf8(String),
}

impl Scalar {
    fn mem_bytes(&self) -> usize {
        let heap = match self {
            Scalar::Utf8(s) => s.len(),
            _ => 0,
        };
        mem::size_of::<Scalar>() + heap
    }
}

pub type Row = Vec<Scalar>;

/// A fixed-capacity, reusable container of rows.
///
/// Batches are passed by ownership transfer through the pipeline's queues
/// and reset for reuse rather than reallocated. `required_rows` is a hint
/// below capacity used by limit pushdown: a batch is considered full once
/// it holds that many rows.
#[derive(Debug)]
pub struct Batch {
    rows: Vec<Row>,
    capacity: usize,
    required_rows: usize,
}

impl Batch {
    pub fn with_capacity(capacity: usize) -> Batch {
        Batch {
            rows: Vec::with_capacity(capacity),
            capacity,
            required_rows: capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// True once the batch holds `required_rows` rows.
    pub fn is_full(&self) -> bool {
        self.rows.len() >= self.required_rows
    }

    pub fn push_row(&mut self, row: Row) {
        debug_assert!(self.rows.len() < self.capacity, "push into full batch");
        self.rows.push(row);
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Move all rows out, leaving the batch empty.
    pub fn take_rows(&mut self) -> Vec<Row> {
        mem::take(&mut self.rows)
    }

    /// Clear rows and restore the required-rows hint to full capacity.
    pub fn reset(&mut self) {
        self.rows.clear();
        self.required_rows = self.capacity;
    }

    /// Lower the number of rows the next fill should produce.
    ///
    /// Clamped to `1..=capacity`.
    pub fn set_required_rows(&mut self, required: usize) {
        self.required_rows = required.clamp(1, self.capacity);
    }

    pub fn required_rows(&self) -> usize {
        self.required_rows
    }

    /// Approximate heap footprint, for accounting only.
    pub fn mem_bytes(&self) -> usize {
        self.rows
            .iter()
            .map(|row| row.iter().map(Scalar::mem_bytes).sum::<usize>())
            .sum()
    }
}

/// Recycling pool of batches shared by the build workers.
///
/// Steady state allocates nothing: consumed batches are recycled back in
/// and handed out again on the next fetch.
#[derive(Debug)]
pub struct BatchAllocator {
    capacity: usize,
    free: Mutex<Vec<Batch>>,
}

impl BatchAllocator {
    pub fn new(capacity: usize) -> BatchAllocator {
        BatchAllocator {
            capacity,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn alloc(&self) -> Batch {
        match self.free.lock().pop() {
            Some(mut batch) => {
                batch.reset();
                batch
            }
            None => Batch::with_capacity(self.capacity),
        }
    }

    pub fn recycle(&self, batch: Batch) {
        self.free.lock().push(batch);
    }
}
