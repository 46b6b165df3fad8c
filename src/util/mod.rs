//! Small container types used by the recovery machinery.

mod sparse_array;

pub use sparse_array::{DenseArray, SparseArray, SPARSE_SEGMENT_WIDTH};
