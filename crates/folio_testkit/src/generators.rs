//! Property-based test generators using proptest.

use folio_core::MAX_META_SIZE;
use proptest::prelude::*;

/// Strategy for valid blob metadata (0 to 32 bytes).
pub fn meta_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=MAX_META_SIZE)
}

/// Strategy for blob payloads up to `max_len` bytes.
///
/// Sizes are drawn evenly from the powers of two up to `max_len` first, so
/// small and large size classes are both exercised.
pub fn data_strategy(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    let max_shift = usize::BITS - max_len.max(1).leading_zeros();
    (0..max_shift)
        .prop_flat_map(move |shift| {
            let upper = (1usize << shift).min(max_len);
            prop::collection::vec(any::<u8>(), 0..=upper)
        })
}

/// One step of a generated workload. Blob references are indices into the
/// list of blobs created so far, taken modulo its length.
#[derive(Debug, Clone)]
pub enum BlobOperation {
    /// Create a blob.
    Create {
        /// Metadata.
        meta: Vec<u8>,
        /// Payload.
        data: Vec<u8>,
    },
    /// Replace a blob's payload.
    Write {
        /// Blob index.
        target: usize,
        /// New payload.
        data: Vec<u8>,
    },
    /// Append to a blob's payload.
    Append {
        /// Blob index.
        target: usize,
        /// Appended bytes.
        data: Vec<u8>,
    },
    /// Delete a blob.
    Delete {
        /// Blob index.
        target: usize,
    },
    /// Close and reopen the store.
    Reopen,
}

/// Strategy for a single workload step.
pub fn blob_operation_strategy(max_len: usize) -> impl Strategy<Value = BlobOperation> {
    prop_oneof![
        4 => (meta_strategy(), data_strategy(max_len))
            .prop_map(|(meta, data)| BlobOperation::Create { meta, data }),
        2 => (any::<usize>(), data_strategy(max_len))
            .prop_map(|(target, data)| BlobOperation::Write { target, data }),
        2 => (any::<usize>(), data_strategy(max_len / 4))
            .prop_map(|(target, data)| BlobOperation::Append { target, data }),
        1 => any::<usize>().prop_map(|target| BlobOperation::Delete { target }),
        1 => Just(BlobOperation::Reopen),
    ]
}

/// Strategy for a sequence of workload steps.
pub fn operation_sequence_strategy(
    min_ops: usize,
    max_ops: usize,
    max_len: usize,
) -> impl Strategy<Value = Vec<BlobOperation>> {
    prop::collection::vec(blob_operation_strategy(max_len), min_ops..max_ops)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 16,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
