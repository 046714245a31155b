//! Sparsity masks for quantization runs.
//!
//! A mask dictionary maps parameter names to boolean tensors marking the
//! elements to prune. Masks are stored bit-packed and applied in place to a
//! loaded model before any quantization step runs.
//!
//! ```text
//!  bool tensor [3, 5]          packed (MSB first)        shape
//!  1 0 0 1 0 0 1 0 ...   -->   [0b1001_0010, ...]   +   [3, 5]
//! ```
//!
//! Applying a dictionary is all-or-nothing in its bookkeeping: every entry
//! must be consumed by a parameter of the same name, otherwise the run fails
//! with [`sparq_core::Error::UnconsumedMask`].

mod apply;
mod codec;
mod dictionary;

pub use apply::{apply_mask, apply_mask_file, MaskReport};
pub use codec::{pack, pack_bits, unpack, unpack_bits, EncodedMask};
pub use dictionary::MaskDictionary;
