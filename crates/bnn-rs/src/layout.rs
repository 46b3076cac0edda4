//! Tensor layout constants.
//!
//! The interchange format orders dimensions batch-channel-height-width while
//! the inference engine consumes batch-height-width-channel. Conversions
//! happen only at declared boundaries (graph inputs and weight
//! reinterpretation), and this module owns the permutations they use.

/// Axis permutation taking NCHW dims to NHWC.
pub const PERM_NCHW_TO_NHWC: [usize; 4] = [0, 2, 3, 1];

/// Maps an axis index given in NCHW convention onto the NHWC axis it names.
pub const AXIS_NCHW_TO_NHWC: [usize; 4] = [0, 3, 1, 2];
