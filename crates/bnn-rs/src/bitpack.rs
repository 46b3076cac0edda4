//! Bit packing of channel-last float weights into the engine's 64-bit words.
//!
//! The engine stores bipolar weights as bits with `value = 2 * bit - 1`:
//! positive floats become 1, everything else becomes 0, 64 values per word,
//! LSB first. Filters whose channel count is not exactly 64 are packed with
//! their HWC axis aligned to 128 bits so the runtime can stream them in pairs
//! of words.

use crate::convert::{ConvertError, ConvertResult};
use crate::tensor::{BTensor, FTensor};

/// Packs up to 64 float values into one word, LSB first.
fn pack_word(values: &[f32]) -> u64 {
    debug_assert!(values.len() <= 64);
    let mut word = 0u64;
    for (bit, &value) in values.iter().enumerate() {
        if value > 0.0 {
            word |= 1u64 << bit;
        }
    }
    word
}

/// Packs a channel-last `(N, H, W, C)` weight tensor into bipolar words.
///
/// When `C == 64` the elements are packed sequentially with no padding;
/// otherwise every filter's HWC axis is walked in strides of 128 elements,
/// each stride contributing exactly two words.
pub fn bitpack(tensor: &FTensor) -> ConvertResult<BTensor> {
    if tensor.shape.len() != 4 {
        return Err(ConvertError::new(format!(
            "bitpack requires a 4-d channel-last tensor, got {:?}",
            tensor.shape
        )));
    }
    if tensor.num_elements() != tensor.data.len() {
        return Err(ConvertError::new(format!(
            "bitpack input buffer holds {} elements but shape {:?} implies {}",
            tensor.data.len(),
            tensor.shape,
            tensor.num_elements()
        )));
    }

    let n = tensor.shape[0] as usize;
    let c = tensor.shape[3] as usize;
    let hwc = tensor.num_elements() / n;

    let align_hwc_to_128 = c != 64;
    let mut packed = Vec::new();
    if align_hwc_to_128 {
        for filter in tensor.data.chunks_exact(hwc) {
            let mut i = 0;
            while i < hwc {
                let eff = (hwc - i).min(128);
                let low = eff.min(64);
                packed.push(pack_word(&filter[i..i + low]));
                let high = eff.saturating_sub(64);
                if high == 0 {
                    packed.push(0);
                } else {
                    packed.push(pack_word(&filter[i + 64..i + 64 + high]));
                }
                i += 128;
            }
        }
    } else {
        // HWC is a multiple of 64 whenever C is, so no tail remains.
        for chunk in tensor.data.chunks_exact(64) {
            packed.push(pack_word(chunk));
        }
    }

    Ok(BTensor {
        data: packed,
        shape: tensor.shape.clone(),
        align_hwc_to_128,
    })
}
