//! COCO-compatible run-length encoding of binary masks.
//!
//! Runs are counted over the mask in column-major (Fortran) order, starting
//! with a run of zeros (which may be empty). The run list is packed into the
//! compact ASCII form used by `pycocotools`: each count is delta-coded
//! against the count two positions earlier, then emitted as little-endian
//! 5-bit groups offset by `'0'`, with bit `0x20` as the continuation flag and
//! bit `0x10` carrying the sign of the final group.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A row-major binary mask. Every cell is `0` or `1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryMask {
    height: u32,
    width: u32,
    data: Vec<u8>,
}

impl BinaryMask {
    /// Build from row-major cells. Nonzero cells are rejected unless `1`.
    pub fn new(height: u32, width: u32, data: Vec<u8>) -> Result<Self, CoreError> {
        let expected = height as usize * width as usize;
        if data.len() != expected {
            return Err(CoreError::Validation(format!(
                "mask data has {} cells, expected {height}x{width} = {expected}",
                data.len()
            )));
        }
        if let Some(bad) = data.iter().find(|&&v| v > 1) {
            return Err(CoreError::Validation(format!(
                "mask cells must be 0 or 1, found {bad}"
            )));
        }
        Ok(Self {
            height,
            width,
            data,
        })
    }

    /// A mask with every cell set to `value` (`0` or `1`).
    pub fn filled(height: u32, width: u32, value: bool) -> Self {
        Self {
            height,
            width,
            data: vec![u8::from(value); height as usize * width as usize],
        }
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    /// Row-major cells.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn get(&self, row: u32, col: u32) -> Option<bool> {
        if row >= self.height || col >= self.width {
            return None;
        }
        Some(self.data[row as usize * self.width as usize + col as usize] == 1)
    }

    pub fn set(&mut self, row: u32, col: u32, value: bool) {
        if row < self.height && col < self.width {
            self.data[row as usize * self.width as usize + col as usize] = u8::from(value);
        }
    }

    /// Number of set cells.
    pub fn area(&self) -> u64 {
        self.data.iter().map(|&v| u64::from(v)).sum()
    }
}

/// Compressed RLE as stored in the mask index: `size` is `[height, width]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rle {
    pub size: [u32; 2],
    pub counts: String,
}

/// Encode a mask into compressed RLE.
pub fn encode(mask: &BinaryMask) -> Rle {
    let counts = mask_to_counts(mask);
    Rle {
        size: [mask.height, mask.width],
        counts: counts_to_string(&counts),
    }
}

/// Decode compressed RLE back into a mask.
///
/// Fails when the string is malformed or the runs do not cover exactly
/// `height * width` cells.
pub fn decode(rle: &Rle) -> Result<BinaryMask, CoreError> {
    let [height, width] = rle.size;
    let total = height as u64 * width as u64;
    let counts = string_to_counts(&rle.counts)?;

    let mut covered: u64 = 0;
    for (i, &c) in counts.iter().enumerate() {
        if c < 0 {
            return Err(CoreError::Validation(format!(
                "RLE run {i} is negative ({c})"
            )));
        }
        covered = covered.checked_add(c as u64).ok_or_else(|| {
            CoreError::Validation("RLE runs overflow the cell count".to_string())
        })?;
    }
    if covered != total {
        return Err(CoreError::Validation(format!(
            "RLE runs cover {covered} cells, expected {height}x{width} = {total}"
        )));
    }

    // Expand runs in column-major order, then scatter into row-major cells.
    let h = height as usize;
    let w = width as usize;
    let mut data = vec![0u8; h * w];
    let mut pos: usize = 0;
    let mut value = 0u8;
    for &c in &counts {
        for _ in 0..c {
            let col = pos / h.max(1);
            let row = pos % h.max(1);
            data[row * w + col] = value;
            pos += 1;
        }
        value ^= 1;
    }

    Ok(BinaryMask {
        height,
        width,
        data,
    })
}

/// Alternating run lengths (zeros first) in column-major order.
pub fn mask_to_counts(mask: &BinaryMask) -> Vec<i64> {
    let h = mask.height as usize;
    let w = mask.width as usize;
    let mut counts = Vec::new();
    let mut current = 0u8;
    let mut run: i64 = 0;
    for col in 0..w {
        for row in 0..h {
            let v = mask.data[row * w + col];
            if v != current {
                counts.push(run);
                run = 0;
                current = v;
            }
            run += 1;
        }
    }
    counts.push(run);
    counts
}

/// Pack run lengths into the compressed ASCII form.
pub fn counts_to_string(counts: &[i64]) -> String {
    let mut out = String::new();
    for (i, &count) in counts.iter().enumerate() {
        let mut x = count;
        if i > 2 {
            x -= counts[i - 2];
        }
        loop {
            let mut c = x & 0x1f;
            x >>= 5;
            let more = if c & 0x10 != 0 { x != -1 } else { x != 0 };
            if more {
                c |= 0x20;
            }
            out.push(char::from((c + 48) as u8));
            if !more {
                break;
            }
        }
    }
    out
}

/// Unpack the compressed ASCII form into run lengths.
pub fn string_to_counts(s: &str) -> Result<Vec<i64>, CoreError> {
    let bytes = s.as_bytes();
    let mut counts: Vec<i64> = Vec::new();
    let mut p = 0;
    while p < bytes.len() {
        let mut x: i64 = 0;
        let mut k: u32 = 0;
        loop {
            let Some(&b) = bytes.get(p) else {
                return Err(CoreError::Validation(
                    "RLE counts string ends inside a run".to_string(),
                ));
            };
            if !(48..48 + 64).contains(&b) {
                return Err(CoreError::Validation(format!(
                    "RLE counts string has invalid character {:?} at {p}",
                    char::from(b)
                )));
            }
            if 5 * k >= 63 {
                return Err(CoreError::Validation(
                    "RLE run length overflows".to_string(),
                ));
            }
            let c = i64::from(b - 48);
            x |= (c & 0x1f) << (5 * k);
            p += 1;
            k += 1;
            if c & 0x20 == 0 {
                if c & 0x10 != 0 && 5 * k < 64 {
                    x |= -1i64 << (5 * k);
                }
                break;
            }
        }
        let m = counts.len();
        if m > 2 {
            x = x.checked_add(counts[m - 2]).ok_or_else(|| {
                CoreError::Validation("RLE run length overflows".to_string())
            })?;
        }
        counts.push(x);
    }
    Ok(counts)
}
