use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Physical memory byte address.
pub type PhysAddr = u64;
/// Virtual memory byte address.
pub type VirtAddr = usize;

/// System-wide DRAM addressing model.
///
/// Describes how the memory controller maps a physical byte address onto a
/// (bank, row, column) triple:
///
/// - `h_fns` holds one 64-bit XOR mask per bank-index bit; bit *i* of the
///   bank index is the parity of `phys & h_fns[i]`.
/// - `row_masks` and `col_masks` each hold masks whose set bits are
///   contiguous; walked in order they assemble the row and column fields.
///
/// Constructed once at start-up from the `[dram_layout]` configuration
/// section and shared read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DRAMLayout {
    /// XOR hash functions selecting the bank-index bits
    #[serde(rename = "functions")]
    pub h_fns: Vec<u64>,
    /// Masks assembling the row field, low row bits first
    pub row_masks: Vec<u64>,
    /// Masks assembling the column field, low column bits first
    pub col_masks: Vec<u64>,
}

impl DRAMLayout {
    /// Creates a new layout from raw masks.
    pub fn new(h_fns: Vec<u64>, row_masks: Vec<u64>, col_masks: Vec<u64>) -> Self {
        DRAMLayout {
            h_fns,
            row_masks,
            col_masks,
        }
    }

    /// Returns the number of banks addressed by this layout.
    pub fn banks_cnt(&self) -> u64 {
        1 << self.h_fns.len()
    }

    /// Returns the number of addressable rows.
    pub fn rows_cnt(&self) -> u64 {
        1 << self.row_masks.iter().map(|m| m.count_ones()).sum::<u32>()
    }

    /// Union of all row masks.
    pub(crate) fn row_union(&self) -> u64 {
        self.row_masks.iter().fold(0, |acc, m| acc | m)
    }

    /// Union of all column masks.
    pub(crate) fn col_union(&self) -> u64 {
        self.col_masks.iter().fold(0, |acc, m| acc | m)
    }

    /// Validates that every row and column mask has contiguous set bits.
    ///
    /// Non-contiguous fields must be described by multiple masks, one per
    /// contiguous bit group.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigInvalid`] for the first offending mask.
    pub fn validate(&self) -> Result<(), Error> {
        for (name, masks) in [("row", &self.row_masks), ("col", &self.col_masks)] {
            for &mask in masks {
                if !mask_is_contiguous(mask) {
                    return Err(Error::ConfigInvalid(format!(
                        "all 1-bits in a {} mask must be consecutive - use multiple {} masks for non-consecutive 1-bits (got {:#x})",
                        name, name, mask
                    )));
                }
            }
        }
        if self.h_fns.is_empty() {
            return Err(Error::ConfigInvalid(
                "at least one bank hash function is required".into(),
            ));
        }
        Ok(())
    }
}

fn mask_is_contiguous(mask: u64) -> bool {
    mask.leading_zeros() + mask.count_ones() + mask.trailing_zeros() == u64::BITS
}

impl Display for DRAMLayout {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        write!(
            fmt,
            "DRAMLayout(h_fns: {:#x?}, row_masks: {:#x?}, col_masks: {:#x?})",
            self.h_fns, self.row_masks, self.col_masks
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_banks_cnt() {
        let layout = DRAMLayout::new(vec![0x8], vec![0xf0], vec![0x7]);
        assert_eq!(layout.banks_cnt(), 2);
        let layout = DRAMLayout::new(
            vec![0x2040, 0x44000, 0x88000, 0x110000, 0x220000],
            vec![0xffffc0000],
            vec![(1 << 13) - 1],
        );
        assert_eq!(layout.banks_cnt(), 32);
    }

    #[test]
    fn test_mask_validation() {
        let layout = DRAMLayout::new(vec![0x8], vec![0xf0], vec![0x7]);
        assert!(layout.validate().is_ok());

        // 0b1010 has a hole
        let layout = DRAMLayout::new(vec![0x8], vec![0xa], vec![0x7]);
        assert!(matches!(layout.validate(), Err(Error::ConfigInvalid(_))));

        // split into two masks the same bits are fine
        let layout = DRAMLayout::new(vec![0x8], vec![0x2, 0x8], vec![0x7]);
        assert!(layout.validate().is_ok());
    }

    #[test]
    fn test_rows_cnt() {
        let layout = DRAMLayout::new(vec![0x8], vec![0xf0], vec![0x7]);
        assert_eq!(layout.rows_cnt(), 16);
    }
}
