use std::fmt::{self, Display, Formatter};

use log::error;

use super::layout::{DRAMLayout, PhysAddr};

/// DRAM address with bank, row, and column components.
///
/// Decoded from a physical address via [`DRAMAddr::decode`] or constructed
/// directly. `bank` is a simplified addressing of channel, DIMM, rank, bank
/// group and bank; all of these eventually select one physical bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DRAMAddr {
    /// Bank number
    pub bank: u64,
    /// Row number
    pub row: u64,
    /// Column number
    pub col: u64,
}

impl Display for DRAMAddr {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        write!(
            fmt,
            "(bank: {:2}, row: {:8}, col: {:4})",
            self.bank, self.row, self.col
        )
    }
}

impl DRAMAddr {
    /// Creates a new DRAM address from its components.
    pub fn new(bank: u64, row: u64, col: u64) -> Self {
        DRAMAddr { bank, row, col }
    }

    /// Decodes a physical byte address into its DRAM components.
    ///
    /// Bank bits are the parities of the address under each hash function;
    /// row and column are assembled by walking the respective masks in
    /// order, each mask contributing its popcount worth of contiguous bits.
    /// Decoding never fails.
    pub fn decode(phys: PhysAddr, layout: &DRAMLayout) -> Self {
        let mut bank = 0;
        for (i, h_fn) in layout.h_fns.iter().enumerate() {
            bank |= parity(phys & h_fn) << i;
        }

        DRAMAddr {
            bank,
            row: gather_field(phys, &layout.row_masks),
            col: gather_field(phys, &layout.col_masks),
        }
    }

    /// Translates the DRAM address back to a physical byte address.
    ///
    /// Row and column bits are scattered back through their masks. Bank
    /// parities are then reconciled greedily: for every hash function whose
    /// parity disagrees with the requested bank bit, the lowest address bit
    /// inside the function that belongs to neither the row nor the column
    /// field is toggled. This works as long as the hash functions restricted
    /// to those free bits are linearly independent over GF(2); a final
    /// self-check verifies the result and logs an error when the layout
    /// violates the assumption. The address is returned either way.
    pub fn encode(&self, layout: &DRAMLayout) -> PhysAddr {
        let mut phys = scatter_field(self.row, &layout.row_masks, "row");
        phys |= scatter_field(self.col, &layout.col_masks, "col");

        let free = !layout.row_union() & !layout.col_union();
        for (i, h_fn) in layout.h_fns.iter().enumerate() {
            if parity(phys & h_fn) == (self.bank >> i) & 1 {
                continue;
            }
            let candidates = h_fn & free;
            if candidates == 0 {
                error!(
                    "hash function {:#x} has no address bit outside the row and column fields",
                    h_fn
                );
                continue;
            }
            phys ^= 1u64 << candidates.trailing_zeros();
        }

        let mut correct = layout
            .h_fns
            .iter()
            .enumerate()
            .all(|(i, h_fn)| parity(phys & h_fn) == (self.bank >> i) & 1);
        correct &= gather_field(phys, &layout.row_masks) == self.row;
        if !correct {
            error!("mapping function for {:#x} not respected", phys);
        }

        phys
    }

    /// Compares bank and row, ignoring the column.
    pub fn same_row(&self, other: &DRAMAddr) -> bool {
        self.bank == other.bank && self.row == other.row
    }
}

fn parity(value: u64) -> u64 {
    (value.count_ones() & 1) as u64
}

/// Collects the bits selected by `masks` into a dense value, mask order
/// giving the significance order.
fn gather_field(phys: PhysAddr, masks: &[u64]) -> u64 {
    let mut field = 0;
    let mut offset = 0;
    for mask in masks {
        field |= ((phys & mask) >> mask.trailing_zeros()) << offset;
        offset += mask.count_ones();
    }
    field
}

/// Inverse of [`gather_field`]: peels the low bits of `field` off mask by
/// mask and places them at each mask's position.
fn scatter_field(field: u64, masks: &[u64], name: &str) -> PhysAddr {
    let mut phys = 0;
    let mut rest = field;
    for mask in masks {
        let n = mask.count_ones();
        phys |= (rest & ((1 << n) - 1)) << mask.trailing_zeros();
        rest >>= n;
    }
    assert_eq!(rest, 0, "{} value {:#x} exceeds the {} field", name, field, name);
    phys
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2-bank toy layout: 16 rows, 8-byte columns
    fn toy_layout() -> DRAMLayout {
        DRAMLayout::new(vec![0x8], vec![0xf0], vec![0x7])
    }

    #[test]
    fn test_decode_toy_layout() {
        let layout = toy_layout();
        assert_eq!(DRAMAddr::decode(0x00, &layout), DRAMAddr::new(0, 0, 0));
        assert_eq!(DRAMAddr::decode(0x08, &layout), DRAMAddr::new(1, 0, 0));
        assert_eq!(DRAMAddr::decode(0xf0, &layout), DRAMAddr::new(0, 15, 0));
    }

    #[test]
    fn test_encode_decode_toy_layout() {
        let layout = toy_layout();
        let phys = DRAMAddr::new(1, 3, 2).encode(&layout);
        assert_eq!(DRAMAddr::decode(phys, &layout), DRAMAddr::new(1, 3, 2));
    }

    #[test]
    fn test_roundtrip_dense_range() {
        let layout = toy_layout();
        for phys in 0u64..0x100 {
            let dram = DRAMAddr::decode(phys, &layout);
            let phys2 = dram.encode(&layout);
            let dram2 = DRAMAddr::decode(phys2, &layout);
            assert_eq!(dram2.bank, dram.bank, "bank mismatch for {:#x}", phys);
            assert_eq!(dram2.row, dram.row, "row mismatch for {:#x}", phys);
        }
    }

    #[test]
    fn test_encode_idempotent_on_rows() {
        let layout = toy_layout();
        for bank in 0..layout.banks_cnt() {
            for row in 0..layout.rows_cnt() {
                let dram = DRAMAddr::decode(DRAMAddr::new(bank, row, 0).encode(&layout), &layout);
                assert_eq!(dram.bank, bank);
                assert_eq!(dram.row, row);
            }
        }
    }

    #[test]
    fn test_bank_distribution_uniform() {
        // 5 hash functions over a dense 16 MiB range, expect every one of
        // the 32 banks within 5 % of the uniform share
        let layout = DRAMLayout::new(
            vec![0x2040, 0x44000, 0x88000, 0x110000, 0x220000],
            vec![0xffffc0000],
            vec![(1 << 13) - 1],
        );
        let samples = 1 << 12;
        let mut histogram = vec![0u64; layout.banks_cnt() as usize];
        for page in 0..samples {
            let phys = page << 12;
            histogram[DRAMAddr::decode(phys, &layout).bank as usize] += 1;
        }
        let expect = samples as f64 / layout.banks_cnt() as f64;
        for (bank, &count) in histogram.iter().enumerate() {
            let deviation = (count as f64 - expect).abs() / expect;
            assert!(
                deviation < 0.05,
                "bank {} is {} instead of {}",
                bank,
                count,
                expect
            );
        }
    }

    #[test]
    fn test_multi_mask_row_assembly() {
        // row split into two two-bit groups around the column bits
        let layout = DRAMLayout::new(vec![0x4], vec![0x30, 0x300], vec![0x3]);
        let dram = DRAMAddr::decode(0x210, &layout);
        // 0x210 = 0b10_0001_0000: low group contributes 0b01, high group 0b10
        assert_eq!(dram.row, 0b1001);
        let phys = DRAMAddr::new(dram.bank, dram.row, 0).encode(&layout);
        assert_eq!(DRAMAddr::decode(phys, &layout).row, 0b1001);
    }

    #[test]
    fn test_same_row() {
        let a = DRAMAddr::new(1, 7, 0);
        let b = DRAMAddr::new(1, 7, 5);
        assert!(a.same_row(&b));
        assert_ne!(a, b);
        assert!(!a.same_row(&DRAMAddr::new(0, 7, 0)));
    }
}
