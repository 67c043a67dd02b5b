//! Hammer-pattern compilation.
//!
//! Turns textual aggressor/victim templates like `"va"`, `"vavavvav"` or
//! `"avax"` into the per-window slot layout the flip finders iterate.

use std::collections::HashSet;

use rand::Rng;

use crate::error::Error;

/// Role of one slot in a compiled hammer pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// Row initialised with the victim pattern and checked for flips
    Victim,
    /// Row activated by the hammer loop
    Aggressor,
    /// Random spacer originating from an `x` in the template; owns no row
    Gap,
}

/// One slot of a compiled hammer pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    /// Role of the slot
    pub kind: SlotKind,
    /// For victims and aggressors the row distance from the window start;
    /// for gaps the randomly drawn width in rows
    pub row: u64,
}

/// A compiled hammer pattern.
///
/// Produced from a textual template over the alphabet `{v, a, x}` (`0` and
/// `1` alias `v` and `a`). The template is repeated until it contains at
/// least the requested number of aggressors, a trailing victim is appended
/// if the last row-carrying symbol is an aggressor, and every `x` is
/// replaced by a random row distance so that subsequent slots shift by that
/// amount. The flip finders drive one hammer attempt per window by mapping
/// each slot's row distance onto concrete rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HammerPattern {
    description: String,
    slots: Vec<Slot>,
}

impl HammerPattern {
    /// Compiles `description` for a target of `aggressor_rows` aggressors.
    ///
    /// `aggressor_rows` is rounded up to the next multiple of the
    /// aggressors per template repetition and written back. Random `x`
    /// widths are drawn from `[0, random_area)`, distinct per pattern.
    ///
    /// # Errors
    ///
    /// [`Error::ConfigInvalid`] when the template contains characters
    /// outside `{v, a, x, 0, 1}`, contains no aggressor, or holds more
    /// `x`s than `random_area` has distinct widths.
    pub fn compile(
        description: &str,
        aggressor_rows: &mut u32,
        random_area: u64,
        rng: &mut impl Rng,
    ) -> Result<Self, Error> {
        if description.is_empty() {
            return Err(Error::ConfigInvalid("hammer_pattern is empty".into()));
        }

        let canonical: String = description
            .chars()
            .map(|c| match c {
                '0' => Ok('v'),
                '1' => Ok('a'),
                'v' | 'a' | 'x' => Ok(c),
                other => Err(Error::ConfigInvalid(format!(
                    "hammer_pattern may only contain 'v', 'a', 'x', '0', '1' (got '{}')",
                    other
                ))),
            })
            .collect::<Result<_, _>>()?;

        let aps = canonical.chars().filter(|&c| c == 'a').count() as u32;
        if aps == 0 {
            return Err(Error::ConfigInvalid(
                "hammer_pattern must contain at least one aggressor".into(),
            ));
        }

        let repeats = aggressor_rows.div_ceil(aps).max(1);
        *aggressor_rows = repeats * aps;

        let mut expanded: Vec<char> = canonical.repeat(repeats as usize).chars().collect();
        if expanded.iter().rev().find(|&&c| c != 'x') != Some(&'v') {
            expanded.push('v');
        }

        let gaps = expanded.iter().filter(|&&c| c == 'x').count() as u64;
        if gaps > random_area {
            return Err(Error::ConfigInvalid(format!(
                "hammer_pattern holds {} 'x' slots but random_pattern_area is only {}",
                gaps, random_area
            )));
        }

        let mut slots = Vec::with_capacity(expanded.len());
        let mut used = HashSet::new();
        let mut position = 0u64;
        for c in expanded {
            match c {
                'v' | 'a' => {
                    let kind = if c == 'a' {
                        SlotKind::Aggressor
                    } else {
                        SlotKind::Victim
                    };
                    slots.push(Slot {
                        kind,
                        row: position,
                    });
                    position += 1;
                }
                'x' => {
                    let width = loop {
                        let draw = rng.random_range(0..random_area);
                        if used.insert(draw) {
                            break draw;
                        }
                    };
                    slots.push(Slot {
                        kind: SlotKind::Gap,
                        row: width,
                    });
                    position += width;
                }
                _ => unreachable!(),
            }
        }

        Ok(HammerPattern {
            description: description.to_owned(),
            slots,
        })
    }

    /// Number of slots, gaps included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns whether the pattern holds no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The compiled slots in order.
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Aggressor/victim mask over the row-carrying slots, `true` marking an
    /// aggressor.
    pub fn mask(&self) -> Vec<bool> {
        self.slots
            .iter()
            .filter(|s| s.kind != SlotKind::Gap)
            .map(|s| s.kind == SlotKind::Aggressor)
            .collect()
    }

    /// Number of aggressor slots.
    pub fn aggressors(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.kind == SlotKind::Aggressor)
            .count()
    }

    /// Number of victim slots.
    pub fn victims(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.kind == SlotKind::Victim)
            .count()
    }

    /// Number of rows one window of this pattern spans.
    pub fn row_span(&self) -> u64 {
        self.slots
            .iter()
            .filter(|s| s.kind != SlotKind::Gap)
            .map(|s| s.row + 1)
            .max()
            .unwrap_or(0)
    }

    /// The textual template the pattern was compiled from.
    pub fn description(&self) -> &str {
        &self.description
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(0x9e37_79b9)
    }

    #[test]
    fn test_compile_n_sided() {
        let mut aggressor_rows = 3;
        let pattern = HammerPattern::compile("va", &mut aggressor_rows, 0, &mut rng()).unwrap();
        assert_eq!(aggressor_rows, 3);
        assert_eq!(pattern.len(), 7);
        assert_eq!(
            pattern.mask(),
            vec![false, true, false, true, false, true, false]
        );
        assert_eq!(pattern.row_span(), 7);
        assert_eq!(pattern.victims(), 4);
    }

    #[test]
    fn test_compile_rounds_up_aggressors() {
        // two aggressors per repeat, target 3 -> rounded to 4
        let mut aggressor_rows = 3;
        let pattern = HammerPattern::compile("vaa", &mut aggressor_rows, 0, &mut rng()).unwrap();
        assert_eq!(aggressor_rows, 4);
        assert_eq!(pattern.aggressors(), 4);
        assert_eq!(
            pattern.mask(),
            vec![false, true, true, false, true, true, false]
        );
    }

    #[test]
    fn test_compile_random_gap() {
        let mut aggressor_rows = 2;
        let pattern = HammerPattern::compile("avax", &mut aggressor_rows, 64, &mut rng()).unwrap();
        assert_eq!(aggressor_rows, 2);
        assert_eq!(pattern.len(), 5);
        assert_eq!(pattern.mask(), vec![true, false, true, false]);

        let gap = pattern.slots()[3];
        assert_eq!(gap.kind, SlotKind::Gap);
        assert!(gap.row < 64);

        // trailing victim shifted by the gap width
        let tail = pattern.slots()[4];
        assert_eq!(tail.kind, SlotKind::Victim);
        assert_eq!(tail.row, 3 + gap.row);
    }

    #[test]
    fn test_compile_aliases() {
        let mut a = 4;
        let mut b = 4;
        let digits = HammerPattern::compile("01", &mut a, 0, &mut rng()).unwrap();
        let letters = HammerPattern::compile("va", &mut b, 0, &mut rng()).unwrap();
        assert_eq!(digits.mask(), letters.mask());
        assert_eq!(digits.len(), letters.len());
    }

    #[test]
    fn test_compile_keeps_trailing_victim() {
        let mut aggressor_rows = 2;
        let pattern = HammerPattern::compile("av", &mut aggressor_rows, 0, &mut rng()).unwrap();
        // already ends in a victim, nothing appended
        assert_eq!(pattern.len(), 4);
        assert_eq!(pattern.mask(), vec![true, false, true, false]);
    }

    #[test]
    fn test_compile_invariants() {
        for template in ["va", "vavavvav", "avax", "ava", "vvaavv"] {
            let aps = template.chars().filter(|&c| c == 'a').count() as u32;
            for target in 1..12 {
                let mut aggressor_rows = target;
                let pattern =
                    HammerPattern::compile(template, &mut aggressor_rows, 64, &mut rng()).unwrap();
                assert!(pattern.aggressors() as u32 >= target);
                assert_eq!(pattern.aggressors() as u32, aggressor_rows);
                assert_eq!(aggressor_rows % aps, 0);
                // last row-carrying slot is a victim
                let last = pattern
                    .slots()
                    .iter()
                    .rev()
                    .find(|s| s.kind != SlotKind::Gap)
                    .unwrap();
                assert_eq!(last.kind, SlotKind::Victim);
                // gap widths in range and distinct
                let widths: Vec<u64> = pattern
                    .slots()
                    .iter()
                    .filter(|s| s.kind == SlotKind::Gap)
                    .map(|s| s.row)
                    .collect();
                assert!(widths.iter().all(|&w| w < 64));
                let distinct: HashSet<u64> = widths.iter().copied().collect();
                assert_eq!(distinct.len(), widths.len());
            }
        }
    }

    #[test]
    fn test_compile_rejects_garbage() {
        let mut aggressor_rows = 2;
        assert!(matches!(
            HammerPattern::compile("vbv", &mut aggressor_rows, 0, &mut rng()),
            Err(Error::ConfigInvalid(_))
        ));
        assert!(matches!(
            HammerPattern::compile("", &mut aggressor_rows, 0, &mut rng()),
            Err(Error::ConfigInvalid(_))
        ));
        assert!(matches!(
            HammerPattern::compile("vvv", &mut aggressor_rows, 0, &mut rng()),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_compile_rejects_exhausted_random_area() {
        let mut aggressor_rows = 1;
        assert!(matches!(
            HammerPattern::compile("axxx", &mut aggressor_rows, 2, &mut rng()),
            Err(Error::ConfigInvalid(_))
        ));
    }
}
