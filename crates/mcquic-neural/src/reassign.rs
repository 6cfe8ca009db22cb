//! Dead-codeword reassignment.
//!
//! Entries whose normalised frequency rounded to zero are overwritten with
//! copies of the most frequently used entries of the same codebook.

use mcquic_core::{Result, EPS};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::debug;

use crate::codebook::Codebook;

/// Squared change above which an entry counts as reassigned.
const CHANGE_THRESHOLD: f32 = 1e-4;

/// Outcome of one reassignment pass over a codebook.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reassignment {
    /// Entries considered never assigned
    pub never_assigned: usize,
    /// Entries whose value actually changed
    pub changed: usize,
    /// Codebook size
    pub k: usize,
}

impl Reassignment {
    /// Proportion of entries that changed.
    pub fn proportion(&self) -> f64 {
        if self.k == 0 {
            0.0
        } else {
            self.changed as f64 / self.k as f64
        }
    }
}

/// Reassign dead entries of `codebook` given normalised frequencies.
///
/// At most `k / 2` entries are touched per pass; when more are dead a
/// random subset of that size is picked.
pub fn reassign_codebook(
    codebook: &mut Codebook,
    freq: &[f64],
    rng: &mut StdRng,
) -> Result<Reassignment> {
    let k = codebook.k();
    let d = codebook.d();
    if freq.len() != k {
        return Err(mcquic_core::Error::shape(k, freq.len()));
    }

    let mut never: Vec<usize> = (0..k).filter(|&i| freq[i] < EPS).collect();
    if never.len() > k / 2 {
        never.shuffle(rng);
        never.truncate(k / 2);
        never.sort_unstable();
    }
    if never.is_empty() {
        return Ok(Reassignment {
            k,
            ..Default::default()
        });
    }

    // Most assigned first, lowest index on ties
    let mut order: Vec<usize> = (0..k).collect();
    order.sort_by(|&a, &b| freq[b].total_cmp(&freq[a]).then(a.cmp(&b)));

    let old = codebook.entries().to_vec();
    let entries = codebook.entries_mut();
    for (&target, &source) in never.iter().zip(&order) {
        entries[target * d..(target + 1) * d].copy_from_slice(&old[source * d..(source + 1) * d]);
    }

    let changed = (0..k)
        .filter(|&i| {
            let diff: f32 = old[i * d..(i + 1) * d]
                .iter()
                .zip(&entries[i * d..(i + 1) * d])
                .map(|(a, b)| (a - b) * (a - b))
                .sum();
            diff > CHANGE_THRESHOLD
        })
        .count();

    debug!(k, never_assigned = never.len(), changed, "reassigned codewords");
    Ok(Reassignment {
        never_assigned: never.len(),
        changed,
        k,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_dead_entries_copy_popular_ones() {
        let mut book = Codebook::from_entries(4, 1, vec![0.0, 1.0, 2.0, 3.0]).unwrap();
        let freq = vec![0.0, 40000.0, 25536.0, 0.0];
        let mut rng = StdRng::seed_from_u64(0);
        let r = reassign_codebook(&mut book, &freq, &mut rng).unwrap();

        assert_eq!(r.never_assigned, 2);
        assert_eq!(r.changed, 2);
        assert_eq!(book.entries(), &[1.0, 1.0, 2.0, 2.0]);
        assert_eq!(r.proportion(), 0.5);
    }

    #[test]
    fn test_at_most_half_reassigned() {
        let mut book = Codebook::from_entries(8, 1, (0..8).map(|i| i as f32).collect()).unwrap();
        let mut freq = vec![0.0; 8];
        freq[5] = 65536.0;
        let mut rng = StdRng::seed_from_u64(11);
        let r = reassign_codebook(&mut book, &freq, &mut rng).unwrap();
        assert_eq!(r.never_assigned, 4);
        assert!(r.changed <= 4);
        // The only live entry survives
        assert_eq!(book.entry(5).unwrap(), &[5.0]);
    }

    #[test]
    fn test_nothing_dead() {
        let mut book = Codebook::lattice(4, 2, 0.0, 1.0);
        let before = book.clone();
        let mut rng = StdRng::seed_from_u64(0);
        let r = reassign_codebook(&mut book, &[1.0; 4], &mut rng).unwrap();
        assert_eq!(r.changed, 0);
        assert_eq!(book, before);
        assert!(reassign_codebook(&mut book, &[1.0; 3], &mut rng).is_err());
    }
}
