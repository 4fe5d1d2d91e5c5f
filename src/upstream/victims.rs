//! Victim selection for shedding.
//!
//! Split in two steps: [`allocate`] decides how many victims each tenant
//! contributes, [`sample`] picks which of a tenant's connections go.

use rand::seq::SliceRandom;
use rand::Rng;

/// Splits `n` victims across tenants in proportion to their connection
/// counts.
///
/// Each tenant first gets `floor(n * count / total)`. The remainder is
/// handed out one at a time to the largest tenants first (ties broken by
/// position), skipping any tenant already giving up all its connections.
/// `n` is capped at the total, so no tenant is ever asked for more than it
/// holds and the result always sums to `min(n, total)`.
pub fn allocate(counts: &[usize], n: usize) -> Vec<usize> {
    let total: usize = counts.iter().sum();
    let n = n.min(total);
    if n == 0 {
        return vec![0; counts.len()];
    }

    let mut shares: Vec<usize> = counts
        .iter()
        .map(|&count| (n as u128 * count as u128 / total as u128) as usize)
        .collect();

    let mut by_size: Vec<usize> = (0..counts.len()).collect();
    by_size.sort_by(|&a, &b| counts[b].cmp(&counts[a]).then(a.cmp(&b)));

    let mut remainder = n - shares.iter().sum::<usize>();
    while remainder > 0 {
        for &i in &by_size {
            if remainder == 0 {
                break;
            }
            if shares[i] < counts[i] {
                shares[i] += 1;
                remainder -= 1;
            }
        }
    }

    shares
}

/// Picks up to `k` distinct items uniformly at random.
pub fn sample<T: Clone, R: Rng + ?Sized>(items: &[T], k: usize, rng: &mut R) -> Vec<T> {
    items.choose_multiple(rng, k).cloned().collect()
}
