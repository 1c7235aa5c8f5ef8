//! Weighted Jaccard over projected folder entries.

use crate::folder::IdentityKey;

/// `sim(A, B) = sum_k min(wA[k], wB[k]) / sum_k max(wA[k], wB[k])` with `k`
/// over the union of identities. Both slices must be sorted by key, which is
/// what `comparison_entries` produces; the merge accumulates numerator and
/// denominator without materializing the union.
///
/// Folders with no positive-weight entries never match anything: the empty
/// denominator maps to 0, so empty folders never group.
pub fn weighted_jaccard(a: &[(IdentityKey, u64)], b: &[(IdentityKey, u64)]) -> f64 {
    let mut numerator: u128 = 0;
    let mut denominator: u128 = 0;

    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].0.cmp(&b[j].0) {
            std::cmp::Ordering::Less => {
                denominator += a[i].1 as u128;
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                denominator += b[j].1 as u128;
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                numerator += a[i].1.min(b[j].1) as u128;
                denominator += a[i].1.max(b[j].1) as u128;
                i += 1;
                j += 1;
            }
        }
    }
    denominator += a[i..].iter().map(|(_, w)| *w as u128).sum::<u128>();
    denominator += b[j..].iter().map(|(_, w)| *w as u128).sum::<u128>();

    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(pairs: &[(&str, u64)]) -> Vec<(IdentityKey, u64)> {
        let mut out: Vec<(IdentityKey, u64)> = pairs
            .iter()
            .map(|(name, w)| {
                (
                    IdentityKey::NameSize {
                        name: name.to_string(),
                        size: *w,
                    },
                    *w,
                )
            })
            .collect();
        out.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        out
    }

    #[test]
    fn test_self_similarity_is_one() {
        let a = entries(&[("f", 10), ("g", 20)]);
        assert_eq!(weighted_jaccard(&a, &a), 1.0);
    }

    #[test]
    fn test_empty_folders_never_match() {
        let empty: Vec<(IdentityKey, u64)> = Vec::new();
        assert_eq!(weighted_jaccard(&empty, &empty), 0.0);

        let a = entries(&[("f", 10)]);
        assert_eq!(weighted_jaccard(&a, &empty), 0.0);
    }

    #[test]
    fn test_commutative() {
        let a = entries(&[("f", 1024), ("g", 512)]);
        let b = entries(&[("f", 1024), ("h", 256)]);
        assert_eq!(weighted_jaccard(&a, &b), weighted_jaccard(&b, &a));
    }

    #[test]
    fn test_known_value() {
        // shared f:1024; extra only on one side: 512.
        let a = entries(&[("f", 1024)]);
        let b = entries(&[("f", 1024), ("extra", 512)]);
        let sim = weighted_jaccard(&a, &b);
        assert!((sim - 1024.0 / 1536.0).abs() < 1e-12);
    }

    #[test]
    fn test_disjoint_is_zero() {
        let a = entries(&[("f", 10)]);
        let b = entries(&[("g", 10)]);
        assert_eq!(weighted_jaccard(&a, &b), 0.0);
    }

    #[test]
    fn test_same_name_different_size_is_distinct() {
        let a = entries(&[("f", 10)]);
        let b = entries(&[("f", 20)]);
        assert_eq!(weighted_jaccard(&a, &b), 0.0);
    }
}
