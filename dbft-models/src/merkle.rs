use dbft_hash::{Hash, HASH_SIZE_BYTES};

/// Computes the merkle root of a list of hashes.
///
/// Leaves are paired left to right, an odd leaf is paired with itself.
/// The root of an empty list is the all-zero hash.
pub fn compute_merkle_root(hashes: &[Hash]) -> Hash {
    if hashes.is_empty() {
        return Hash::from_bytes(&[0u8; HASH_SIZE_BYTES]);
    }
    let mut level: Vec<Hash> = hashes.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let left = pair[0];
            let right = pair.get(1).copied().unwrap_or(left);
            let mut concat = [0u8; HASH_SIZE_BYTES * 2];
            concat[..HASH_SIZE_BYTES].copy_from_slice(left.to_bytes());
            concat[HASH_SIZE_BYTES..].copy_from_slice(right.to_bytes());
            next.push(Hash::compute_from(&concat));
        }
        level = next;
    }
    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_root_is_zero() {
        assert_eq!(
            compute_merkle_root(&[]),
            Hash::from_bytes(&[0u8; HASH_SIZE_BYTES])
        );
    }

    #[test]
    fn test_single_leaf_is_itself() {
        let leaf = Hash::compute_from(b"tx1");
        assert_eq!(compute_merkle_root(&[leaf]), leaf);
    }

    #[test]
    fn test_odd_leaf_pairs_with_itself() {
        let a = Hash::compute_from(b"a");
        let b = Hash::compute_from(b"b");
        let c = Hash::compute_from(b"c");
        let root_odd = compute_merkle_root(&[a, b, c]);
        let root_dup = compute_merkle_root(&[a, b, c, c]);
        assert_eq!(root_odd, root_dup);
    }

    #[test]
    fn test_order_matters() {
        let a = Hash::compute_from(b"a");
        let b = Hash::compute_from(b"b");
        assert_ne!(compute_merkle_root(&[a, b]), compute_merkle_root(&[b, a]));
    }
}
