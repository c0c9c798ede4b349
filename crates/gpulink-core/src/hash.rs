//! System configuration hash.
//!
//! The hash summarizes *which* GPUs are installed, not the order a driver
//! happens to report them in. Drivers reorder adapters when the user toggles
//! power modes, plugs in a monitor or sets vendor environment variables; none
//! of those should invalidate a stored device choice. Adding, removing or
//! renaming a GPU does.

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Separator folded in after every name. 0xFF never occurs in UTF-8.
const NAME_SEPARATOR: u8 = 0xFF;

/// Compute the system configuration hash of a multiset of device names.
///
/// Names are sorted lexicographically (byte order) and folded with FNV-1a.
/// Duplicates count: two identical GPUs hash differently from one.
pub fn config_hash<I, S>(names: I) -> u64
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut sorted: Vec<S> = names.into_iter().collect();
    sorted.sort_by(|a, b| a.as_ref().cmp(b.as_ref()));

    sorted.iter().fold(FNV_OFFSET, |hash, name| {
        let hash = fnv1a(hash, name.as_ref().as_bytes());
        fnv1a(hash, &[NAME_SEPARATOR])
    })
}

fn fnv1a(mut hash: u64, bytes: &[u8]) -> u64 {
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Heap's algorithm, collecting every permutation of `items`.
    fn permutations(items: &[&'static str]) -> Vec<Vec<&'static str>> {
        fn heap(k: usize, a: &mut Vec<&'static str>, out: &mut Vec<Vec<&'static str>>) {
            if k <= 1 {
                out.push(a.clone());
                return;
            }
            heap(k - 1, a, out);
            for i in 0..k - 1 {
                if k % 2 == 0 {
                    a.swap(i, k - 1);
                } else {
                    a.swap(0, k - 1);
                }
                heap(k - 1, a, out);
            }
        }
        let mut a = items.to_vec();
        let mut out = Vec::new();
        heap(a.len(), &mut a, &mut out);
        out
    }

    #[test]
    fn test_order_insensitive_all_permutations() {
        let names = [
            "NVIDIA GeForce RTX 4090",
            "AMD Radeon RX 7900 XTX",
            "Intel(R) UHD Graphics 770",
            "NVIDIA GeForce RTX 4090",
            "llvmpipe (LLVM 17.0.6, 256 bits)",
        ];
        let reference = config_hash(names);
        let perms = permutations(&names);
        assert_eq!(perms.len(), 120);
        for p in perms {
            assert_eq!(config_hash(&p), reference, "permutation {p:?}");
        }
    }

    #[test]
    fn test_changes_when_gpu_added_removed_or_renamed() {
        let base = config_hash(["A", "B"]);
        assert_ne!(base, config_hash(["A", "B", "C"]));
        assert_ne!(base, config_hash(["A"]));
        assert_ne!(base, config_hash(["A", "C"]));
    }

    #[test]
    fn test_duplicates_count() {
        assert_ne!(config_hash(["A"]), config_hash(["A", "A"]));
    }

    #[test]
    fn test_name_boundaries_matter() {
        assert_ne!(config_hash(["ab", "c"]), config_hash(["a", "bc"]));
    }

    #[test]
    fn test_empty_is_offset_basis() {
        assert_eq!(config_hash(Vec::<String>::new()), FNV_OFFSET);
    }

    #[test]
    fn test_stable_value() {
        // Persisted across runs: the value for a fixed input must never change.
        let expected = fnv1a(fnv1a(FNV_OFFSET, b"A"), &[NAME_SEPARATOR]);
        assert_eq!(config_hash(["A"]), expected);
    }
}
