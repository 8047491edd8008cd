use std::fmt;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Stable identity of a named queue. Every process resolving the same name
/// gets the same value, and the shared segment is addressed by it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(u64);

impl QueueId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// File name of the segment link inside the data directory.
    pub fn link_name(&self) -> String {
        format!("mq-{:016x}", self.0)
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// 64-bit FNV-1a over the UTF-8 bytes of `name`. Total and pure; an empty
/// name yields the offset basis.
pub fn resolve(name: &str) -> QueueId {
    let mut h = FNV_OFFSET_BASIS;
    for b in name.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    QueueId(h)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_is_deterministic() {
        assert_eq!(resolve("jobs"), resolve("jobs"));
        assert_eq!(resolve("/sp-example-server"), resolve("/sp-example-server"));
    }

    #[test]
    fn permutations_do_not_collide() {
        assert_ne!(resolve("ab"), resolve("ba"));
        assert_ne!(resolve("listen"), resolve("silent"));
    }

    #[test]
    fn empty_name_is_the_offset_basis() {
        assert_eq!(resolve("").as_u64(), FNV_OFFSET_BASIS);
    }

    #[test]
    fn known_vector() {
        // FNV-1a("a")
        assert_eq!(resolve("a").as_u64(), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn link_name_is_fixed_width() {
        assert_eq!(resolve("").link_name(), "mq-cbf29ce484222325");
        assert_eq!(resolve("jobs").link_name().len(), 3 + 16);
    }
}
