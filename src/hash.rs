//! The deterministic 16-bit string hash used to derive message ids for
//! the binary and JSON codecs. Must stay byte-for-byte reproducible by
//! wire peers, so the formula is never "improved" — see §3 of the spec.

/// `h := h + (h<<5) + c + (c<<7)` over each `char`, wrapping at 16 bits.
pub fn string_hash(s: &str) -> u16 {
    let mut hash: u16 = 0;
    for c in s.chars() {
        let ch = c as u16;
        hash = hash
            .wrapping_add(hash << 5)
            .wrapping_add(ch)
            .wrapping_add(ch << 7);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_hashes_to_zero() {
        assert_eq!(string_hash(""), 0);
    }

    #[test]
    fn is_deterministic() {
        let a = string_hash("Ping");
        let b = string_hash("Ping");
        assert_eq!(a, b);
    }

    #[test]
    fn distinguishes_similar_names() {
        assert_ne!(string_hash("Ping"), string_hash("Pong"));
        assert_ne!(string_hash("Ping"), string_hash("ping"));
    }
}
