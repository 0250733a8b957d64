use md5::{Digest, Md5};

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// MD5 of `data` as a lowercase hex string, the format the relay protocol expects lines to be
///  answered in.
pub fn md5_hex(data: &[u8]) -> String {
    let digest = Md5::digest(data);
    let mut hex = String::with_capacity(2 * digest.len());
    for byte in digest {
        hex.push(HEX_DIGITS[(byte >> 4) as usize] as char);
        hex.push(HEX_DIGITS[(byte & 0x0f) as usize] as char);
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty(b"", "d41d8cd98f00b204e9800998ecf8427e")]
    #[case::abc(b"abc", "900150983cd24fb0d6963f7d28e17f72")]
    #[case::pangram(
        b"The quick brown fox jumps over the lazy dog",
        "9e107d9d372bb6826bd81d3542a419d6"
    )]
    fn test_md5_hex(#[case] data: &[u8], #[case] expected: &str) {
        assert_eq!(md5_hex(data), expected);
    }
}
