//! Base62 identifiers (`0-9A-Za-z`).
//!
//! The auxiliary services key cases by the base62 encoding of the raw bytes
//! of their absolute path. Leading zero bytes are kept as leading `0`
//! digits so the encoding is reversible byte for byte.

use std::path::Path;

const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

fn digit_value(c: u8) -> Option<u32> {
    match c {
        b'0'..=b'9' => Some(u32::from(c - b'0')),
        b'A'..=b'Z' => Some(u32::from(c - b'A') + 10),
        b'a'..=b'z' => Some(u32::from(c - b'a') + 36),
        _ => None,
    }
}

pub fn encode(bytes: &[u8]) -> String {
    let zeros = bytes.iter().take_while(|&&b| b == 0).count();

    // Little-endian base62 digits of the big-endian number in `bytes`.
    let mut digits: Vec<u8> = Vec::with_capacity(bytes.len() * 4 / 3 + 1);
    for &byte in &bytes[zeros..] {
        let mut carry = u32::from(byte);
        for digit in digits.iter_mut() {
            carry += u32::from(*digit) << 8;
            *digit = (carry % 62) as u8;
            carry /= 62;
        }
        while carry > 0 {
            digits.push((carry % 62) as u8);
            carry /= 62;
        }
    }

    let mut out = String::with_capacity(zeros + digits.len());
    out.extend(std::iter::repeat('0').take(zeros));
    out.extend(digits.iter().rev().map(|&d| char::from(ALPHABET[usize::from(d)])));
    out
}

/// Inverse of [`encode`]; `None` on characters outside the alphabet.
pub fn decode(text: &str) -> Option<Vec<u8>> {
    let zeros = text.bytes().take_while(|&c| c == b'0').count();

    let mut bytes: Vec<u8> = Vec::with_capacity(text.len());
    for c in text.bytes().skip(zeros) {
        let mut carry = digit_value(c)?;
        for byte in bytes.iter_mut() {
            carry += u32::from(*byte) * 62;
            *byte = (carry & 0xff) as u8;
            carry >>= 8;
        }
        while carry > 0 {
            bytes.push((carry & 0xff) as u8);
            carry >>= 8;
        }
    }

    let mut out = vec![0u8; zeros];
    out.extend(bytes.iter().rev());
    Some(out)
}

#[cfg(unix)]
fn path_bytes(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().to_vec()
}

#[cfg(not(unix))]
fn path_bytes(path: &Path) -> Vec<u8> {
    path.to_string_lossy().into_owned().into_bytes()
}

/// Service id of a case directory.
pub fn encode_path(path: &Path) -> String {
    encode(&path_bytes(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_values() {
        assert_eq!(encode(b""), "");
        assert_eq!(encode(&[61]), "z");
        assert_eq!(encode(&[62]), "10");
        assert_eq!(encode(&[1, 0]), "48");
        assert_eq!(encode(b"hello"), "7tQLFHz");
    }

    #[test]
    fn test_leading_zero_bytes_are_kept() {
        assert_eq!(encode(&[0, 0, 1]), "001");
        assert_eq!(decode("001").unwrap(), vec![0, 0, 1]);
    }

    #[test]
    fn test_paths_are_reversible() {
        let path = Path::new("/data/pmo/2020_01_rv1/decomp");
        let id = encode_path(path);
        assert!(id.bytes().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(decode(&id).unwrap(), path.to_str().unwrap().as_bytes());
    }

    #[test]
    fn test_decode_rejects_foreign_characters() {
        assert!(decode("abc-def").is_none());
        assert!(decode("abc/def").is_none());
    }
}
