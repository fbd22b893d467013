//! One-time backup codes.
//!
//! Codes are shown as `XXXX-XXXX` and stored as the SHA-256 hex of the
//! normalized form. Older rows hashed the display form, so matching tries
//! both digests.

use crate::tokens::hash_token;
use rand::{Rng, rngs::OsRng};

const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_LEN: usize = 8;
const GROUP_LEN: usize = 4;

/// Generate `count` display-form codes.
#[must_use]
pub fn generate_backup_codes(count: usize) -> Vec<String> {
    let mut rng = OsRng;
    (0..count)
        .map(|_| {
            let raw: String = (0..CODE_LEN)
                .map(|_| char::from(ALPHABET[rng.gen_range(0..ALPHABET.len())]))
                .collect();
            format!("{}-{}", &raw[..GROUP_LEN], &raw[GROUP_LEN..])
        })
        .collect()
}

/// Strip separators and whitespace, uppercase.
#[must_use]
pub fn normalize_backup_code(code: &str) -> String {
    code.chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .flat_map(char::to_uppercase)
        .collect()
}

/// Digest written for a newly generated code.
#[must_use]
pub fn hash_backup_code(code: &str) -> String {
    hash_token(&normalize_backup_code(code))
}

/// Every digest an input may be stored under.
#[must_use]
pub fn candidate_hashes(code: &str) -> Vec<String> {
    let normalized = normalize_backup_code(code);
    if normalized.is_empty() {
        return Vec::new();
    }
    let mut hashes = vec![hash_token(&normalized)];
    if normalized.len() == CODE_LEN && normalized.is_ascii() {
        let display = format!("{}-{}", &normalized[..GROUP_LEN], &normalized[GROUP_LEN..]);
        hashes.push(hash_token(&display));
    }
    hashes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_codes_use_display_format() {
        let codes = generate_backup_codes(10);
        assert_eq!(codes.len(), 10);
        for code in &codes {
            assert_eq!(code.len(), 9);
            assert_eq!(code.as_bytes()[4], b'-');
            assert!(
                code.bytes()
                    .filter(|b| *b != b'-')
                    .all(|b| ALPHABET.contains(&b))
            );
        }
    }

    #[test]
    fn normalization_ignores_case_and_separators() {
        assert_eq!(normalize_backup_code(" abcd-efgh "), "ABCDEFGH");
        assert_eq!(hash_backup_code("abcd efgh"), hash_backup_code("ABCD-EFGH"));
    }

    #[test]
    fn candidates_include_legacy_display_hash() {
        let hashes = candidate_hashes("abcdefgh");
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes[0], hash_token("ABCDEFGH"));
        assert_eq!(hashes[1], hash_token("ABCD-EFGH"));
        assert!(candidate_hashes(" - ").is_empty());
    }
}
