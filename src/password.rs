//! Generation of per-remote-server authentication passwords.

use rand::distributions::Uniform;
use rand::Rng;

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Produces a random alphanumeric password of the requested length.
///
/// Used once per pairing with a SERVER-role peer; the result is stored as the
/// local authentication entry and transported inside the encrypted pairing
/// payload.
pub fn generate_password(length: usize) -> String {
    let range = Uniform::new(0, ALPHABET.len());
    rand::thread_rng()
        .sample_iter(range)
        .take(length)
        .map(|i| ALPHABET[i] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_length_and_charset() {
        let password = generate_password(16);
        assert_eq!(password.len(), 16);
        assert!(password.bytes().all(|b| ALPHABET.contains(&b)));
    }

    #[test]
    fn successive_passwords_differ() {
        assert_ne!(generate_password(16), generate_password(16));
    }
}
