//! Property-based tests for the cache encryption layer.
//!
//! These verify the properties the cache store depends on:
//! - Both modes round-trip arbitrary records
//! - The authenticated mode detects tampering
//! - Wrong keys fail decryption
//! - Derivation is deterministic per device/app pair

use proptest::prelude::*;
use warden_crypto::{
    decrypt, decrypt_string, deobfuscate, derive_key, encrypt, encrypt_string, obfuscate,
    stream_key, DerivedKey, EncryptedData, NONCE_SIZE,
};

fn plaintext_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..4096)
}

fn string_plaintext_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[\\x00-\\x7F]{0,1000}").unwrap()
}

fn key_strategy() -> impl Strategy<Value = DerivedKey> {
    prop::array::uniform32(any::<u8>()).prop_map(DerivedKey::from_bytes)
}

mod aead_properties {
    use super::*;

    proptest! {
        /// Encryption followed by decryption with the same key returns the
        /// original plaintext.
        #[test]
        fn roundtrip_preserves_data(key in key_strategy(), plaintext in plaintext_strategy()) {
            let encrypted = encrypt(&key, &plaintext).unwrap();
            let decrypted = decrypt(&key, &encrypted).unwrap();
            prop_assert_eq!(decrypted, plaintext);
        }

        /// String round-trip through the base64 blob codec.
        #[test]
        fn string_roundtrip_preserves_data(key in key_strategy(), plaintext in string_plaintext_strategy()) {
            let encoded = encrypt_string(&key, &plaintext).unwrap();
            let decoded = decrypt_string(&key, &encoded).unwrap();
            prop_assert_eq!(decoded, plaintext);
        }

        /// Same key, same plaintext: nonces differ, both blobs decrypt.
        #[test]
        fn same_key_different_nonces(key in key_strategy(), plaintext in plaintext_strategy()) {
            let a = encrypt(&key, &plaintext).unwrap();
            let b = encrypt(&key, &plaintext).unwrap();
            prop_assert_ne!(a.nonce, b.nonce);
            prop_assert_eq!(decrypt(&key, &a).unwrap(), plaintext.clone());
            prop_assert_eq!(decrypt(&key, &b).unwrap(), plaintext);
        }

        /// Wrong key fails decryption.
        #[test]
        fn wrong_key_fails_decryption(
            key in key_strategy(),
            other in key_strategy(),
            plaintext in plaintext_strategy(),
        ) {
            prop_assume!(key.as_bytes() != other.as_bytes());
            let encrypted = encrypt(&key, &plaintext).unwrap();
            prop_assert!(decrypt(&other, &encrypted).is_err());
        }

        /// Flipping any single bit of the ciphertext fails decryption.
        #[test]
        fn tampering_detected(
            key in key_strategy(),
            plaintext in plaintext_strategy(),
            byte_index in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let mut encrypted = encrypt(&key, &plaintext).unwrap();
            let idx = byte_index.index(encrypted.ciphertext.len());
            encrypted.ciphertext[idx] ^= 1 << bit;
            prop_assert!(decrypt(&key, &encrypted).is_err());
        }

        /// Nonce tampering also fails decryption.
        #[test]
        fn nonce_tampering_detected(
            key in key_strategy(),
            plaintext in plaintext_strategy(),
            idx in 0usize..NONCE_SIZE,
        ) {
            let mut encrypted = encrypt(&key, &plaintext).unwrap();
            encrypted.nonce[idx] ^= 0x01;
            prop_assert!(decrypt(&key, &encrypted).is_err());
        }
    }
}

mod fallback_properties {
    use super::*;

    proptest! {
        /// The XOR fallback round-trips any string.
        #[test]
        fn obfuscation_roundtrip(plaintext in string_plaintext_strategy()) {
            let key = stream_key("machine-a", "app-a");
            let encoded = obfuscate(&key, &plaintext);
            let decoded = deobfuscate(&key, &encoded).unwrap();
            prop_assert_eq!(decoded, plaintext);
        }

        /// A fallback blob is not valid AEAD input under the same key.
        #[test]
        fn fallback_blob_rejected_by_aead(plaintext in prop::string::string_regex("[a-z]{40,200}").unwrap()) {
            let key = stream_key("machine-a", "app-a");
            let encoded = obfuscate(&key, &plaintext);
            if let Ok(blob) = EncryptedData::from_base64(&encoded) {
                prop_assert!(decrypt(&key, &blob).is_err());
            }
        }
    }
}

mod derivation_properties {
    use super::*;

    proptest! {
        /// PBKDF2 derivation is a pure function of password, salt, iterations.
        #[test]
        fn derivation_deterministic(
            password in prop::string::string_regex("[a-zA-Z0-9]{1,64}").unwrap(),
            salt in prop::array::uniform16(any::<u8>()),
        ) {
            let a = derive_key(&password, &salt, 1_000);
            let b = derive_key(&password, &salt, 1_000);
            prop_assert_eq!(a.as_bytes(), b.as_bytes());
        }

        /// Different salts give different keys.
        #[test]
        fn salt_separates_keys(
            password in prop::string::string_regex("[a-zA-Z0-9]{1,64}").unwrap(),
            salt_a in prop::array::uniform16(any::<u8>()),
            salt_b in prop::array::uniform16(any::<u8>()),
        ) {
            prop_assume!(salt_a != salt_b);
            let a = derive_key(&password, &salt_a, 1_000);
            let b = derive_key(&password, &salt_b, 1_000);
            prop_assert_ne!(a.as_bytes(), b.as_bytes());
        }
    }
}
