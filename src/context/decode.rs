//! Decode hooks for account contexts
//!
//! A decoder only ever sees bytes of an account that exists. It must fail
//! with a [`DecodeError`] for foreign or malformed data; absence is handled
//! upstream and never reaches it.

use crate::error::DecodeError;
use serde::de::DeserializeOwned;
use std::sync::Arc;

type DecodeFn<R> = Arc<dyn Fn(&[u8]) -> Result<R, DecodeError> + Send + Sync>;

/// Pluggable `bytes -> record` function
pub struct Decoder<R> {
    decode: DecodeFn<R>,
}

impl<R> Clone for Decoder<R> {
    fn clone(&self) -> Self {
        Self {
            decode: self.decode.clone(),
        }
    }
}

impl<R> std::fmt::Debug for Decoder<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Decoder<{}>", std::any::type_name::<R>())
    }
}

impl<R> Decoder<R> {
    pub fn new<F>(decode: F) -> Self
    where
        F: Fn(&[u8]) -> Result<R, DecodeError> + Send + Sync + 'static,
    {
        Self {
            decode: Arc::new(decode),
        }
    }

    /// Check a leading discriminator, then decode the remaining bytes
    pub fn discriminated<F>(discriminator: &'static [u8], decode: F) -> Self
    where
        F: Fn(&[u8]) -> Result<R, DecodeError> + Send + Sync + 'static,
    {
        Self::new(move |data| decode(strip_discriminator(discriminator, data)?))
    }

    pub fn decode(&self, data: &[u8]) -> Result<R, DecodeError> {
        (self.decode)(data)
    }
}

impl<R: DeserializeOwned> Decoder<R> {
    /// Discriminator followed by a bincode body
    ///
    /// Trailing bytes after the body are ignored, as account allocations are
    /// commonly larger than the record they hold.
    pub fn bincode_with_discriminator(discriminator: &'static [u8]) -> Self {
        Self::discriminated(discriminator, |body| {
            bincode::deserialize(body).map_err(|e| DecodeError::Malformed(e.to_string()))
        })
    }
}

/// Split off and verify `discriminator`
pub fn strip_discriminator<'a>(
    discriminator: &[u8],
    data: &'a [u8],
) -> Result<&'a [u8], DecodeError> {
    if data.len() < discriminator.len() {
        return Err(DecodeError::TooShort {
            len: data.len(),
            min: discriminator.len(),
        });
    }
    let (found, body) = data.split_at(discriminator.len());
    if found != discriminator {
        return Err(DecodeError::Discriminator {
            expected: discriminator.to_vec(),
            found: found.to_vec(),
        });
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    const VAULT: &[u8] = &[211, 8, 232, 43, 2, 152, 117, 119];
    const RECEIPT: &[u8] = &[1, 2, 3, 4, 5, 6, 7, 8];

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Vault {
        supply: u64,
        paused: bool,
    }

    fn encode(discriminator: &[u8], vault: &Vault) -> Vec<u8> {
        let mut data = discriminator.to_vec();
        data.extend(bincode::serialize(vault).unwrap());
        data
    }

    #[test]
    fn test_bincode_decoder() {
        let decoder = Decoder::<Vault>::bincode_with_discriminator(VAULT);
        let vault = Vault {
            supply: 1_000,
            paused: false,
        };
        let mut data = encode(VAULT, &vault);
        data.extend([0u8; 32]);
        assert_eq!(decoder.decode(&data).unwrap(), vault);
    }

    #[test]
    fn test_foreign_discriminator_is_rejected() {
        let decoder = Decoder::<Vault>::bincode_with_discriminator(VAULT);
        let data = encode(
            RECEIPT,
            &Vault {
                supply: 1,
                paused: true,
            },
        );
        match decoder.decode(&data) {
            Err(DecodeError::Discriminator { expected, found }) => {
                assert_eq!(expected, VAULT);
                assert_eq!(found, RECEIPT);
            }
            other => panic!("expected discriminator error, got {:?}", other),
        }
    }

    #[test]
    fn test_short_and_malformed_payloads() {
        let decoder = Decoder::<Vault>::bincode_with_discriminator(VAULT);
        assert_eq!(
            decoder.decode(&VAULT[..3]),
            Err(DecodeError::TooShort { len: 3, min: 8 })
        );
        assert!(matches!(
            decoder.decode(VAULT),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_custom_decoder() {
        let decoder = Decoder::new(|data: &[u8]| {
            data.first()
                .copied()
                .ok_or(DecodeError::TooShort { len: 0, min: 1 })
        });
        assert_eq!(decoder.clone().decode(&[9, 9]), Ok(9));
        assert!(decoder.decode(&[]).is_err());
    }
}
