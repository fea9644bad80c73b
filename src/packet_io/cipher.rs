use aes::Aes128;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use super::errors::{PacketDecodeError, PacketEncodeError};

type Aes128CbcEncryptor = cbc::Encryptor<Aes128>;
type Aes128CbcDecryptor = cbc::Decryptor<Aes128>;

/// Length in bytes of an RTMFP cipher key (and of the AES block)
pub const KEY_SIZE: usize = 16;

/// The well known key every RTMFP handshake datagram is encrypted with
pub const DEFAULT_KEY: &[u8; KEY_SIZE] = b"Adobe Systems 02";

/// AES-128-CBC context used to encrypt or decrypt a single RTMFP datagram.
///
/// Each datagram is an independent CBC stream: the initialization vector is a fixed zero
/// block and no state carries over between datagrams, so one cipher value can process any
/// number of packets in either direction.
#[derive(Clone)]
pub struct RtmfpCipher {
    key: [u8; KEY_SIZE],
}

impl RtmfpCipher {
    /// Creates a cipher from a 16 byte key
    pub fn new(key: &[u8]) -> Result<RtmfpCipher, PacketEncodeError> {
        if key.len() != KEY_SIZE {
            return Err(PacketEncodeError::InvalidKeyLength { size: key.len() });
        }

        let mut bytes = [0_u8; KEY_SIZE];
        bytes.copy_from_slice(key);
        Ok(RtmfpCipher { key: bytes })
    }

    /// Creates a cipher holding the well known handshake key
    pub fn default_key() -> RtmfpCipher {
        RtmfpCipher { key: *DEFAULT_KEY }
    }

    /// Encrypts `data` in place.  The length must be a multiple of the AES block size.
    pub fn encrypt(&self, data: &mut [u8]) {
        let iv = [0_u8; KEY_SIZE];
        let length = data.len();
        debug_assert_eq!(length % KEY_SIZE, 0);

        Aes128CbcEncryptor::new_from_slices(&self.key, &iv)
            .expect("key and iv lengths are fixed")
            .encrypt_padded_mut::<NoPadding>(data, length)
            .expect("length is block aligned");
    }

    /// Decrypts `data` in place
    pub fn decrypt(&self, data: &mut [u8]) -> Result<(), PacketDecodeError> {
        if data.len() % KEY_SIZE != 0 {
            return Err(PacketDecodeError::NotBlockAligned { size: data.len() });
        }

        let size = data.len();
        let iv = [0_u8; KEY_SIZE];
        Aes128CbcDecryptor::new_from_slices(&self.key, &iv)
            .expect("key and iv lengths are fixed")
            .decrypt_padded_mut::<NoPadding>(data)
            .map_err(|_| PacketDecodeError::NotBlockAligned { size })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_returns_the_original_block() {
        let cipher = RtmfpCipher::new(&[3_u8; KEY_SIZE]).unwrap();
        let original = [0xAB_u8; 32];
        let mut buffer = original;

        cipher.encrypt(&mut buffer);
        assert_ne!(&buffer[..], &original[..], "Encryption left the buffer unchanged");

        cipher.decrypt(&mut buffer).unwrap();
        assert_eq!(&buffer[..], &original[..], "Round trip did not restore the plaintext");
    }

    #[test]
    fn key_must_be_sixteen_bytes() {
        match RtmfpCipher::new(&[0_u8; 15]) {
            Err(PacketEncodeError::InvalidKeyLength { size: 15 }) => {}
            Err(x) => panic!("Expected InvalidKeyLength error, instead received {}", x),
            Ok(_) => panic!("Expected InvalidKeyLength error but a cipher was created"),
        }
    }

    #[test]
    fn unaligned_decrypt_is_rejected() {
        let cipher = RtmfpCipher::default_key();
        let mut buffer = [0_u8; 17];
        match cipher.decrypt(&mut buffer) {
            Err(PacketDecodeError::NotBlockAligned { size: 17 }) => {}
            Err(x) => panic!("Expected NotBlockAligned error, instead received {}", x),
            Ok(_) => panic!("Expected NotBlockAligned error but the buffer decrypted"),
        }
    }
}
