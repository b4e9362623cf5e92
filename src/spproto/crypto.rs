//! Cipher, hash and padding primitives. Everything in here is synchronous and is called from
//!  thread work.

use aes::{Aes128, Aes256};
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, InnerIvInit, KeyInit};
use aes::cipher::generic_array::GenericArray;
use anyhow::anyhow;
use sha2::{Digest, Sha256, Sha512};
use crate::spproto::{CipherMode, HashMode};

/// A keyed block cipher used in CBC mode
#[derive(Clone)]
pub enum BlockCipher {
    Aes128(Aes128),
    Aes256(Aes256),
}

impl BlockCipher {
    pub fn new(mode: CipherMode, key: &[u8]) -> anyhow::Result<BlockCipher> {
        if key.len() != mode.key_size() {
            return Err(anyhow!("{:?} requires a key of {} bytes, got {}", mode, mode.key_size(), key.len()));
        }

        let cipher = match mode {
            CipherMode::Aes128Cbc => Aes128::new_from_slice(key).map(BlockCipher::Aes128),
            CipherMode::Aes256Cbc => Aes256::new_from_slice(key).map(BlockCipher::Aes256),
        };
        cipher.map_err(|_| anyhow!("invalid key length for {:?}", mode))
    }

    pub fn block_size(&self) -> usize {
        16
    }

    /// CBC-encrypt `data` in place. `data` must be a whole number of blocks, `iv` one block.
    pub fn cbc_encrypt(&self, iv: &[u8], data: &mut [u8]) {
        self.check_cbc_input(iv, data);
        let iv = GenericArray::from_slice(iv);

        match self {
            BlockCipher::Aes128(c) => encrypt_blocks(cbc::Encryptor::<Aes128>::inner_iv_init(c.clone(), iv), data),
            BlockCipher::Aes256(c) => encrypt_blocks(cbc::Encryptor::<Aes256>::inner_iv_init(c.clone(), iv), data),
        }
    }

    /// CBC-decrypt `data` in place. `data` must be a whole number of blocks, `iv` one block.
    pub fn cbc_decrypt(&self, iv: &[u8], data: &mut [u8]) {
        self.check_cbc_input(iv, data);
        let iv = GenericArray::from_slice(iv);

        match self {
            BlockCipher::Aes128(c) => decrypt_blocks(cbc::Decryptor::<Aes128>::inner_iv_init(c.clone(), iv), data),
            BlockCipher::Aes256(c) => decrypt_blocks(cbc::Decryptor::<Aes256>::inner_iv_init(c.clone(), iv), data),
        }
    }

    fn check_cbc_input(&self, iv: &[u8], data: &[u8]) {
        assert_eq!(iv.len(), self.block_size());
        assert_eq!(data.len() % self.block_size(), 0, "CBC input is not a whole number of blocks");
    }
}

fn encrypt_blocks<E: BlockEncryptMut>(mut encryptor: E, data: &mut [u8]) {
    for chunk in data.chunks_exact_mut(E::block_size()) {
        encryptor.encrypt_block_mut(GenericArray::from_mut_slice(chunk));
    }
}

fn decrypt_blocks<D: BlockDecryptMut>(mut decryptor: D, data: &mut [u8]) {
    for chunk in data.chunks_exact_mut(D::block_size()) {
        decryptor.decrypt_block_mut(GenericArray::from_mut_slice(chunk));
    }
}

/// Write the hash of `data` to `out`, which must have the hash mode's size
pub fn calc_hash(mode: HashMode, data: &[u8], out: &mut [u8]) {
    match mode {
        HashMode::Sha256 => out.copy_from_slice(&Sha256::digest(data)),
        HashMode::Sha512 => out.copy_from_slice(&Sha512::digest(data)),
    }
}

/// Append the `0x01` terminator and zero padding up to a multiple of `block_size`
pub fn pad(buf: &mut Vec<u8>, block_size: usize) {
    buf.push(0x01);
    let padded_len = buf.len().div_ceil(block_size) * block_size;
    buf.resize(padded_len, 0);
}

/// The length of the content preceding the padding, or `None` if the padding is invalid
pub fn unpadded_len(buf: &[u8]) -> Option<usize> {
    let terminator = buf.iter().rposition(|&b| b != 0)?;
    match buf[terminator] {
        0x01 => Some(terminator),
        _ => None,
    }
}
