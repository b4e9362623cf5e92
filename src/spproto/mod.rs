//! SPProto: the secure packet codec between a peer link's packet stream and its datagrams.
//!
//! Each of three layers can be enabled independently: one-time-password authentication, a hash
//!  over the packet, and encryption. Both ends of a link must be configured identically.
//!
//! ## Packet structure
//!
//! Plaintext, all integers little endian:
//! ```ascii
//! 0:  OTP seed id (u16)      - if OTP is enabled
//! 2:  OTP token (u32)        - if OTP is enabled
//! *:  hash (hash mode size)  - if hashing is enabled
//! *:  payload
//! ```
//!
//! The hash is calculated over the full plaintext with the hash field set to zero.
//!
//! With encryption enabled, the plaintext is padded by appending a single `0x01` byte and then
//!  `0x00` bytes up to a multiple of the cipher's block size, and encrypted in CBC mode with a
//!  fresh random IV per packet:
//! ```ascii
//! 0:  IV (block size)
//! *:  CBC(plaintext || 0x01 || 0x00 ...)
//! ```
//!
//! This adds `block size` (IV) plus between 1 and `block size` bytes of padding to the plaintext.
//!
//! ## Work off the reactor
//!
//! Hashing and encryption run as [crate::worker::ThreadWork] while the codec's input keeps its
//!  single in-flight packet. The OTP check is done on the codec's task after the thread work
//!  completed because the checker state is not shared with the worker. Installing or removing an
//!  encryption key discards a packet whose thread work is in flight with the previous key.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::sync::Notify;
use crate::config::SpProtoConfig;
use crate::worker::ThreadWork;

pub mod crypto;
pub mod decoder;
pub mod encoder;
pub mod otp;

pub const OTP_SEED_ID_LEN: usize = 2;
pub const OTP_TOKEN_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CipherMode {
    Aes128Cbc = 1,
    Aes256Cbc = 2,
}

impl CipherMode {
    pub fn block_size(&self) -> usize {
        16
    }

    pub fn key_size(&self) -> usize {
        match self {
            CipherMode::Aes128Cbc => 16,
            CipherMode::Aes256Cbc => 32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum HashMode {
    Sha256 = 1,
    Sha512 = 2,
}

impl HashMode {
    pub fn size(&self) -> usize {
        match self {
            HashMode::Sha256 => 32,
            HashMode::Sha512 => 64,
        }
    }
}

/// Layout and sizes derived from an [SpProtoConfig]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpProtoParams {
    pub encryption: Option<CipherMode>,
    pub hash: Option<HashMode>,
    pub otp: Option<CipherMode>,
}

impl SpProtoParams {
    pub fn new(config: &SpProtoConfig) -> SpProtoParams {
        SpProtoParams {
            encryption: config.encryption,
            hash: config.hash,
            otp: config.otp.as_ref().map(|o| o.mode),
        }
    }

    pub fn otp_len(&self) -> usize {
        match self.otp {
            Some(_) => OTP_SEED_ID_LEN + OTP_TOKEN_LEN,
            None => 0,
        }
    }

    pub fn hash_len(&self) -> usize {
        self.hash.map(|h| h.size()).unwrap_or(0)
    }

    pub fn hash_offset(&self) -> usize {
        self.otp_len()
    }

    /// length of the plaintext header preceding the payload
    pub fn header_len(&self) -> usize {
        self.otp_len() + self.hash_len()
    }

    /// the size of an encoded packet carrying `payload_mtu` bytes of payload
    pub fn carrier_mtu_for_payload_mtu(&self, payload_mtu: usize) -> usize {
        let plaintext_len = self.header_len() + payload_mtu;
        match self.encryption {
            Some(cipher) => {
                let block_size = cipher.block_size();
                (plaintext_len + 1).div_ceil(block_size) * block_size + block_size
            }
            None => plaintext_len,
        }
    }

    /// the largest payload fitting into an encoded packet of `carrier_mtu` bytes, `None` if not
    ///  even an empty payload fits
    pub fn payload_mtu_for_carrier_mtu(&self, carrier_mtu: usize) -> Option<usize> {
        let plaintext_mtu = match self.encryption {
            Some(cipher) => {
                let block_size = cipher.block_size();
                let ciphertext_mtu = carrier_mtu.checked_sub(block_size)?;
                (ciphertext_mtu / block_size * block_size).checked_sub(1)?
            }
            None => carrier_mtu,
        };
        plaintext_mtu.checked_sub(self.header_len())
    }
}

/// Await thread work, giving up as soon as `still_valid` turns false after a notification on
///  `changed`. Giving up drops the work, so its result is never observed.
pub(crate) async fn finish_work<T: Send + 'static>(mut work: ThreadWork<T>, changed: &Notify, still_valid: impl Fn() -> bool) -> Option<T> {
    loop {
        let notified = changed.notified();
        if !still_valid() {
            return None;
        }

        tokio::select! {
            result = &mut work => return result,
            _ = notified => {}
        }
    }
}
