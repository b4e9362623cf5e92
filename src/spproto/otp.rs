//! One-time passwords.
//!
//! Both peers derive the same token sequence from a shared seed: the sequence is the CBC
//!  encryption of an all-zero buffer of `num` tokens under the seed's key and IV, read as `u32`
//!  little endian values. The sender uses the tokens in order, the receiver accepts each token of
//!  a known seed at most once, in any order.

use std::collections::VecDeque;
use anyhow::bail;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};
use crate::spproto::crypto::BlockCipher;
use crate::spproto::{CipherMode, OTP_TOKEN_LEN};

/// A seed as negotiated between peers
#[derive(Clone)]
pub struct OtpSeed {
    pub seed_id: u16,
    pub key: Vec<u8>,
    pub iv: Vec<u8>,
}

impl OtpSeed {
    pub fn validate(&self, mode: CipherMode) -> anyhow::Result<()> {
        if self.key.len() != mode.key_size() {
            bail!("OTP seed key must have {} bytes, has {}", mode.key_size(), self.key.len());
        }
        if self.iv.len() != mode.block_size() {
            bail!("OTP seed IV must have {} bytes, has {}", mode.block_size(), self.iv.len());
        }
        Ok(())
    }

    /// Generate the seed's token sequence. This is CPU bound for big `num` and meant to run as
    ///  thread work.
    pub fn generate_tokens(&self, mode: CipherMode, num: u32) -> anyhow::Result<Vec<u32>> {
        self.validate(mode)?;
        let cipher = BlockCipher::new(mode, &self.key)?;

        let mut buf = vec![0u8; num as usize * OTP_TOKEN_LEN];
        cipher.cbc_encrypt(&self.iv, &mut buf);

        Ok(buf.chunks_exact(OTP_TOKEN_LEN)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

/// The sending side's token source for the current seed
pub struct OtpGenerator {
    seed_id: u16,
    tokens: Vec<u32>,
    position: usize,
}

impl OtpGenerator {
    pub fn new(seed_id: u16, tokens: Vec<u32>) -> OtpGenerator {
        OtpGenerator {
            seed_id,
            tokens,
            position: 0,
        }
    }

    pub fn seed_id(&self) -> u16 {
        self.seed_id
    }

    pub fn remaining(&self) -> usize {
        self.tokens.len() - self.position
    }

    pub fn next_token(&mut self) -> Option<u32> {
        let token = *self.tokens.get(self.position)?;
        self.position += 1;
        Some(token)
    }
}

struct SeedTokens {
    seed_id: u16,
    /// token -> number of unused occurrences
    unused: FxHashMap<u32, u32>,
}

/// The receiving side's record of the most recent seeds and their unused tokens
pub struct OtpChecker {
    num_seeds: usize,
    seeds: VecDeque<SeedTokens>,
}

impl OtpChecker {
    pub fn new(num_seeds: usize) -> OtpChecker {
        assert!(num_seeds > 0);
        OtpChecker {
            num_seeds,
            seeds: VecDeque::with_capacity(num_seeds),
        }
    }

    /// Add a seed's tokens, evicting the oldest seed if the checker is full. A seed with the same
    ///  id as an existing one replaces it.
    pub fn add_seed(&mut self, seed_id: u16, tokens: Vec<u32>) {
        self.seeds.retain(|s| s.seed_id != seed_id);
        if self.seeds.len() == self.num_seeds {
            if let Some(evicted) = self.seeds.pop_front() {
                debug!("evicting OTP seed {}", evicted.seed_id);
            }
        }

        let mut unused = FxHashMap::default();
        for token in tokens {
            *unused.entry(token).or_insert(0) += 1;
        }
        self.seeds.push_back(SeedTokens { seed_id, unused });
    }

    pub fn remove_seeds(&mut self) {
        self.seeds.clear();
    }

    pub fn num_seeds(&self) -> usize {
        self.seeds.len()
    }

    /// Accept a token if it belongs to a known seed and was not used yet, consuming it.
    pub fn check(&mut self, seed_id: u16, token: u32) -> bool {
        let Some(seed) = self.seeds.iter_mut().find(|s| s.seed_id == seed_id) else {
            trace!("unknown OTP seed {}", seed_id);
            return false;
        };

        match seed.unused.get_mut(&token) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                seed.unused.remove(&token);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn seed(seed_id: u16, key_byte: u8) -> OtpSeed {
        OtpSeed {
            seed_id,
            key: vec![key_byte; 16],
            iv: vec![key_byte.wrapping_add(1); 16],
        }
    }

    #[test]
    fn test_generation_is_deterministic() {
        let a = seed(1, 5).generate_tokens(CipherMode::Aes128Cbc, 64).unwrap();
        let b = seed(1, 5).generate_tokens(CipherMode::Aes128Cbc, 64).unwrap();
        let c = seed(1, 6).generate_tokens(CipherMode::Aes128Cbc, 64).unwrap();

        assert_eq!(a.len(), 64);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[rstest]
    #[case::short_key(OtpSeed { seed_id: 1, key: vec![0; 15], iv: vec![0; 16] })]
    #[case::short_iv(OtpSeed { seed_id: 1, key: vec![0; 16], iv: vec![0; 8] })]
    fn test_generation_rejects_bad_seed(#[case] seed: OtpSeed) {
        assert!(seed.generate_tokens(CipherMode::Aes128Cbc, 4).is_err());
    }

    #[test]
    fn test_generator_runs_out() {
        let mut generator = OtpGenerator::new(3, vec![10, 11, 12]);
        assert_eq!(generator.remaining(), 3);
        assert_eq!(generator.next_token(), Some(10));
        assert_eq!(generator.next_token(), Some(11));
        assert_eq!(generator.remaining(), 1);
        assert_eq!(generator.next_token(), Some(12));
        assert_eq!(generator.next_token(), None);
        assert_eq!(generator.remaining(), 0);
    }

    #[test]
    fn test_checker_accepts_each_token_once() {
        let mut checker = OtpChecker::new(2);
        checker.add_seed(1, vec![100, 200, 300]);

        assert!(checker.check(1, 200));
        assert!(!checker.check(1, 200));
        assert!(checker.check(1, 100));
        assert!(!checker.check(1, 999));
        assert!(!checker.check(2, 300));
    }

    #[test]
    fn test_checker_counts_duplicate_tokens() {
        let mut checker = OtpChecker::new(1);
        checker.add_seed(1, vec![7, 7]);

        assert!(checker.check(1, 7));
        assert!(checker.check(1, 7));
        assert!(!checker.check(1, 7));
    }

    #[test]
    fn test_checker_evicts_oldest_seed() {
        let mut checker = OtpChecker::new(2);
        checker.add_seed(1, vec![1]);
        checker.add_seed(2, vec![2]);
        checker.add_seed(3, vec![3]);

        assert_eq!(checker.num_seeds(), 2);
        assert!(!checker.check(1, 1));
        assert!(checker.check(2, 2));
        assert!(checker.check(3, 3));
    }

    #[test]
    fn test_checker_replaces_seed_with_same_id() {
        let mut checker = OtpChecker::new(2);
        checker.add_seed(1, vec![1]);
        checker.add_seed(2, vec![2]);
        checker.add_seed(1, vec![5]);

        assert_eq!(checker.num_seeds(), 2);
        assert!(checker.check(2, 2));
        assert!(!checker.check(1, 1));
        assert!(checker.check(1, 5));

        checker.remove_seeds();
        assert_eq!(checker.num_seeds(), 0);
    }

    #[test]
    fn test_generator_and_checker_agree() {
        let s = seed(9, 1);
        let tokens = s.generate_tokens(CipherMode::Aes256Cbc, 8);
        assert!(tokens.is_err(), "16 byte key is too short for AES-256");

        let tokens = s.generate_tokens(CipherMode::Aes128Cbc, 8).unwrap();
        let mut generator = OtpGenerator::new(s.seed_id, tokens.clone());
        let mut checker = OtpChecker::new(1);
        checker.add_seed(s.seed_id, tokens);

        while let Some(token) = generator.next_token() {
            assert!(checker.check(generator.seed_id(), token));
        }
    }
}
