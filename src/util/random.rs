use rand::RngCore;

/// Source of randomness for IVs and key material, abstracted to allow deterministic tests
#[cfg_attr(test, mockall::automock)]
pub trait Random: Send + Sync {
    fn fill_bytes(&self, buf: &mut [u8]);
}

pub struct RngRandom;
impl Random for RngRandom {
    fn fill_bytes(&self, buf: &mut [u8]) {
        rand::thread_rng().fill_bytes(buf);
    }
}
