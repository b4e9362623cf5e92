use std::sync::{Arc, Mutex};
use anyhow::bail;
use async_trait::async_trait;
use bytes::BufMut;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use crate::config::{OtpConfig, SpProtoConfig};
use crate::flow::PacketPass;
use crate::spproto::crypto::{calc_hash, pad, BlockCipher};
use crate::spproto::otp::{OtpGenerator, OtpSeed};
use crate::spproto::{finish_work, SpProtoParams};
use crate::util::random::Random;
use crate::worker::ThreadWork;

/// Build an encoded packet. Runs as thread work.
pub(crate) fn encode_packet(params: &SpProtoParams, cipher: Option<&BlockCipher>, otp: Option<(u16, u32)>, iv: &[u8], payload: &[u8]) -> Vec<u8> {
    let header_len = params.header_len();
    let mut plaintext = Vec::with_capacity(params.carrier_mtu_for_payload_mtu(payload.len()));

    if let Some((seed_id, token)) = otp {
        plaintext.put_u16_le(seed_id);
        plaintext.put_u32_le(token);
    }
    plaintext.resize(header_len, 0);
    plaintext.put_slice(payload);

    if let Some(hash_mode) = params.hash {
        let mut hash = vec![0u8; hash_mode.size()];
        calc_hash(hash_mode, &plaintext, &mut hash);
        let offset = params.hash_offset();
        plaintext[offset..offset + hash.len()].copy_from_slice(&hash);
    }

    match cipher {
        Some(cipher) => {
            pad(&mut plaintext, cipher.block_size());
            cipher.cbc_encrypt(iv, &mut plaintext);

            let mut packet = Vec::with_capacity(iv.len() + plaintext.len());
            packet.put_slice(iv);
            packet.put_slice(&plaintext);
            packet
        }
        None => plaintext,
    }
}

struct EncodeJob {
    cipher: Option<Arc<BlockCipher>>,
    key_generation: u64,
    otp: Option<(u16, u32)>,
}

struct EncoderState {
    cipher: Option<Arc<BlockCipher>>,
    key_generation: u64,
    otp: Option<OtpGenerator>,
    otp_epoch: u64,
    otp_job: Option<JoinHandle<()>>,
}

impl EncoderState {
    /// Take what is needed for encoding the next packet, consuming an OTP. `None` if the encoder
    ///  is not ready: the key is missing, the OTP seed is still being generated, or its tokens
    ///  are used up.
    fn try_start(&mut self, params: &SpProtoParams) -> Option<(EncodeJob, Option<usize>)> {
        if params.encryption.is_some() && self.cipher.is_none() {
            return None;
        }

        let (otp, remaining) = match (params.otp, &mut self.otp) {
            (None, _) => (None, None),
            (Some(_), None) => return None,
            (Some(_), Some(generator)) => {
                let token = generator.next_token()?;
                (Some((generator.seed_id(), token)), Some(generator.remaining()))
            }
        };

        Some((
            EncodeJob {
                cipher: self.cipher.clone(),
                key_generation: self.key_generation,
                otp,
            },
            remaining,
        ))
    }
}

struct EncoderShared {
    params: SpProtoParams,
    otp_config: Option<OtpConfig>,
    state: Mutex<EncoderState>,
    changed: Notify,
    otp_warning: watch::Sender<Option<u16>>,
}

impl EncoderShared {
    fn key_generation(&self) -> u64 {
        self.state.lock().unwrap().key_generation
    }

    /// Install a seed's generated tokens. `generated` is `None` if the generating thread panicked.
    ///  Results for a seed that was replaced in the meantime are ignored.
    fn otp_generated(&self, epoch: u64, seed_id: u16, generated: Option<anyhow::Result<Vec<u32>>>) {
        {
            let mut state = self.state.lock().unwrap();
            if state.otp_epoch != epoch {
                return;
            }
            state.otp_job = None;

            match generated {
                Some(Ok(tokens)) => state.otp = Some(OtpGenerator::new(seed_id, tokens)),
                Some(Err(e)) => {
                    warn!("error generating OTPs for seed {}: {}", seed_id, e);
                    return;
                }
                None => {
                    warn!("generating OTPs for seed {} failed", seed_id);
                    return;
                }
            }
        }
        debug!("encoder: OTP seed {} ready", seed_id);
        self.changed.notify_waiters();
    }
}

/// Encodes plaintext packets to SPProto packets, see the [module documentation](super).
///
/// A packet passed to the encoder waits until the encoder is ready, i.e. until an encryption
///  key is installed (if encryption is enabled) and an OTP is available (if OTPs are enabled).
pub struct SpProtoEncoder<O> {
    shared: Arc<EncoderShared>,
    output: O,
    random: Arc<dyn Random>,
    payload_mtu: usize,
}

impl<O: PacketPass> SpProtoEncoder<O> {
    pub fn new(config: &SpProtoConfig, output: O, random: Arc<dyn Random>) -> anyhow::Result<(SpProtoEncoder<O>, SpProtoEncoderControl)> {
        config.validate()?;
        let params = config.params();

        let Some(payload_mtu) = params.payload_mtu_for_carrier_mtu(output.mtu()) else {
            bail!("output MTU {} is too small for the SPProto overhead", output.mtu());
        };

        let (otp_warning, _) = watch::channel(None);
        let shared = Arc::new(EncoderShared {
            params,
            otp_config: config.otp.clone(),
            state: Mutex::new(EncoderState {
                cipher: None,
                key_generation: 0,
                otp: None,
                otp_epoch: 0,
                otp_job: None,
            }),
            changed: Notify::new(),
            otp_warning,
        });

        Ok((
            SpProtoEncoder {
                shared: shared.clone(),
                output,
                random,
                payload_mtu,
            },
            SpProtoEncoderControl { shared },
        ))
    }

    async fn wait_until_ready(shared: &EncoderShared) -> EncodeJob {
        loop {
            let notified = shared.changed.notified();

            let started = shared.state.lock().unwrap().try_start(&shared.params);
            if let Some((job, remaining)) = started {
                if let (Some((seed_id, _)), Some(remaining), Some(otp_config)) = (job.otp, remaining, &shared.otp_config) {
                    if remaining == otp_config.warning_count as usize {
                        info!("OTPs of seed {} running low: {} left", seed_id, remaining);
                        shared.otp_warning.send_replace(Some(seed_id));
                    }
                }
                return job;
            }

            trace!("encoder not ready - waiting");
            notified.await;
        }
    }
}

#[async_trait]
impl<O: PacketPass> PacketPass for SpProtoEncoder<O> {
    fn mtu(&self) -> usize {
        self.payload_mtu
    }

    async fn send(&mut self, packet: &[u8]) {
        assert!(packet.len() <= self.payload_mtu);

        let job = Self::wait_until_ready(&self.shared).await;

        let mut iv = vec![0u8; self.shared.params.encryption.map(|c| c.block_size()).unwrap_or(0)];
        self.random.fill_bytes(&mut iv);

        let params = self.shared.params;
        let payload = packet.to_vec();
        let cipher = job.cipher;
        let otp = job.otp;
        let work = ThreadWork::spawn(move || encode_packet(&params, cipher.as_deref(), otp, &iv, &payload));

        let shared = &self.shared;
        let Some(encoded) = finish_work(work, &shared.changed, || shared.key_generation() == job.key_generation).await else {
            debug!("encryption key changed while encoding - dropping packet");
            return;
        };

        trace!("encoded packet: {} -> {} bytes", packet.len(), encoded.len());
        self.output.send(&encoded).await;
    }
}

/// Changes the encoder's keys and seeds while it is running
#[derive(Clone)]
pub struct SpProtoEncoderControl {
    shared: Arc<EncoderShared>,
}

impl SpProtoEncoderControl {
    pub fn set_encryption_key(&self, key: &[u8]) -> anyhow::Result<()> {
        let Some(mode) = self.shared.params.encryption else {
            bail!("encryption is not enabled");
        };
        let cipher = BlockCipher::new(mode, key)?;

        {
            let mut state = self.shared.state.lock().unwrap();
            state.cipher = Some(Arc::new(cipher));
            state.key_generation += 1;
        }
        debug!("encoder: new encryption key");
        self.shared.changed.notify_waiters();
        Ok(())
    }

    pub fn remove_encryption_key(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.cipher = None;
            state.key_generation += 1;
        }
        debug!("encoder: encryption key removed");
        self.shared.changed.notify_waiters();
    }

    /// Switch to a new OTP seed. The encoder is not ready for OTP packets until the seed's tokens
    ///  are generated in the background.
    pub fn set_otp_seed(&self, seed: OtpSeed) -> anyhow::Result<()> {
        let Some(otp_config) = &self.shared.otp_config else {
            bail!("OTPs are not enabled");
        };
        seed.validate(otp_config.mode)?;

        let mode = otp_config.mode;
        let num = otp_config.num;

        let mut state = self.shared.state.lock().unwrap();
        if let Some(job) = state.otp_job.take() {
            job.abort();
        }
        state.otp = None;
        state.otp_epoch += 1;
        let epoch = state.otp_epoch;

        let shared = self.shared.clone();
        state.otp_job = Some(tokio::spawn(async move {
            let seed_id = seed.seed_id;
            let generated = ThreadWork::spawn(move || seed.generate_tokens(mode, num)).await;
            shared.otp_generated(epoch, seed_id, generated);
        }));
        Ok(())
    }

    pub fn remove_otp_seed(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if let Some(job) = state.otp_job.take() {
            job.abort();
        }
        state.otp = None;
        state.otp_epoch += 1;
    }

    /// The value changes to the seed's id when the seed's tokens are running low
    pub fn subscribe_otp_warning(&self) -> watch::Receiver<Option<u16>> {
        self.shared.otp_warning.subscribe()
    }

    /// `true` if a packet would be encoded right away
    pub fn is_ready(&self) -> bool {
        let state = self.shared.state.lock().unwrap();
        let params = &self.shared.params;

        (params.encryption.is_none() || state.cipher.is_some())
            && (params.otp.is_none() || state.otp.as_ref().map(|g| g.remaining() > 0).unwrap_or(false))
    }
}
