use std::sync::{Arc, Mutex};
use anyhow::bail;
use async_trait::async_trait;
use bytes::Buf;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use crate::config::{OtpConfig, SpProtoConfig};
use crate::flow::PacketPass;
use crate::spproto::crypto::{calc_hash, unpadded_len, BlockCipher};
use crate::spproto::otp::{OtpChecker, OtpSeed};
use crate::spproto::{finish_work, SpProtoParams};
use crate::worker::ThreadWork;

pub(crate) struct DecodedPacket {
    pub otp: Option<(u16, u32)>,
    pub payload: Vec<u8>,
}

/// Decrypt and verify an encoded packet. Runs as thread work.
pub(crate) fn decode_packet(params: &SpProtoParams, cipher: Option<&BlockCipher>, packet: &[u8], payload_mtu: usize) -> anyhow::Result<DecodedPacket> {
    let mut plaintext = match (params.encryption, cipher) {
        (None, _) => packet.to_vec(),
        (Some(_), None) => bail!("no encryption key"),
        (Some(_), Some(cipher)) => {
            let block_size = cipher.block_size();
            if packet.len() % block_size != 0 {
                bail!("packet length {} is not a multiple of the block size", packet.len());
            }
            if packet.len() < block_size {
                bail!("packet is shorter than the IV");
            }

            let (iv, ciphertext) = packet.split_at(block_size);
            let mut buf = ciphertext.to_vec();
            cipher.cbc_decrypt(iv, &mut buf);

            let Some(len) = unpadded_len(&buf) else {
                bail!("invalid padding");
            };
            buf.truncate(len);
            buf
        }
    };

    let header_len = params.header_len();
    if plaintext.len() < header_len {
        bail!("packet of length {} is shorter than the header", plaintext.len());
    }
    if plaintext.len() - header_len > payload_mtu {
        bail!("payload of length {} exceeds the MTU", plaintext.len() - header_len);
    }

    let otp = match params.otp {
        Some(_) => {
            let mut header = &plaintext[..];
            Some((header.get_u16_le(), header.get_u32_le()))
        }
        None => None,
    };

    if let Some(hash_mode) = params.hash {
        let range = params.hash_offset()..params.hash_offset() + hash_mode.size();
        let received = plaintext[range.clone()].to_vec();
        plaintext[range.clone()].fill(0);

        let mut calculated = vec![0u8; hash_mode.size()];
        calc_hash(hash_mode, &plaintext, &mut calculated);
        if calculated != received {
            bail!("hash mismatch");
        }
    }

    Ok(DecodedPacket {
        otp,
        payload: plaintext.split_off(header_len),
    })
}

struct DecoderState {
    cipher: Option<Arc<BlockCipher>>,
    key_generation: u64,
    otp: Option<OtpChecker>,
    otp_epoch: u64,
    otp_jobs: Vec<JoinHandle<()>>,
}

struct DecoderShared {
    params: SpProtoParams,
    otp_config: Option<OtpConfig>,
    state: Mutex<DecoderState>,
    changed: Notify,
}

impl DecoderShared {
    fn key_generation(&self) -> u64 {
        self.state.lock().unwrap().key_generation
    }
}

/// Decodes SPProto packets, passing the payload of valid packets to its output. Invalid packets
///  are dropped: they are expected from a lossy or hostile network and never fail the pipeline.
pub struct SpProtoDecoder<O> {
    shared: Arc<DecoderShared>,
    output: O,
    carrier_mtu: usize,
}

impl<O: PacketPass> SpProtoDecoder<O> {
    pub fn new(config: &SpProtoConfig, output: O) -> anyhow::Result<(SpProtoDecoder<O>, SpProtoDecoderControl)> {
        config.validate()?;
        let params = config.params();
        let carrier_mtu = params.carrier_mtu_for_payload_mtu(output.mtu());

        let shared = Arc::new(DecoderShared {
            params,
            otp_config: config.otp.clone(),
            state: Mutex::new(DecoderState {
                cipher: None,
                key_generation: 0,
                otp: config.otp.as_ref().map(|o| OtpChecker::new(o.num_seeds)),
                otp_epoch: 0,
                otp_jobs: Vec::new(),
            }),
            changed: Notify::new(),
        });

        Ok((
            SpProtoDecoder {
                shared: shared.clone(),
                output,
                carrier_mtu,
            },
            SpProtoDecoderControl { shared },
        ))
    }
}

#[async_trait]
impl<O: PacketPass> PacketPass for SpProtoDecoder<O> {
    fn mtu(&self) -> usize {
        self.carrier_mtu
    }

    async fn send(&mut self, packet: &[u8]) {
        if packet.len() > self.carrier_mtu {
            debug!("dropping packet of length {} exceeding the carrier MTU", packet.len());
            return;
        }

        let (cipher, key_generation) = {
            let state = self.shared.state.lock().unwrap();
            (state.cipher.clone(), state.key_generation)
        };
        if self.shared.params.encryption.is_some() && cipher.is_none() {
            debug!("no decryption key - dropping packet");
            return;
        }

        let params = self.shared.params;
        let payload_mtu = self.output.mtu();
        let encoded = packet.to_vec();
        let work = ThreadWork::spawn(move || decode_packet(&params, cipher.as_deref(), &encoded, payload_mtu));

        let shared = &self.shared;
        let decoded = match finish_work(work, &shared.changed, || shared.key_generation() == key_generation).await {
            None => {
                debug!("decryption key changed while decoding - dropping packet");
                return;
            }
            Some(Err(e)) => {
                debug!("dropping invalid packet: {}", e);
                return;
            }
            Some(Ok(decoded)) => decoded,
        };

        if let Some((seed_id, token)) = decoded.otp {
            let accepted = self.shared.state.lock().unwrap()
                .otp
                .as_mut()
                .map(|checker| checker.check(seed_id, token))
                .unwrap_or(false);
            if !accepted {
                debug!("dropping packet with invalid OTP (seed {})", seed_id);
                return;
            }
        }

        trace!("decoded packet: {} -> {} bytes", packet.len(), decoded.payload.len());
        self.output.send(&decoded.payload).await;
    }
}

/// Changes the decoder's keys and seeds while it is running
#[derive(Clone)]
pub struct SpProtoDecoderControl {
    shared: Arc<DecoderShared>,
}

impl SpProtoDecoderControl {
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
        debug!("decoder: new encryption key");
        self.shared.changed.notify_waiters();
        Ok(())
    }

    pub fn remove_encryption_key(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.cipher = None;
            state.key_generation += 1;
        }
        debug!("decoder: encryption key removed");
        self.shared.changed.notify_waiters();
    }

    /// Start accepting a seed's tokens once they are generated in the background. The oldest
    ///  seed is forgotten if the configured number of seeds is exceeded.
    pub fn add_otp_seed(&self, seed: OtpSeed) -> anyhow::Result<()> {
        let Some(otp_config) = &self.shared.otp_config else {
            bail!("OTPs are not enabled");
        };
        seed.validate(otp_config.mode)?;

        let mode = otp_config.mode;
        let num = otp_config.num;

        let mut state = self.shared.state.lock().unwrap();
        state.otp_jobs.retain(|job| !job.is_finished());
        let epoch = state.otp_epoch;

        let shared = self.shared.clone();
        state.otp_jobs.push(tokio::spawn(async move {
            let seed_id = seed.seed_id;
            let Some(generated) = ThreadWork::spawn(move || seed.generate_tokens(mode, num)).await else {
                return;
            };

            match generated {
                Ok(tokens) => {
                    let mut state = shared.state.lock().unwrap();
                    if state.otp_epoch != epoch {
                        return;
                    }
                    if let Some(checker) = &mut state.otp {
                        checker.add_seed(seed_id, tokens);
                        debug!("decoder: accepting OTP seed {}", seed_id);
                    }
                }
                Err(e) => warn!("error generating OTPs for seed {}: {}", seed_id, e),
            }
        }));
        Ok(())
    }

    pub fn remove_otp_seeds(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.otp_epoch += 1;
        for job in state.otp_jobs.drain(..) {
            job.abort();
        }
        if let Some(checker) = &mut state.otp {
            checker.remove_seeds();
        }
    }

    pub fn num_otp_seeds(&self) -> usize {
        self.shared.state.lock().unwrap()
            .otp
            .as_ref()
            .map(|c| c.num_seeds())
            .unwrap_or(0)
    }
}
