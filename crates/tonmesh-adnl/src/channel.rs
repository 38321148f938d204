//! Symmetric channels
//!
//! Both peers compute `secret = shared_key(own ephemeral, peer ephemeral)`.
//! The side with the smaller short id decrypts with `secret` and encrypts
//! with the byte-reversed secret; the other side mirrors that. A channel to
//! oneself uses `secret` both ways.

use std::sync::atomic::{AtomicBool, Ordering};

use tonmesh_crypto::{AesKey, CryptoResult, PrivateKey, PublicKey, ShortId};

/// An established symmetric session with one peer
pub struct Channel {
    input: AesKey,
    input_id: ShortId,
    output: AesKey,
    output_id: ShortId,
    /// Peer's ephemeral key the channel was derived from
    remote_key: PublicKey,
    date: u32,
    /// Set once the peer is known to hold the channel too
    ready: AtomicBool,
}

impl Channel {
    /// Derive a channel from our ephemeral key and the peer's
    pub fn new(
        local_key: &PrivateKey,
        remote_key: &PublicKey,
        local_id: &ShortId,
        remote_id: &ShortId,
        date: u32,
    ) -> Self {
        let shared = local_key.shared_key(remote_key);
        let secret = *shared.as_bytes();
        let reversed = shared.reversed();

        let (input, output) = match local_id.cmp(remote_id) {
            std::cmp::Ordering::Less => (secret, reversed),
            std::cmp::Ordering::Greater => (reversed, secret),
            std::cmp::Ordering::Equal => (secret, secret),
        };
        let input = AesKey::from_bytes(input);
        let output = AesKey::from_bytes(output);

        Self {
            input_id: input.short_id(),
            output_id: output.short_id(),
            input,
            output,
            remote_key: *remote_key,
            date,
            ready: AtomicBool::new(false),
        }
    }

    /// Id peers address datagrams to when sending to us
    pub fn input_id(&self) -> ShortId {
        self.input_id
    }

    /// Id we address datagrams to when sending to the peer
    pub fn output_id(&self) -> ShortId {
        self.output_id
    }

    pub fn remote_key(&self) -> &PublicKey {
        &self.remote_key
    }

    pub fn date(&self) -> u32 {
        self.date
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        self.output.encrypt(plaintext)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        self.input.decrypt(ciphertext)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Returns true if this call made the channel ready
    pub fn mark_ready(&self) -> bool {
        !self.ready.swap(true, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("input_id", &self.input_id)
            .field("output_id", &self.output_id)
            .field("date", &self.date)
            .field("ready", &self.is_ready())
            .finish()
    }
}
