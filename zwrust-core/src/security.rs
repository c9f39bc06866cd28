//! Security command class encapsulation
//!
//! Outgoing frames for secure nodes carry an encrypted copy of the command
//! class payload:
//!
//! ```text
//! ┌──────┬──────┬─────────┬────────────┬──────────┬─────────┬─────────┐
//! │ 0x98 │ 0x81 │ IV half │ ciphertext │ nonce id │   tag   │ tx opts │
//! │  1   │  1   │    8    │  1 + N     │    1     │    8    │    1    │
//! └──────┴──────┴─────────┴────────────┴──────────┴─────────┴─────────┘
//! ```
//!
//! The IV is our random half followed by the nonce the receiver handed us.
//! Ciphertext is AES-128-OFB over `[sequence] ++ payload` under the
//! encryption key. The tag is a CBC-MAC under the authentication key.

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::Aes128;
use rand::RngCore;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::{
    callback::CallbackIds,
    constants::{command_class, security},
    error::{Error, Result},
    function::Function,
    message::Message,
};

type Aes128Ofb = ofb::Ofb<Aes128>;

/// AES block and key size
pub const BLOCK_SIZE: usize = 16;

/// Size of each IV half and of a nonce
pub const NONCE_SIZE: usize = 8;

/// Size of the authentication tag
pub const TAG_SIZE: usize = 8;

/// Bytes the encapsulation adds around the ciphertext: cc, command, IV half, nonce id, tag
pub const ENCAP_OVERHEAD: usize = 2 + NONCE_SIZE + 1 + TAG_SIZE;

const ENCRYPTION_KEY_SEED: [u8; BLOCK_SIZE] = [0xAA; BLOCK_SIZE];
const AUTHENTICATION_KEY_SEED: [u8; BLOCK_SIZE] = [0x55; BLOCK_SIZE];

/// Sequence byte flag: frame is part of a two-frame sequence
const SEQUENCED: u8 = 0x10;

fn block_cipher(key: &[u8; BLOCK_SIZE]) -> Result<Aes128> {
    Aes128::new_from_slice(key)
        .map_err(|e| Error::CryptoFailed(format!("Cipher init failed: {:?}", e)))
}

fn encrypt_block(cipher: &Aes128, data: &[u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
    let mut block = GenericArray::clone_from_slice(data);
    cipher.encrypt_block(&mut block);
    let mut out = [0u8; BLOCK_SIZE];
    out.copy_from_slice(&block);
    out
}

/// Keys derived from the network key
#[derive(Clone, PartialEq, Eq)]
pub struct SecurityKeys {
    encryption: [u8; BLOCK_SIZE],
    authentication: [u8; BLOCK_SIZE],
}

impl SecurityKeys {
    /// Derive the encryption and authentication keys
    ///
    /// Encryption key is the network key applied to `0xAA * 16`, the
    /// authentication key to `0x55 * 16`.
    pub fn derive(network_key: &[u8; BLOCK_SIZE]) -> Result<Self> {
        let cipher = block_cipher(network_key)?;
        Ok(Self {
            encryption: encrypt_block(&cipher, &ENCRYPTION_KEY_SEED),
            authentication: encrypt_block(&cipher, &AUTHENTICATION_KEY_SEED),
        })
    }

    pub fn encryption_key(&self) -> &[u8; BLOCK_SIZE] {
        &self.encryption
    }

    pub fn authentication_key(&self) -> &[u8; BLOCK_SIZE] {
        &self.authentication
    }
}

impl std::fmt::Debug for SecurityKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityKeys").finish_non_exhaustive()
    }
}

/// Build the 16-byte IV from our half and the receiver's nonce
pub fn build_iv(iv_half: &[u8; NONCE_SIZE], nonce: &[u8; NONCE_SIZE]) -> [u8; BLOCK_SIZE] {
    let mut iv = [0u8; BLOCK_SIZE];
    iv[..NONCE_SIZE].copy_from_slice(iv_half);
    iv[NONCE_SIZE..].copy_from_slice(nonce);
    iv
}

/// Apply AES-128-OFB in place (encryption and decryption are the same operation)
pub fn apply_ofb(key: &[u8; BLOCK_SIZE], iv: &[u8; BLOCK_SIZE], data: &mut [u8]) -> Result<()> {
    let mut cipher = Aes128Ofb::new_from_slices(key, iv)
        .map_err(|e| Error::CryptoFailed(format!("OFB init failed: {:?}", e)))?;
    cipher.apply_keystream(data);
    Ok(())
}

/// Compute the 8-byte authentication tag of a secure frame
///
/// CBC-MAC over `[command, sender, receiver, len] ++ ciphertext`, zero padded
/// to a block boundary, starting from the encrypted IV. Pure function of its
/// inputs.
pub fn generate_authentication(
    auth_key: &[u8; BLOCK_SIZE],
    iv: &[u8; BLOCK_SIZE],
    command: u8,
    sender: u8,
    receiver: u8,
    ciphertext: &[u8],
) -> Result<[u8; TAG_SIZE]> {
    let cipher = block_cipher(auth_key)?;

    let mut data = Vec::with_capacity(ciphertext.len() + 4 + BLOCK_SIZE);
    data.extend_from_slice(&[command, sender, receiver, ciphertext.len() as u8]);
    data.extend_from_slice(ciphertext);
    let padded = data.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
    data.resize(padded, 0);

    let mut mac = encrypt_block(&cipher, iv);
    for chunk in data.chunks_exact(BLOCK_SIZE) {
        for (m, b) in mac.iter_mut().zip(chunk) {
            *m ^= b;
        }
        mac = encrypt_block(&cipher, &mac);
    }

    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(&mac[..TAG_SIZE]);
    Ok(tag)
}

fn tags_match(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// An encrypted and authenticated command class payload
#[derive(Clone, PartialEq, Eq)]
pub struct SecureFrame {
    /// Security command (`MESSAGE_ENCAP` or `MESSAGE_ENCAP_NONCE_GET`)
    pub command: u8,
    /// Our random IV half
    pub iv_half: [u8; NONCE_SIZE],
    /// Receiver-issued nonce
    pub nonce: [u8; NONCE_SIZE],
    /// `[sequence] ++ payload`, encrypted
    pub ciphertext: Vec<u8>,
    /// CBC-MAC tag
    pub tag: [u8; TAG_SIZE],
}

impl SecureFrame {
    /// Encrypt and authenticate `payload` (command class id onwards)
    pub fn seal(
        keys: &SecurityKeys,
        command: u8,
        iv_half: [u8; NONCE_SIZE],
        nonce: [u8; NONCE_SIZE],
        sender: u8,
        receiver: u8,
        payload: &[u8],
    ) -> Result<Self> {
        let iv = build_iv(&iv_half, &nonce);

        let mut ciphertext = Vec::with_capacity(payload.len() + 1);
        ciphertext.push(0); // Sequence byte: single unsequenced frame
        ciphertext.extend_from_slice(payload);
        apply_ofb(keys.encryption_key(), &iv, &mut ciphertext)?;

        let tag = generate_authentication(
            keys.authentication_key(),
            &iv,
            command,
            sender,
            receiver,
            &ciphertext,
        )?;

        Ok(Self {
            command,
            iv_half,
            nonce,
            ciphertext,
            tag,
        })
    }

    /// Nonce id is the first byte of the receiver's nonce
    pub fn nonce_id(&self) -> u8 {
        self.nonce[0]
    }

    /// Command class bytes as sent on the wire
    pub fn to_command_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.ciphertext.len() + ENCAP_OVERHEAD);
        out.push(command_class::SECURITY);
        out.push(self.command);
        out.extend_from_slice(&self.iv_half);
        out.extend_from_slice(&self.ciphertext);
        out.push(self.nonce_id());
        out.extend_from_slice(&self.tag);
        out
    }

    /// Wrap a finalized SendData message for a secure node
    ///
    /// The returned message keeps the target, reply expectations and attempt
    /// limit of `msg`, is marked secure and is already finalized with a fresh
    /// callback id.
    pub fn encapsulate(
        msg: &Message,
        keys: &SecurityKeys,
        controller_node_id: u8,
        nonce: [u8; NONCE_SIZE],
        rng: &mut impl RngCore,
        ids: &CallbackIds,
    ) -> Result<Message> {
        let payload = msg
            .command_payload()
            .filter(|_| msg.is_finalized())
            .ok_or(Error::NotFinalized)?;

        let mut iv_half = [0u8; NONCE_SIZE];
        rng.fill_bytes(&mut iv_half);

        let sealed = Self::seal(
            keys,
            security::MESSAGE_ENCAP,
            iv_half,
            nonce,
            controller_node_id,
            msg.target_node_id(),
            payload,
        )?;

        let bytes = sealed.to_command_bytes();
        let mut secure = Message::send_data(
            format!("SecurityCmd_MessageEncap ({})", msg.log_text()),
            msg.target_node_id(),
            bytes[0],
            &bytes[1..],
        );
        secure = match msg.expected_reply() {
            Some(Function::ApplicationCommandHandler) => {
                secure.expect_report(msg.expected_command_class_id())
            }
            Some(function) => secure.expect_reply(function),
            None => secure.without_reply(),
        };
        secure.set_max_send_attempts(msg.max_send_attempts());
        secure.set_send_attempts(msg.send_attempts());
        secure.set_secure(true);
        secure.finalize(ids)?;

        trace!(
            node_id = msg.target_node_id(),
            nonce_id = sealed.nonce_id(),
            "Encapsulated {}",
            msg.log_text()
        );

        Ok(secure)
    }

    /// Authenticate and decrypt an incoming `MESSAGE_ENCAP`
    ///
    /// `data` starts at the security command class id. The nonce is looked up
    /// in `nonces` by the nonce id carried in the frame and consumed. Returns
    /// the decrypted command class payload without the sequence byte.
    pub fn open(
        data: &[u8],
        keys: &SecurityKeys,
        sender: u8,
        receiver: u8,
        nonces: &mut NonceTable,
    ) -> Result<Vec<u8>> {
        if data.len() < ENCAP_OVERHEAD + 1 {
            return Err(Error::PayloadTooShort {
                function: "SecurityCmd_MessageEncap",
                expected: ENCAP_OVERHEAD + 1,
                actual: data.len(),
            });
        }

        let command = data[1];
        let mut iv_half = [0u8; NONCE_SIZE];
        iv_half.copy_from_slice(&data[2..2 + NONCE_SIZE]);

        let tag_start = data.len() - TAG_SIZE;
        let nonce_id = data[tag_start - 1];
        let ciphertext = &data[2 + NONCE_SIZE..tag_start - 1];
        let received_tag = &data[tag_start..];

        let nonce = nonces
            .take_issued(nonce_id)
            .ok_or(Error::NonceUnavailable { node_id: sender })?;
        let iv = build_iv(&iv_half, &nonce);

        let expected_tag = generate_authentication(
            keys.authentication_key(),
            &iv,
            command,
            sender,
            receiver,
            ciphertext,
        )?;
        if !tags_match(&expected_tag, received_tag) {
            warn!(node_id = sender, "Secure frame failed authentication");
            return Err(Error::AuthenticationFailed { node_id: sender });
        }

        let mut plaintext = ciphertext.to_vec();
        apply_ofb(keys.encryption_key(), &iv, &mut plaintext)?;

        let sequence = plaintext[0];
        if sequence & SEQUENCED != 0 {
            return Err(Error::CryptoFailed(format!(
                "sequenced secure frames are not supported (sequence 0x{:02X})",
                sequence
            )));
        }

        debug!(node_id = sender, len = plaintext.len() - 1, "Decrypted secure frame");
        plaintext.remove(0);
        Ok(plaintext)
    }
}

impl std::fmt::Debug for SecureFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureFrame")
            .field("command", &format!("0x{:02X}", self.command))
            .field("iv_half", &hex::encode(self.iv_half))
            .field("nonce_id", &format!("0x{:02X}", self.nonce_id()))
            .field("ciphertext", &hex::encode(&self.ciphertext))
            .field("tag", &hex::encode(self.tag))
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
struct StoredNonce {
    nonce: [u8; NONCE_SIZE],
    at: Instant,
}

/// Nonce bookkeeping for both directions
///
/// Nonces we issue are keyed by nonce id (their first byte). Nonces peers
/// send us are keyed by node id. Both expire after the timeout and are used
/// at most once.
#[derive(Debug)]
pub struct NonceTable {
    issued: HashMap<u8, StoredNonce>,
    received: HashMap<u8, StoredNonce>,
    timeout: Duration,
}

impl NonceTable {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(security::NONCE_TIMEOUT_SECS))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            issued: HashMap::new(),
            received: HashMap::new(),
            timeout,
        }
    }

    /// Generate a nonce for a peer to use when sending to us
    ///
    /// The nonce id is never 0 and never collides with a live nonce. When
    /// all 255 ids are live the oldest issued nonce is dropped.
    pub fn issue(&mut self, rng: &mut impl RngCore) -> [u8; NONCE_SIZE] {
        self.purge_expired();
        if self.issued.len() >= u8::MAX as usize {
            let oldest = self.issued.iter().min_by_key(|(_, s)| s.at).map(|(&id, _)| id);
            if let Some(id) = oldest {
                warn!(nonce_id = id, "Nonce table full, dropping oldest");
                self.issued.remove(&id);
            }
        }

        let mut nonce = [0u8; NONCE_SIZE];
        rng.fill_bytes(&mut nonce);
        // Next free id at or after the random one, skipping 0
        let free = (0..=u8::MAX)
            .map(|step| nonce[0].wrapping_add(step))
            .find(|id| *id != 0 && !self.issued.contains_key(id));
        if let Some(id) = free {
            nonce[0] = id;
        }
        self.issued.insert(
            nonce[0],
            StoredNonce {
                nonce,
                at: Instant::now(),
            },
        );
        nonce
    }

    /// Consume a nonce we issued
    pub fn take_issued(&mut self, nonce_id: u8) -> Option<[u8; NONCE_SIZE]> {
        let stored = self.issued.remove(&nonce_id)?;
        (stored.at.elapsed() <= self.timeout).then_some(stored.nonce)
    }

    /// Remember a nonce a peer sent in a `NONCE_REPORT`
    pub fn store_received(&mut self, node_id: u8, nonce: [u8; NONCE_SIZE]) {
        self.received.insert(
            node_id,
            StoredNonce {
                nonce,
                at: Instant::now(),
            },
        );
    }

    /// Consume the peer nonce for `node_id`
    pub fn take_received(&mut self, node_id: u8) -> Option<[u8; NONCE_SIZE]> {
        let stored = self.received.remove(&node_id)?;
        (stored.at.elapsed() <= self.timeout).then_some(stored.nonce)
    }

    /// Whether a live peer nonce is waiting for `node_id`
    pub fn has_received(&self, node_id: u8) -> bool {
        self.received
            .get(&node_id)
            .is_some_and(|s| s.at.elapsed() <= self.timeout)
    }

    /// Drop everything older than the timeout
    pub fn purge_expired(&mut self) {
        let timeout = self.timeout;
        self.issued.retain(|_, s| s.at.elapsed() <= timeout);
        self.received.retain(|_, s| s.at.elapsed() <= timeout);
    }
}

impl Default for NonceTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::command_class;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rand::rngs::mock::StepRng;

    const NETWORK_KEY: [u8; 16] = [
        0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F,
        0x10,
    ];

    fn keys() -> SecurityKeys {
        SecurityKeys::derive(&NETWORK_KEY).unwrap()
    }

    #[test]
    fn test_key_derivation_distinct() {
        let keys = keys();
        assert_ne!(keys.encryption_key(), keys.authentication_key());
        assert_ne!(keys.encryption_key(), &NETWORK_KEY);
        assert_eq!(keys, SecurityKeys::derive(&NETWORK_KEY).unwrap());
    }

    #[test]
    fn test_ofb_is_symmetric() {
        let keys = keys();
        let iv = [7u8; 16];
        let original = vec![0x00, 0x20, 0x01, 0xFF];
        let mut data = original.clone();

        apply_ofb(keys.encryption_key(), &iv, &mut data).unwrap();
        assert_ne!(data, original);
        apply_ofb(keys.encryption_key(), &iv, &mut data).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn test_authentication_depends_on_header() {
        let keys = keys();
        let iv = [3u8; 16];
        let ct = [1, 2, 3, 4, 5];

        let a = generate_authentication(keys.authentication_key(), &iv, 0x81, 1, 5, &ct).unwrap();
        let b = generate_authentication(keys.authentication_key(), &iv, 0x81, 1, 6, &ct).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_seal_and_open() {
        let keys = keys();
        let mut table = NonceTable::new();
        let mut rng = StepRng::new(0x0102_0304_0506_0708, 1);
        let nonce = table.issue(&mut rng);

        // Node 5 sends a Basic Report to controller 1
        let payload = [command_class::BASIC, 0x03, 0x63];
        let sealed = SecureFrame::seal(&keys, 0x81, [9u8; 8], nonce, 5, 1, &payload).unwrap();
        let bytes = sealed.to_command_bytes();
        assert_eq!(bytes.len(), payload.len() + 1 + ENCAP_OVERHEAD);

        let opened = SecureFrame::open(&bytes, &keys, 5, 1, &mut table).unwrap();
        assert_eq!(opened, payload.to_vec());
    }

    #[test]
    fn test_open_rejects_tampered_tag() {
        let keys = keys();
        let mut table = NonceTable::new();
        let mut rng = StepRng::new(42, 7);
        let nonce = table.issue(&mut rng);

        let sealed = SecureFrame::seal(&keys, 0x81, [1u8; 8], nonce, 5, 1, &[0x25, 0x03, 0x00]).unwrap();
        let mut bytes = sealed.to_command_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x80;

        assert!(matches!(
            SecureFrame::open(&bytes, &keys, 5, 1, &mut table),
            Err(Error::AuthenticationFailed { node_id: 5 })
        ));
    }

    #[test]
    fn test_open_without_nonce() {
        let keys = keys();
        let mut table = NonceTable::new();
        let sealed = SecureFrame::seal(&keys, 0x81, [1u8; 8], [0x33; 8], 5, 1, &[0x25, 0x03, 0x00]).unwrap();

        assert!(matches!(
            SecureFrame::open(&sealed.to_command_bytes(), &keys, 5, 1, &mut table),
            Err(Error::NonceUnavailable { node_id: 5 })
        ));
    }

    #[test]
    fn test_encapsulate_layout() {
        let keys = keys();
        let ids = CallbackIds::new();
        let mut rng = StepRng::new(1, 1);
        let mut msg = Message::send_data("SwitchBinaryCmd_Set", 9, 0x25, &[0x01, 0xFF])
            .without_reply();
        msg.finalize(&ids).unwrap();

        let secure = SecureFrame::encapsulate(&msg, &keys, 1, [0x44; 8], &mut rng, &ids).unwrap();
        let command = secure.command_payload().unwrap();

        // cc, cmd, iv(8), seq + 3 payload bytes, nonce id, tag(8)
        assert_eq!(command.len(), 2 + 8 + 4 + 1 + 8);
        assert_eq!(command[0], command_class::SECURITY);
        assert_eq!(command[1], security::MESSAGE_ENCAP);
        assert_eq!(command[2 + 8 + 4], 0x44);
        assert!(secure.is_secure());
        assert!(secure.is_finalized());
        assert_eq!(secure.expected_reply(), None);
        assert!(crate::checksum::verify_frame(secure.as_bytes()));
    }

    #[test]
    fn test_encapsulate_requires_finalized() {
        let ids = CallbackIds::new();
        let mut rng = StepRng::new(1, 1);
        let msg = Message::send_data("BasicCmd_Get", 9, 0x20, &[0x02]);

        assert!(matches!(
            SecureFrame::encapsulate(&msg, &keys(), 1, [0x44; 8], &mut rng, &ids),
            Err(Error::NotFinalized)
        ));
    }

    #[test]
    fn test_issued_nonce_used_once() {
        let mut table = NonceTable::new();
        let mut rng = StepRng::new(0xAB, 0x0101);
        let nonce = table.issue(&mut rng);

        assert_ne!(nonce[0], 0);
        assert_eq!(table.take_issued(nonce[0]), Some(nonce));
        assert_eq!(table.take_issued(nonce[0]), None);
    }

    #[test]
    fn test_issue_never_stalls_when_ids_exhausted() {
        let mut table = NonceTable::new();
        // Constant output: every draw collides after the first
        let mut rng = StepRng::new(0, 0);
        let mut ids = std::collections::HashSet::new();

        for _ in 0..255 {
            let nonce = table.issue(&mut rng);
            assert_ne!(nonce[0], 0);
            assert!(ids.insert(nonce[0]));
        }
        assert_eq!(ids.len(), 255);

        // Table full: the oldest id is recycled
        let first = table.issued.iter().min_by_key(|(_, s)| s.at).map(|(&id, _)| id).unwrap();
        let nonce = table.issue(&mut rng);
        assert_eq!(nonce[0], first);
        assert_eq!(table.issued.len(), 255);
        assert_eq!(table.take_issued(nonce[0]), Some(nonce));
    }

    #[test]
    fn test_received_nonce_expires() {
        let mut table = NonceTable::with_timeout(Duration::ZERO);
        table.store_received(4, [1; 8]);
        std::thread::sleep(Duration::from_millis(2));

        assert!(!table.has_received(4));
        assert_eq!(table.take_received(4), None);
    }

    proptest! {
        #[test]
        fn prop_authentication_is_deterministic(
            key in any::<[u8; 16]>(),
            iv in any::<[u8; 16]>(),
            sender in any::<u8>(),
            receiver in any::<u8>(),
            ct in proptest::collection::vec(any::<u8>(), 1..64),
        ) {
            let a = generate_authentication(&key, &iv, 0x81, sender, receiver, &ct).unwrap();
            let b = generate_authentication(&key, &iv, 0x81, sender, receiver, &ct).unwrap();
            prop_assert_eq!(a, b);
        }
    }
}
