//! Secure channel: authenticated key exchange and encrypted framing.
//!
//! # Handshake
//!
//! ```text
//! initiator -> responder   Hello  { version, ephemeral_pub, identity_pub }
//! responder -> initiator   Reply  { version, ephemeral_pub, identity_pub, sig_R(T) }
//! initiator -> responder   Finish { sig_I(T || "initiator") }
//! ```
//!
//! `T` is the SHA-256 transcript of both ephemeral and identity keys. Both
//! long-term Ed25519 keys sign it, binding them to the X25519 exchange.
//! Session keys come from HKDF-SHA256 over the shared secret, salted with
//! `T`, one key per direction. After the handshake every frame is sealed with
//! AES-256-GCM under a per-direction counter nonce.

use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use tracing::debug;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{HandshakeError, NetworkError};
use crate::identity::{NodeIdentity, PeerId, verify_signature};
use crate::link::{LinkReader, LinkWriter, RawLink};

/// Handshake wire version.
pub const HANDSHAKE_VERSION: u8 = 1;

/// Default time allowed for a full handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

const TRANSCRIPT_DOMAIN: &[u8] = b"disasternet/handshake/1";
const INITIATOR_TAG: &[u8] = b"initiator";
const KEY_INFO_I2R: &[u8] = b"disasternet/key/initiator->responder";
const KEY_INFO_R2I: &[u8] = b"disasternet/key/responder->initiator";

const HELLO_LEN: usize = 1 + 32 + 32;
const REPLY_LEN: usize = HELLO_LEN + 64;
const FINISH_LEN: usize = 64;
const NONCE_LEN: usize = 12;

/// Which side of the handshake we play.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The dialing side.
    Initiator,
    /// The accepting side.
    Responder,
}

/// Handshake parameters. Build with [`Handshake::new`] and run with
/// [`Handshake::run`].
pub struct Handshake<'a> {
    identity: &'a NodeIdentity,
    role: Role,
    expected_peer: Option<PeerId>,
    timeout: Duration,
}

impl<'a> Handshake<'a> {
    pub fn new(identity: &'a NodeIdentity, role: Role) -> Self {
        Self {
            identity,
            role,
            expected_peer: None,
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Fail unless the remote authenticates as `peer`.
    pub fn expect_peer(mut self, peer: PeerId) -> Self {
        self.expected_peer = Some(peer);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run the handshake over `link`.
    ///
    /// The link is consumed: on failure it is dropped, which closes it. No
    /// retry happens here.
    pub async fn run(self, mut link: RawLink) -> Result<SecureChannel, HandshakeError> {
        let timeout = self.timeout;
        let keys = match tokio::time::timeout(timeout, self.exchange(&mut link)).await {
            Ok(result) => result?,
            Err(_) => return Err(HandshakeError::Timeout(timeout)),
        };
        debug!("Secure channel established with {:?}", keys.remote);
        Ok(SecureChannel {
            link,
            remote_peer: keys.remote,
            remote_public_key: keys.remote_public,
            session_id: keys.session_id,
            sealer: Sealer::new(&keys.send_key),
            opener: Opener::new(&keys.recv_key),
        })
    }

    async fn exchange(&self, link: &mut RawLink) -> Result<SessionKeys, HandshakeError> {
        let ephemeral = StaticSecret::from(rand::random::<[u8; 32]>());
        let ephemeral_pub = PublicKey::from(&ephemeral).to_bytes();
        let identity_pub = self.identity.public_key();

        match self.role {
            Role::Initiator => {
                let hello = encode_hello(&ephemeral_pub, &identity_pub);
                send(link, &hello).await?;

                let reply = recv(link).await?;
                let (remote_eph, remote_id, sig) = decode_reply(&reply)?;
                let transcript = transcript(&hello, &remote_eph, &remote_id);
                if !verify_signature(&remote_id, &transcript, &sig) {
                    return Err(HandshakeError::Authentication(
                        "responder signature invalid".into(),
                    ));
                }
                let remote = PeerId::from_public_key(&remote_id);
                if let Some(expected) = self.expected_peer {
                    if expected != remote {
                        return Err(HandshakeError::PeerMismatch {
                            expected,
                            actual: remote,
                        });
                    }
                }

                let finish = self.identity.sign(&finish_message(&transcript));
                send(link, &finish).await?;

                let (i2r, r2i) = derive_keys(&ephemeral, &remote_eph, &transcript)?;
                Ok(SessionKeys {
                    remote,
                    remote_public: remote_id,
                    session_id: transcript,
                    send_key: i2r,
                    recv_key: r2i,
                })
            }
            Role::Responder => {
                let hello = recv(link).await?;
                let (remote_eph, remote_id) = decode_hello(&hello)?;
                let transcript = transcript(&hello, &ephemeral_pub, &identity_pub);

                let mut reply = encode_hello(&ephemeral_pub, &identity_pub);
                reply.extend_from_slice(&self.identity.sign(&transcript));
                send(link, &reply).await?;

                let finish = recv(link).await?;
                let sig: [u8; 64] = finish.as_slice().try_into().map_err(|_| {
                    HandshakeError::Malformed(format!(
                        "finish is {} bytes, expected {FINISH_LEN}",
                        finish.len()
                    ))
                })?;
                if !verify_signature(&remote_id, &finish_message(&transcript), &sig) {
                    return Err(HandshakeError::Authentication(
                        "initiator signature invalid".into(),
                    ));
                }
                let remote = PeerId::from_public_key(&remote_id);
                if let Some(expected) = self.expected_peer {
                    if expected != remote {
                        return Err(HandshakeError::PeerMismatch {
                            expected,
                            actual: remote,
                        });
                    }
                }

                let (i2r, r2i) = derive_keys(&ephemeral, &remote_eph, &transcript)?;
                Ok(SessionKeys {
                    remote,
                    remote_public: remote_id,
                    session_id: transcript,
                    send_key: r2i,
                    recv_key: i2r,
                })
            }
        }
    }
}

struct SessionKeys {
    remote: PeerId,
    remote_public: [u8; 32],
    session_id: [u8; 32],
    send_key: [u8; 32],
    recv_key: [u8; 32],
}

async fn send(link: &mut RawLink, frame: &[u8]) -> Result<(), HandshakeError> {
    link.send_frame(frame)
        .await
        .map_err(|e| HandshakeError::Link(e.to_string()))
}

async fn recv(link: &mut RawLink) -> Result<Vec<u8>, HandshakeError> {
    match link.recv_frame().await {
        Ok(Some(frame)) => Ok(frame),
        Ok(None) => Err(HandshakeError::Link("link closed".into())),
        Err(e) => Err(HandshakeError::Link(e.to_string())),
    }
}

fn encode_hello(ephemeral_pub: &[u8; 32], identity_pub: &[u8; 32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(REPLY_LEN);
    out.push(HANDSHAKE_VERSION);
    out.extend_from_slice(ephemeral_pub);
    out.extend_from_slice(identity_pub);
    out
}

fn check_version(frame: &[u8]) -> Result<(), HandshakeError> {
    match frame.first() {
        Some(&HANDSHAKE_VERSION) => Ok(()),
        Some(&theirs) => Err(HandshakeError::VersionMismatch {
            ours: HANDSHAKE_VERSION,
            theirs,
        }),
        None => Err(HandshakeError::Malformed("empty handshake frame".into())),
    }
}

fn decode_hello(frame: &[u8]) -> Result<([u8; 32], [u8; 32]), HandshakeError> {
    check_version(frame)?;
    if frame.len() != HELLO_LEN {
        return Err(HandshakeError::Malformed(format!(
            "hello is {} bytes, expected {HELLO_LEN}",
            frame.len()
        )));
    }
    Ok(split_keys(&frame[1..HELLO_LEN]))
}

fn decode_reply(frame: &[u8]) -> Result<([u8; 32], [u8; 32], [u8; 64]), HandshakeError> {
    check_version(frame)?;
    if frame.len() != REPLY_LEN {
        return Err(HandshakeError::Malformed(format!(
            "reply is {} bytes, expected {REPLY_LEN}",
            frame.len()
        )));
    }
    let (eph, id) = split_keys(&frame[1..HELLO_LEN]);
    let mut sig = [0u8; 64];
    sig.copy_from_slice(&frame[HELLO_LEN..]);
    Ok((eph, id, sig))
}

fn split_keys(bytes: &[u8]) -> ([u8; 32], [u8; 32]) {
    let mut eph = [0u8; 32];
    let mut id = [0u8; 32];
    eph.copy_from_slice(&bytes[..32]);
    id.copy_from_slice(&bytes[32..64]);
    (eph, id)
}

fn transcript(hello: &[u8], responder_eph: &[u8; 32], responder_id: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(TRANSCRIPT_DOMAIN);
    hasher.update(hello);
    hasher.update(responder_eph);
    hasher.update(responder_id);
    hasher.finalize().into()
}

fn finish_message(transcript: &[u8; 32]) -> Vec<u8> {
    let mut msg = transcript.to_vec();
    msg.extend_from_slice(INITIATOR_TAG);
    msg
}

/// Returns `(initiator->responder, responder->initiator)` keys.
fn derive_keys(
    ephemeral: &StaticSecret,
    remote_eph: &[u8; 32],
    transcript: &[u8; 32],
) -> Result<([u8; 32], [u8; 32]), HandshakeError> {
    let shared = ephemeral.diffie_hellman(&PublicKey::from(*remote_eph));
    if !shared.was_contributory() {
        return Err(HandshakeError::Authentication(
            "non-contributory key exchange".into(),
        ));
    }
    let hk = Hkdf::<Sha256>::new(Some(&transcript[..]), shared.as_bytes());
    let mut i2r = [0u8; 32];
    let mut r2i = [0u8; 32];
    hk.expand(KEY_INFO_I2R, &mut i2r)
        .and_then(|_| hk.expand(KEY_INFO_R2I, &mut r2i))
        .map_err(|e| HandshakeError::Authentication(format!("key derivation failed: {e}")))?;
    Ok((i2r, r2i))
}

// ---------------------------------------------------------------------------
// Frame sealing
// ---------------------------------------------------------------------------

fn counter_nonce(counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// Encrypting half of the session state.
struct Sealer {
    cipher: Aes256Gcm,
    counter: u64,
}

impl Sealer {
    fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            counter: 0,
        }
    }

    fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NetworkError> {
        let nonce_bytes = counter_nonce(self.counter);
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| NetworkError::Crypto("send nonce space exhausted".into()))?;
        self.cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: TRANSCRIPT_DOMAIN,
                },
            )
            .map_err(|e| NetworkError::Crypto(format!("Encryption failed: {e}")))
    }
}

/// Decrypting half of the session state.
struct Opener {
    cipher: Aes256Gcm,
    counter: u64,
}

impl Opener {
    fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            counter: 0,
        }
    }

    fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, NetworkError> {
        let nonce_bytes = counter_nonce(self.counter);
        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: TRANSCRIPT_DOMAIN,
                },
            )
            .map_err(|e| NetworkError::Crypto(format!("Decryption failed: {e}")))?;
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| NetworkError::Crypto("receive nonce space exhausted".into()))?;
        Ok(plaintext)
    }
}

// ---------------------------------------------------------------------------
// SecureChannel
// ---------------------------------------------------------------------------

/// An encrypted, ordered, reliable duplex channel with an authenticated peer.
pub struct SecureChannel {
    link: RawLink,
    remote_peer: PeerId,
    remote_public_key: [u8; 32],
    session_id: [u8; 32],
    sealer: Sealer,
    opener: Opener,
}

impl SecureChannel {
    /// The authenticated remote peer.
    pub fn remote_peer(&self) -> &PeerId {
        &self.remote_peer
    }

    pub fn remote_public_key(&self) -> &[u8; 32] {
        &self.remote_public_key
    }

    /// Handshake transcript hash, identical on both ends of this channel.
    pub fn session_id(&self) -> &[u8; 32] {
        &self.session_id
    }

    /// Encrypt and send one frame.
    pub async fn send(&mut self, plaintext: &[u8]) -> Result<(), NetworkError> {
        let sealed = self.sealer.seal(plaintext)?;
        self.link.send_frame(&sealed).await
    }

    /// Receive and decrypt one frame. `Ok(None)` on orderly close.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>, NetworkError> {
        match self.link.recv_frame().await? {
            Some(frame) => self.opener.open(&frame).map(Some),
            None => Ok(None),
        }
    }

    /// Split into halves that can be driven from different tasks.
    pub fn split(self) -> (SecureReceiver, SecureSender) {
        let (reader, writer) = self.link.split();
        (
            SecureReceiver {
                reader,
                opener: self.opener,
            },
            SecureSender {
                writer,
                sealer: self.sealer,
            },
        )
    }
}

/// Sending half of a [`SecureChannel`].
pub struct SecureSender {
    writer: LinkWriter,
    sealer: Sealer,
}

impl SecureSender {
    pub async fn send(&mut self, plaintext: &[u8]) -> Result<(), NetworkError> {
        let sealed = self.sealer.seal(plaintext)?;
        self.writer.send_frame(&sealed).await
    }

    pub async fn close(&mut self) {
        self.writer.close().await;
    }
}

/// Receiving half of a [`SecureChannel`].
pub struct SecureReceiver {
    reader: LinkReader,
    opener: Opener,
}

impl SecureReceiver {
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>, NetworkError> {
        match self.reader.recv_frame().await? {
            Some(frame) => self.opener.open(&frame).map(Some),
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::tcp_pair;

    async fn connect(
        a: &NodeIdentity,
        b: &NodeIdentity,
    ) -> (
        Result<SecureChannel, HandshakeError>,
        Result<SecureChannel, HandshakeError>,
    ) {
        let (la, lb) = tcp_pair().await;
        tokio::join!(
            Handshake::new(a, Role::Initiator).run(la),
            Handshake::new(b, Role::Responder).run(lb)
        )
    }

    #[tokio::test]
    async fn test_handshake_authenticates_both_sides() {
        let a = NodeIdentity::generate();
        let b = NodeIdentity::generate();
        let (ca, cb) = connect(&a, &b).await;
        let (mut ca, mut cb) = (ca.unwrap(), cb.unwrap());

        assert_eq!(ca.remote_peer(), b.peer_id());
        assert_eq!(cb.remote_peer(), a.peer_id());
        assert_eq!(ca.remote_public_key(), &b.public_key());
        assert_eq!(ca.session_id(), cb.session_id());

        ca.send(b"ping").await.unwrap();
        assert_eq!(cb.recv().await.unwrap().unwrap(), b"ping");
        cb.send(b"pong").await.unwrap();
        assert_eq!(ca.recv().await.unwrap().unwrap(), b"pong");
    }

    #[tokio::test]
    async fn test_expected_peer_mismatch_fails() {
        let a = NodeIdentity::generate();
        let b = NodeIdentity::generate();
        let stranger = NodeIdentity::generate();
        let (la, lb) = tcp_pair().await;

        let (ra, _rb) = tokio::join!(
            Handshake::new(&a, Role::Initiator)
                .expect_peer(*stranger.peer_id())
                .run(la),
            Handshake::new(&b, Role::Responder)
                .timeout(Duration::from_millis(500))
                .run(lb)
        );
        match ra {
            Err(HandshakeError::PeerMismatch { expected, actual }) => {
                assert_eq!(&expected, stranger.peer_id());
                assert_eq!(&actual, b.peer_id());
            }
            other => panic!("Expected PeerMismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_handshake_times_out_on_silent_peer() {
        let a = NodeIdentity::generate();
        let (_silent, lb) = tcp_pair().await;
        let result = Handshake::new(&a, Role::Responder)
            .timeout(Duration::from_millis(100))
            .run(lb)
            .await;
        assert!(matches!(result, Err(HandshakeError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_version_mismatch_rejected() {
        let b = NodeIdentity::generate();
        let (mut la, lb) = tcp_pair().await;
        let mut bogus = vec![HANDSHAKE_VERSION + 1];
        bogus.extend_from_slice(&[0u8; 64]);
        la.send_frame(&bogus).await.unwrap();

        let result = Handshake::new(&b, Role::Responder).run(lb).await;
        assert!(matches!(
            result,
            Err(HandshakeError::VersionMismatch { theirs, .. }) if theirs == HANDSHAKE_VERSION + 1
        ));
    }

    #[tokio::test]
    async fn test_truncated_hello_rejected() {
        let b = NodeIdentity::generate();
        let (mut la, lb) = tcp_pair().await;
        la.send_frame(&[HANDSHAKE_VERSION, 1, 2, 3]).await.unwrap();

        let result = Handshake::new(&b, Role::Responder).run(lb).await;
        assert!(matches!(result, Err(HandshakeError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_split_channel_halves() {
        let a = NodeIdentity::generate();
        let b = NodeIdentity::generate();
        let (ca, cb) = connect(&a, &b).await;
        let (_ra, mut sa) = ca.unwrap().split();
        let (mut rb, _sb) = cb.unwrap().split();

        for i in 0..10u8 {
            sa.send(&[i]).await.unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(rb.recv().await.unwrap().unwrap(), vec![i]);
        }
        sa.close().await;
        assert!(rb.recv().await.unwrap().is_none());
    }

    #[test]
    fn test_tampered_frame_rejected() {
        let key = [3u8; 32];
        let mut sealer = Sealer::new(&key);
        let mut opener = Opener::new(&key);

        let mut sealed = sealer.seal(b"integrity").unwrap();
        sealed[0] ^= 0x01;
        assert!(opener.open(&sealed).is_err());
    }

    #[test]
    fn test_replayed_frame_rejected() {
        let key = [4u8; 32];
        let mut sealer = Sealer::new(&key);
        let mut opener = Opener::new(&key);

        let first = sealer.seal(b"first").unwrap();
        assert_eq!(opener.open(&first).unwrap(), b"first");
        // Counter has advanced, so the same ciphertext no longer opens.
        assert!(opener.open(&first).is_err());
    }
}
