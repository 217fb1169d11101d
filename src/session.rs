//! Established secure sessions.
//!
//! A [SessionKey] is created by a finished CASE exchange and lives in the
//! [SessionKeyStore] until it is removed, idles out or gets evicted to make
//! room for a newer one. The store seals and opens message payloads with the
//! session keys and tracks the message counters of both directions.

use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use byteorder::{LittleEndian, WriteBytesExt};

use crate::config::{ReplacementPolicy, SessionConfig};
use crate::error::ErrorCode;
use crate::fabric::FabricIndex;
use crate::util::cryptoutil;

/// Source of the current time, as duration since an arbitrary fixed point.
pub type Epoch = fn() -> Duration;

pub fn sys_epoch() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

pub const SESSION_KEY_LEN: usize = cryptoutil::AES128_KEY_LEN;
pub const ATTESTATION_CHALLENGE_LEN: usize = 16;
/// i2r key, r2i key and attestation challenge, as derived by CASE.
pub const SESSION_SECRETS_LEN: usize = 2 * SESSION_KEY_LEN + ATTESTATION_CHALLENGE_LEN;

/// Number of counters behind the highest one that are still accepted once.
const RX_WINDOW: u32 = 32;
/// Initial send counters are random in 1..=2^28.
const SEND_COUNTER_MASK: u32 = 0x0FFF_FFFF;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SessionFlags: u8 {
        const LOCALLY_INITIATED = 0x01;
        const SHARED = 0x02;
        const SUSPENDED = 0x04;
        const RECENTLY_ACTIVE = 0x08;
    }
}

/// Where messages of a session go. Transport plumbing itself lives elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerTransport {
    Udp(SocketAddr),
    Tcp(SocketAddr),
    #[default]
    None,
}

/// Key material produced by session establishment.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionSecrets {
    pub i2r: [u8; SESSION_KEY_LEN],
    pub r2i: [u8; SESSION_KEY_LEN],
    pub attestation_challenge: [u8; ATTESTATION_CHALLENGE_LEN],
}

impl SessionSecrets {
    /// Split HKDF output into i2r, r2i and attestation challenge.
    pub fn from_okm(okm: &[u8]) -> Result<Self> {
        if okm.len() != SESSION_SECRETS_LEN {
            return Err(ErrorCode::InvalidArgument).context(format!("session key material of {} bytes", okm.len()));
        }
        let mut s = Self {
            i2r: [0; SESSION_KEY_LEN],
            r2i: [0; SESSION_KEY_LEN],
            attestation_challenge: [0; ATTESTATION_CHALLENGE_LEN],
        };
        s.i2r.copy_from_slice(&okm[..SESSION_KEY_LEN]);
        s.r2i.copy_from_slice(&okm[SESSION_KEY_LEN..2 * SESSION_KEY_LEN]);
        s.attestation_challenge.copy_from_slice(&okm[2 * SESSION_KEY_LEN..]);
        Ok(s)
    }
}

impl std::fmt::Debug for SessionSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSecrets").finish_non_exhaustive()
    }
}

/// Sliding window over received message counters.
#[derive(Debug, Clone, Default)]
struct RxCounter {
    initialized: bool,
    max: u32,
    bitmap: u32,
}

impl RxCounter {
    fn is_duplicate(&self, counter: u32) -> bool {
        if !self.initialized {
            return false;
        }
        let diff = counter.wrapping_sub(self.max) as i32;
        if diff == 0 {
            true
        } else if diff < 0 {
            let back = diff.unsigned_abs();
            back > RX_WINDOW || self.bitmap & (1 << (back - 1)) != 0
        } else {
            false
        }
    }

    fn commit(&mut self, counter: u32) {
        if !self.initialized {
            self.initialized = true;
            self.max = counter;
            self.bitmap = 0;
            return;
        }
        let diff = counter.wrapping_sub(self.max) as i32;
        if diff > 0 {
            let ahead = diff as u32;
            self.bitmap = if ahead < RX_WINDOW {
                (self.bitmap << ahead) | (1 << (ahead - 1))
            } else if ahead == RX_WINDOW {
                1 << (RX_WINDOW - 1)
            } else {
                0
            };
            self.max = counter;
        } else if diff < 0 {
            self.bitmap |= 1 << (diff.unsigned_abs() - 1);
        }
    }
}

/// One established session with a peer node on one fabric.
#[derive(Debug, Clone)]
pub struct SessionKey {
    pub fabric_index: FabricIndex,
    pub local_key_id: u16,
    pub peer_key_id: u16,
    pub local_node_id: u64,
    pub peer_node_id: u64,
    pub flags: SessionFlags,
    pub transport: PeerTransport,
    encrypt_key: [u8; SESSION_KEY_LEN],
    decrypt_key: [u8; SESSION_KEY_LEN],
    attestation_challenge: [u8; ATTESTATION_CHALLENGE_LEN],
    send_counter: u32,
    rx: RxCounter,
    last_used: Duration,
}

impl SessionKey {
    /// The initiator encrypts with the i2r key, the responder with r2i.
    pub fn new(
        fabric_index: FabricIndex,
        local_key_id: u16,
        peer_key_id: u16,
        local_node_id: u64,
        peer_node_id: u64,
        secrets: &SessionSecrets,
        locally_initiated: bool,
    ) -> Self {
        let (encrypt_key, decrypt_key) = if locally_initiated {
            (secrets.i2r, secrets.r2i)
        } else {
            (secrets.r2i, secrets.i2r)
        };
        let mut flags = SessionFlags::empty();
        flags.set(SessionFlags::LOCALLY_INITIATED, locally_initiated);
        Self {
            fabric_index,
            local_key_id,
            peer_key_id,
            local_node_id,
            peer_node_id,
            flags,
            transport: PeerTransport::None,
            encrypt_key,
            decrypt_key,
            attestation_challenge: secrets.attestation_challenge,
            send_counter: (rand::random::<u32>() & SEND_COUNTER_MASK) + 1,
            rx: RxCounter::default(),
            last_used: Duration::ZERO,
        }
    }

    pub fn attestation_challenge(&self) -> &[u8] {
        &self.attestation_challenge
    }

    pub fn is_suspended(&self) -> bool {
        self.flags.contains(SessionFlags::SUSPENDED)
    }

    pub fn last_used(&self) -> Duration {
        self.last_used
    }

    fn make_nonce(counter: u32, node_id: u64) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(cryptoutil::CCM_NONCE_LEN);
        out.write_u8(0)?;
        out.write_u32::<LittleEndian>(counter)?;
        out.write_u64::<LittleEndian>(node_id)?;
        Ok(out)
    }

    fn touch(&mut self, now: Duration) {
        self.last_used = now;
        self.flags.insert(SessionFlags::RECENTLY_ACTIVE);
    }

    fn check_usable(&self) -> Result<()> {
        if self.is_suspended() {
            return Err(ErrorCode::IncorrectState).context(format!("session {} is suspended", self.local_key_id));
        }
        Ok(())
    }

    fn seal(&mut self, aad: &[u8], plaintext: &[u8]) -> Result<(u32, Vec<u8>)> {
        self.check_usable()?;
        let counter = self.send_counter;
        let nonce = Self::make_nonce(counter, self.local_node_id)?;
        let out = cryptoutil::aes128_ccm_encrypt(&self.encrypt_key, &nonce, aad, plaintext)?;
        self.send_counter = self.send_counter.wrapping_add(1);
        Ok((counter, out))
    }

    fn open(&mut self, counter: u32, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.check_usable()?;
        if self.rx.is_duplicate(counter) {
            return Err(ErrorCode::DuplicateMessage)
                .context(format!("counter {} on session {}", counter, self.local_key_id));
        }
        let nonce = Self::make_nonce(counter, self.peer_node_id)?;
        let out = cryptoutil::aes128_ccm_decrypt(&self.decrypt_key, &nonce, aad, ciphertext)?;
        self.rx.commit(counter);
        Ok(out)
    }
}

/// Cache of established sessions.
pub struct SessionKeyStore {
    sessions: Vec<SessionKey>,
    config: SessionConfig,
    epoch: Epoch,
    next_key_id: u16,
}

impl SessionKeyStore {
    pub fn new(config: &SessionConfig, epoch: Epoch) -> Self {
        Self {
            sessions: Vec::with_capacity(config.max_sessions),
            config: config.clone(),
            epoch,
            next_key_id: rand::random::<u16>().max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SessionKey> {
        self.sessions.iter()
    }

    /// Free local key id. 0 is reserved for unsecured sessions.
    pub fn allocate_key_id(&mut self) -> Result<u16> {
        for _ in 0..u16::MAX {
            let id = self.next_key_id;
            self.next_key_id = self.next_key_id.wrapping_add(1).max(1);
            if self.get(id).is_none() {
                return Ok(id);
            }
        }
        Err(ErrorCode::NoMemory).context("no free session id")
    }

    fn evict_one(&mut self) -> Result<()> {
        let victim = self
            .sessions
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.flags.contains(SessionFlags::SHARED))
            .min_by_key(|(_, s)| (s.flags.contains(SessionFlags::RECENTLY_ACTIVE), s.last_used))
            .map(|(i, _)| i)
            .ok_or(ErrorCode::NoMemory)
            .context("session cache full and every session is shared")?;
        let s = self.sessions.remove(victim);
        log::debug!(
            "evicted session {} with node {:x} on fabric {}",
            s.local_key_id,
            s.peer_node_id,
            s.fabric_index
        );
        Ok(())
    }

    /// Add a freshly established session, applying the replacement policy and
    /// making room if the cache is full.
    pub fn install(&mut self, mut key: SessionKey) -> Result<()> {
        if key.local_key_id == 0 || self.get(key.local_key_id).is_some() {
            return Err(ErrorCode::InvalidArgument).context(format!("session id {} not available", key.local_key_id));
        }
        if self.config.replacement == ReplacementPolicy::ReplaceSamePeer {
            let before = self.sessions.len();
            self.sessions.retain(|s| {
                s.flags.contains(SessionFlags::SHARED)
                    || s.fabric_index != key.fabric_index
                    || s.peer_node_id != key.peer_node_id
            });
            if before != self.sessions.len() {
                log::debug!(
                    "replaced {} session(s) with node {:x}",
                    before - self.sessions.len(),
                    key.peer_node_id
                );
            }
        }
        if self.sessions.len() >= self.config.max_sessions {
            self.evict_one()?;
        }
        key.touch((self.epoch)());
        log::info!(
            "session {} -> {} with node {:x} on fabric {} installed",
            key.local_key_id,
            key.peer_key_id,
            key.peer_node_id,
            key.fabric_index
        );
        self.sessions.push(key);
        Ok(())
    }

    pub fn get(&self, local_key_id: u16) -> Option<&SessionKey> {
        self.sessions.iter().find(|s| s.local_key_id == local_key_id)
    }

    pub fn get_mut(&mut self, local_key_id: u16) -> Option<&mut SessionKey> {
        self.sessions.iter_mut().find(|s| s.local_key_id == local_key_id)
    }

    fn get_or_err(&mut self, local_key_id: u16) -> Result<&mut SessionKey> {
        self.get_mut(local_key_id)
            .ok_or(ErrorCode::InvalidArgument)
            .with_context(|| format!("no session {}", local_key_id))
    }

    /// Session with `peer_node_id` under local key id `key_id`.
    pub fn find(&self, peer_node_id: u64, key_id: u16) -> Option<&SessionKey> {
        self.sessions
            .iter()
            .find(|s| s.peer_node_id == peer_node_id && s.local_key_id == key_id)
    }

    /// Most recently used, not suspended session with a peer.
    pub fn find_for_peer(&self, fabric_index: FabricIndex, peer_node_id: u64) -> Option<&SessionKey> {
        self.sessions
            .iter()
            .filter(|s| s.fabric_index == fabric_index && s.peer_node_id == peer_node_id && !s.is_suspended())
            .max_by_key(|s| s.last_used)
    }

    pub fn remove(&mut self, local_key_id: u16) -> Option<SessionKey> {
        let pos = self.sessions.iter().position(|s| s.local_key_id == local_key_id)?;
        Some(self.sessions.remove(pos))
    }

    fn remove_where(&mut self, f: impl Fn(&SessionKey) -> bool) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|s| !f(s));
        before - self.sessions.len()
    }

    pub fn remove_for_fabric(&mut self, fabric_index: FabricIndex) -> usize {
        let n = self.remove_where(|s| s.fabric_index == fabric_index);
        if n > 0 {
            log::debug!("removed {} session(s) of fabric {}", n, fabric_index);
        }
        n
    }

    pub fn remove_for_peer(&mut self, fabric_index: FabricIndex, peer_node_id: u64) -> usize {
        self.remove_where(|s| s.fabric_index == fabric_index && s.peer_node_id == peer_node_id)
    }

    /// Drop sessions idle for longer than the configured timeout.
    ///
    /// A session used since the previous sweep only loses its recently-active
    /// mark, so it takes two sweeps without traffic to remove it.
    pub fn expire_idle(&mut self) -> usize {
        let now = (self.epoch)();
        let timeout = Duration::from_secs(self.config.idle_timeout_secs);
        let before = self.sessions.len();
        self.sessions.retain_mut(|s| {
            if s.flags.contains(SessionFlags::RECENTLY_ACTIVE) {
                s.flags.remove(SessionFlags::RECENTLY_ACTIVE);
                return true;
            }
            let keep = s.flags.contains(SessionFlags::SHARED) || now.saturating_sub(s.last_used) < timeout;
            if !keep {
                log::debug!("session {} with node {:x} idled out", s.local_key_id, s.peer_node_id);
            }
            keep
        });
        before - self.sessions.len()
    }

    pub fn suspend(&mut self, local_key_id: u16) -> Result<()> {
        self.get_or_err(local_key_id)?.flags.insert(SessionFlags::SUSPENDED);
        Ok(())
    }

    pub fn resume(&mut self, local_key_id: u16) -> Result<()> {
        let now = (self.epoch)();
        let s = self.get_or_err(local_key_id)?;
        s.flags.remove(SessionFlags::SUSPENDED);
        s.touch(now);
        Ok(())
    }

    /// Encrypt `plaintext` for the peer; returns the message counter used.
    pub fn seal(&mut self, local_key_id: u16, aad: &[u8], plaintext: &[u8]) -> Result<(u32, Vec<u8>)> {
        let now = (self.epoch)();
        let s = self.get_or_err(local_key_id)?;
        let out = s.seal(aad, plaintext)?;
        s.touch(now);
        Ok(out)
    }

    /// Decrypt a message from the peer, rejecting replayed counters.
    pub fn open(&mut self, local_key_id: u16, counter: u32, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let now = (self.epoch)();
        let s = self.get_or_err(local_key_id)?;
        let out = s.open(counter, aad, ciphertext)?;
        s.touch(now);
        Ok(out)
    }
}
