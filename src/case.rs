//! Certificate authenticated session establishment.
//!
//! [CaseEngine] runs one exchange, either as initiator or as responder:
//!
//! ```text
//! initiator                                responder
//! begin_request()        --request-->      process_begin_request()
//!                        <--reconfigure--  (unsupported config or curve)
//! process_begin_response() <--response--   begin_response()
//! key_confirm()          --confirm-->      process_key_confirm()   (optional)
//! ```
//!
//! Each request and response body is signed with the sender's operational
//! key; the receiver verifies the sender's NOC chain against its own copy of
//! the fabric root. Keys derived from the ephemeral ECDH secret are held in
//! the engine until [CaseEngine::commit] installs them into the session store.

use anyhow::{Context, Result};

use crate::config::{CaseConfig, KeyConfirmMode};
use crate::credentials::{self, ValidationContext};
use crate::error::ErrorCode;
use crate::fabric::{FabricIndex, FabricInfo, UNDEFINED_FABRIC_INDEX};
use crate::fabric_table::FabricTable;
use crate::keypair;
use crate::session::{SessionKey, SessionKeyStore, SessionSecrets, SESSION_SECRETS_LEN};
use crate::tlv::{self, TlvItem};
use crate::util::cryptoutil;

/// SHA-1 based hash suite, kept for older peers.
pub const CONFIG_1: u16 = 1;
/// SHA-256 based hash suite.
pub const CONFIG_2: u16 = 2;
pub const CURVE_P256: u32 = 0x001B;

const RANDOM_LEN: usize = 32;
const SESSION_KEYS_INFO: &[u8] = b"SessionKeys";
const KEY_CONFIRM_INFO: &[u8] = b"KeyConfirm";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseState {
    Idle,
    BeginRequestGenerated,
    BeginRequestProcessed,
    BeginResponseGenerated,
    BeginResponseProcessed,
    Complete,
    Failed,
    Reconfigure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// What the responder should send back after a begin request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Request verified; continue with [CaseEngine::begin_response].
    Accepted,
    /// Parameters not supported; send this reconfigure message.
    Reconfigure(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HashSuite {
    Sha1,
    Sha256,
}

impl HashSuite {
    fn for_config(config: u16) -> Result<Self> {
        match config {
            CONFIG_1 => Ok(HashSuite::Sha1),
            CONFIG_2 => Ok(HashSuite::Sha256),
            c => Err(ErrorCode::UnsupportedParameters).context(format!("protocol config {}", c)),
        }
    }

    fn hash(&self, data: &[u8]) -> Vec<u8> {
        match self {
            HashSuite::Sha1 => cryptoutil::sha1_enc(data),
            HashSuite::Sha256 => cryptoutil::sha256(data),
        }
    }

    fn hkdf(&self, salt: &[u8], secret: &[u8], info: &[u8], size: usize) -> Result<Vec<u8>> {
        match self {
            HashSuite::Sha1 => cryptoutil::hkdf_sha1(salt, secret, info, size),
            HashSuite::Sha256 => cryptoutil::hkdf_sha256(salt, secret, info, size),
        }
    }

    fn hmac(&self, data: &[u8], key: &[u8]) -> Result<Vec<u8>> {
        match self {
            HashSuite::Sha1 => cryptoutil::hmac_sha1(data, key),
            HashSuite::Sha256 => cryptoutil::hmac_sha256(data, key),
        }
    }

    fn hmac_verify(&self, data: &[u8], key: &[u8], expected: &[u8]) -> Result<bool> {
        match self {
            HashSuite::Sha1 => cryptoutil::hmac_sha1_verify(data, key, expected),
            HashSuite::Sha256 => cryptoutil::hmac_sha256_verify(data, key, expected),
        }
    }

    fn key_confirm_len(&self) -> usize {
        match self {
            HashSuite::Sha1 => 20,
            HashSuite::Sha256 => 32,
        }
    }
}

fn bad_message(msg: &str) -> anyhow::Error {
    anyhow::Error::new(ErrorCode::InvalidMessage).context(msg.to_owned())
}

fn octets<'a>(item: &'a TlvItem, tag: u8, what: &str) -> Result<&'a [u8]> {
    item.get_octet_string(&[tag])
        .ok_or_else(|| bad_message(&format!("missing {}", what)))
}

fn random_bytes() -> [u8; RANDOM_LEN] {
    let mut r = [0u8; RANDOM_LEN];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut r);
    r
}

fn encode_signed(body: &[u8], signature: &[u8]) -> Result<Vec<u8>> {
    let mut tlv = tlv::TlvBuffer::new();
    tlv.write_anon_struct()?;
    tlv.write_octetstring(1, body)?;
    tlv.write_octetstring(2, signature)?;
    tlv.write_struct_end()?;
    Ok(tlv.data)
}

/// Split signed message into decoded body, raw body and signature.
fn decode_signed(msg: &[u8]) -> Result<(TlvItem, Vec<u8>, Vec<u8>)> {
    let outer = tlv::decode_tlv(msg).map_err(|e| bad_message(&format!("signed message: {}", e)))?;
    let body = octets(&outer, 1, "body")?.to_vec();
    let signature = octets(&outer, 2, "signature")?.to_vec();
    let decoded = tlv::decode_tlv(&body).map_err(|e| bad_message(&format!("message body: {}", e)))?;
    Ok((decoded, body, signature))
}

fn decode_ephemeral_key(bytes: &[u8]) -> Result<p256::PublicKey> {
    p256::PublicKey::from_sec1_bytes(bytes).map_err(|_| bad_message("ephemeral key is not a p256 point"))
}

pub struct CaseEngine {
    role: Role,
    state: CaseState,
    config: CaseConfig,
    protocol_config: u16,
    curve: u32,
    renegotiated: Option<(u16, u32)>,
    key_confirm: bool,
    fabric_index: FabricIndex,
    fabric_id: u64,
    root_public_key: Vec<u8>,
    local_node_id: u64,
    peer_node_id: u64,
    local_session_id: u16,
    peer_session_id: u16,
    ipk: Vec<u8>,
    ephemeral: Option<p256::ecdh::EphemeralSecret>,
    peer_ephemeral: Vec<u8>,
    request: Vec<u8>,
    response: Vec<u8>,
    confirm_key: Vec<u8>,
    secrets: Option<SessionSecrets>,
}

impl CaseEngine {
    fn new(role: Role, config: &CaseConfig) -> Self {
        Self {
            role,
            state: CaseState::Idle,
            config: config.clone(),
            protocol_config: config.protocol_configs.first().copied().unwrap_or(CONFIG_2),
            curve: config.curves.first().copied().unwrap_or(CURVE_P256),
            renegotiated: None,
            key_confirm: false,
            fabric_index: UNDEFINED_FABRIC_INDEX,
            fabric_id: 0,
            root_public_key: Vec::new(),
            local_node_id: 0,
            peer_node_id: 0,
            local_session_id: 0,
            peer_session_id: 0,
            ipk: Vec::new(),
            ephemeral: None,
            peer_ephemeral: Vec::new(),
            request: Vec::new(),
            response: Vec::new(),
            confirm_key: Vec::new(),
            secrets: None,
        }
    }

    pub fn initiator(config: &CaseConfig) -> Self {
        Self::new(Role::Initiator, config)
    }

    pub fn responder(config: &CaseConfig) -> Self {
        Self::new(Role::Responder, config)
    }

    pub fn role(&self) -> Role {
        self.role
    }
    pub fn state(&self) -> CaseState {
        self.state
    }
    pub fn protocol_config(&self) -> u16 {
        self.protocol_config
    }
    pub fn curve(&self) -> u32 {
        self.curve
    }
    pub fn fabric_index(&self) -> FabricIndex {
        self.fabric_index
    }
    pub fn peer_node_id(&self) -> u64 {
        self.peer_node_id
    }
    pub fn peer_session_id(&self) -> u16 {
        self.peer_session_id
    }
    pub fn key_confirm_negotiated(&self) -> bool {
        self.key_confirm
    }

    fn expect_state(&self, role: Role, state: CaseState) -> Result<()> {
        if self.role != role || self.state != state {
            return Err(ErrorCode::IncorrectState).context(format!(
                "{:?} in state {:?}, expected {:?} in {:?}",
                self.role, self.state, role, state
            ));
        }
        Ok(())
    }

    /// Run a protocol step; any error leaves the engine in [CaseState::Failed].
    fn step<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let res = f(self);
        if let Err(e) = &res {
            log::debug!("case {:?} failed in {:?}: {:?}", self.role, self.state, e);
            self.clear();
            self.state = CaseState::Failed;
        }
        res
    }

    /// Drop everything of the current exchange; negotiated parameters stay.
    fn clear(&mut self) {
        self.fabric_index = UNDEFINED_FABRIC_INDEX;
        self.fabric_id = 0;
        self.root_public_key.clear();
        self.local_node_id = 0;
        self.peer_node_id = 0;
        self.local_session_id = 0;
        self.peer_session_id = 0;
        self.ipk.clear();
        self.ephemeral = None;
        self.peer_ephemeral.clear();
        self.request.clear();
        self.response.clear();
        self.confirm_key.clear();
        self.secrets = None;
        self.key_confirm = false;
    }

    /// Discard the exchange and return to idle.
    pub fn abort(&mut self) {
        self.clear();
        self.renegotiated = None;
        self.state = CaseState::Idle;
    }

    /// Establishment timer expired.
    pub fn on_timeout(&mut self) {
        log::debug!("case {:?} timed out in {:?}", self.role, self.state);
        self.abort();
    }

    /// `fabric` must be the one this exchange started on.
    fn check_fabric(&self, fabric: &FabricInfo) -> Result<()> {
        if fabric.fabric_index() != self.fabric_index
            || fabric.fabric_id() != self.fabric_id
            || fabric.root_public_key() != self.root_public_key.as_slice()
        {
            return Err(ErrorCode::InvalidArgument).context(format!(
                "fabric {} ({:x}) is not the fabric {} ({:x}) of this exchange",
                fabric.fabric_index(),
                fabric.fabric_id(),
                self.fabric_index,
                self.fabric_id
            ));
        }
        Ok(())
    }

    fn suite(&self) -> Result<HashSuite> {
        HashSuite::for_config(self.protocol_config)
    }

    fn supports(&self, config: u16, curve: u32) -> bool {
        self.config.protocol_configs.contains(&config) && self.config.curves.contains(&curve)
    }

    fn peer_credentials(
        &self,
        fabric: &FabricInfo,
        noc: &[u8],
        icac: Option<&[u8]>,
    ) -> Result<crate::fabric::Credentials> {
        let array = credentials::encode_op_cert_array(noc, icac)?;
        let creds = fabric.verify_credentials(&array, &ValidationContext::operational())?;
        if creds.fabric_id != fabric.fabric_id() {
            return Err(ErrorCode::FabricMismatch).context(format!(
                "peer noc fabric {:x}, ours {:x}",
                creds.fabric_id,
                fabric.fabric_id()
            ));
        }
        Ok(creds)
    }

    fn derive_secrets(&mut self, shared: &[u8]) -> Result<()> {
        let suite = self.suite()?;
        let mut transcript = self.request.clone();
        transcript.extend_from_slice(&self.response);
        let mut salt = self.ipk.clone();
        salt.extend_from_slice(&suite.hash(&transcript));
        let okm = suite.hkdf(&salt, shared, SESSION_KEYS_INFO, SESSION_SECRETS_LEN)?;
        self.secrets = Some(SessionSecrets::from_okm(&okm)?);
        if self.key_confirm {
            self.confirm_key = suite.hkdf(&salt, shared, KEY_CONFIRM_INFO, suite.key_confirm_len())?;
        }
        Ok(())
    }

    fn transcript_hash(&self) -> Result<Vec<u8>> {
        let mut transcript = self.request.clone();
        transcript.extend_from_slice(&self.response);
        Ok(self.suite()?.hash(&transcript))
    }

    fn local_certs(fabric: &FabricInfo) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
        if !fabric.is_initialized() || fabric.operational_certs().is_empty() {
            return Err(ErrorCode::IncorrectState).context("fabric has no operational certificates");
        }
        credentials::decode_op_cert_array(fabric.operational_certs())
    }

    /// Build the begin request addressed to `peer_node_id` on `fabric`.
    pub fn begin_request(
        &mut self,
        fabric: &FabricInfo,
        ipk: &[u8],
        peer_node_id: u64,
        local_session_id: u16,
    ) -> Result<Vec<u8>> {
        self.expect_state(Role::Initiator, CaseState::Idle)?;
        self.step(|e| {
            let (noc, icac) = Self::local_certs(fabric)?;
            let random = random_bytes();
            let destination_id = fabric.generate_destination_id(ipk, &random, peer_node_id)?;
            let ephemeral = p256::ecdh::EphemeralSecret::random(&mut rand::thread_rng());
            let request_key_confirm = e.config.key_confirm == KeyConfirmMode::Always;

            let mut tlv = tlv::TlvBuffer::new();
            tlv.write_anon_struct()?;
            tlv.write_octetstring(1, &random)?;
            tlv.write_uint16(2, local_session_id)?;
            tlv.write_octetstring(3, &destination_id)?;
            tlv.write_octetstring(4, &ephemeral.public_key().to_sec1_bytes())?;
            tlv.write_uint16(5, e.protocol_config)?;
            tlv.write_uint32(6, e.curve)?;
            tlv.write_bool(7, request_key_confirm)?;
            tlv.write_octetstring(8, &noc)?;
            if let Some(icac) = &icac {
                tlv.write_octetstring(9, icac)?;
            }
            tlv.write_struct_end()?;
            let signature = fabric.sign(&tlv.data)?;
            let msg = encode_signed(&tlv.data, &signature)?;

            e.fabric_index = fabric.fabric_index();
            e.fabric_id = fabric.fabric_id();
            e.root_public_key = fabric.root_public_key().to_vec();
            e.local_node_id = fabric.node_id();
            e.peer_node_id = peer_node_id;
            e.local_session_id = local_session_id;
            e.ipk = ipk.to_vec();
            e.ephemeral = Some(ephemeral);
            e.request = msg.clone();
            e.state = CaseState::BeginRequestGenerated;
            log::debug!(
                "case request to node {:x} on fabric {} config {}",
                peer_node_id,
                e.fabric_index,
                e.protocol_config
            );
            Ok(msg)
        })
    }

    /// Handle responder's reconfigure message. The message is not authenticated,
    /// so only parameters from the local configuration other than the ones just
    /// offered are accepted.
    pub fn process_reconfigure(&mut self, msg: &[u8]) -> Result<()> {
        self.expect_state(Role::Initiator, CaseState::BeginRequestGenerated)?;
        self.step(|e| {
            let item = tlv::decode_tlv(msg).map_err(|err| bad_message(&format!("reconfigure: {}", err)))?;
            let config = item.get_u16(&[1]).ok_or_else(|| bad_message("missing protocol config"))?;
            let curve = item.get_u32(&[2]).ok_or_else(|| bad_message("missing curve"))?;
            if (config, curve) == (e.protocol_config, e.curve) {
                return Err(bad_message("reconfigure repeats the offered parameters"));
            }
            if !e.supports(config, curve) {
                return Err(ErrorCode::UnsupportedParameters)
                    .context(format!("peer wants config {} curve {:#x}", config, curve));
            }
            e.clear();
            e.renegotiated = Some((config, curve));
            e.state = CaseState::Reconfigure;
            Ok(())
        })
    }

    /// Adopt the renegotiated parameters and return to idle for a new request.
    pub fn reconfigure(&mut self) -> Result<()> {
        self.expect_state(Role::Initiator, CaseState::Reconfigure)?;
        if let Some((config, curve)) = self.renegotiated.take() {
            self.protocol_config = config;
            self.curve = curve;
        }
        self.state = CaseState::Idle;
        Ok(())
    }

    fn reconfigure_message(&self) -> Result<Vec<u8>> {
        let mut tlv = tlv::TlvBuffer::new();
        tlv.write_anon_struct()?;
        tlv.write_uint16(1, self.protocol_config)?;
        tlv.write_uint32(2, self.curve)?;
        tlv.write_struct_end()?;
        Ok(tlv.data)
    }

    /// Verify an incoming begin request and find which local fabric it addresses.
    pub fn process_begin_request<K: AsRef<[u8]>>(
        &mut self,
        msg: &[u8],
        fabrics: &mut FabricTable,
        ipks: &[K],
        local_session_id: u16,
    ) -> Result<RequestOutcome> {
        self.expect_state(Role::Responder, CaseState::Idle)?;
        let outcome = self.step(|e| {
            let (body, raw_body, signature) = decode_signed(msg)?;
            let config = body.get_u16(&[5]).ok_or_else(|| bad_message("missing protocol config"))?;
            let curve = body.get_u32(&[6]).ok_or_else(|| bad_message("missing curve"))?;
            if !e.supports(config, curve) {
                log::debug!("case request with config {} curve {:#x}, asking to reconfigure", config, curve);
                return Ok(RequestOutcome::Reconfigure(e.reconfigure_message()?));
            }
            let random = octets(&body, 1, "random")?;
            let peer_session_id = body.get_u16(&[2]).ok_or_else(|| bad_message("missing session id"))?;
            let destination_id = octets(&body, 3, "destination id")?;
            let peer_ephemeral = octets(&body, 4, "ephemeral key")?;
            decode_ephemeral_key(peer_ephemeral)?;
            let requested_confirm = body.get_bool(&[7]).unwrap_or(false);
            let noc = octets(&body, 8, "noc")?;
            let icac = body.get_octet_string(&[9]);

            let index = fabrics
                .find_destination_id_candidate(destination_id, random, ipks)
                .ok_or(ErrorCode::CertNotTrusted)
                .context("destination id matches no fabric")?;
            let fabric = fabrics
                .fabric(index)
                .ok_or(ErrorCode::IncorrectState)
                .context("matched fabric vanished")?;
            let ipk = ipks
                .iter()
                .map(|k| k.as_ref())
                .find(|k| fabric.match_destination_id(destination_id, random, &[k]).is_ok())
                .ok_or(ErrorCode::CertNotTrusted)
                .context("no ipk for matched fabric")?;

            let creds = e.peer_credentials(fabric, noc, icac)?;
            keypair::verify_signature(&creds.noc_public_key, &raw_body, &signature)
                .context("begin request signature")?;

            e.protocol_config = config;
            e.curve = curve;
            e.key_confirm = match e.config.key_confirm {
                KeyConfirmMode::Never => false,
                KeyConfirmMode::IfRequested => requested_confirm,
                KeyConfirmMode::Always => true,
            };
            e.fabric_index = index;
            e.fabric_id = fabric.fabric_id();
            e.root_public_key = fabric.root_public_key().to_vec();
            e.local_node_id = fabric.node_id();
            e.peer_node_id = creds.peer_id.node_id;
            e.local_session_id = local_session_id;
            e.peer_session_id = peer_session_id;
            e.ipk = ipk.to_vec();
            e.peer_ephemeral = peer_ephemeral.to_vec();
            e.request = msg.to_vec();
            e.state = CaseState::BeginRequestProcessed;
            log::debug!(
                "case request from node {:x} accepted on fabric {}",
                e.peer_node_id,
                index
            );
            Ok(RequestOutcome::Accepted)
        })?;
        Ok(outcome)
    }

    /// Build the begin response, signed with the key of the fabric the request matched.
    pub fn begin_response(&mut self, fabric: &FabricInfo) -> Result<Vec<u8>> {
        self.expect_state(Role::Responder, CaseState::BeginRequestProcessed)?;
        self.step(|e| {
            e.check_fabric(fabric)?;
            let (noc, icac) = Self::local_certs(fabric)?;
            let suite = e.suite()?;
            let ephemeral = p256::ecdh::EphemeralSecret::random(&mut rand::thread_rng());
            let shared = ephemeral.diffie_hellman(&decode_ephemeral_key(&e.peer_ephemeral)?);

            let mut tlv = tlv::TlvBuffer::new();
            tlv.write_anon_struct()?;
            tlv.write_octetstring(1, &random_bytes())?;
            tlv.write_uint16(2, e.local_session_id)?;
            tlv.write_octetstring(3, &ephemeral.public_key().to_sec1_bytes())?;
            tlv.write_octetstring(4, &noc)?;
            if let Some(icac) = &icac {
                tlv.write_octetstring(5, icac)?;
            }
            tlv.write_bool(6, e.key_confirm)?;
            tlv.write_octetstring(7, &suite.hash(&e.request))?;
            tlv.write_struct_end()?;
            let signature = fabric.sign(&tlv.data)?;
            e.response = encode_signed(&tlv.data, &signature)?;
            e.derive_secrets(shared.raw_secret_bytes().as_slice())?;
            e.state = if e.key_confirm {
                CaseState::BeginResponseGenerated
            } else {
                CaseState::Complete
            };
            Ok(e.response.clone())
        })
    }

    /// Verify the responder's begin response and derive the session keys.
    pub fn process_begin_response(&mut self, msg: &[u8], fabric: &FabricInfo) -> Result<()> {
        self.expect_state(Role::Initiator, CaseState::BeginRequestGenerated)?;
        self.step(|e| {
            e.check_fabric(fabric)?;
            let suite = e.suite()?;
            let (body, raw_body, signature) = decode_signed(msg)?;
            let request_hash = octets(&body, 7, "request hash")?;
            if request_hash != suite.hash(&e.request).as_slice() {
                return Err(bad_message("response is not for our request"));
            }
            let peer_session_id = body.get_u16(&[2]).ok_or_else(|| bad_message("missing session id"))?;
            let peer_ephemeral = decode_ephemeral_key(octets(&body, 3, "ephemeral key")?)?;
            let noc = octets(&body, 4, "noc")?;
            let icac = body.get_octet_string(&[5]);
            let key_confirm = body.get_bool(&[6]).unwrap_or(false);

            let creds = e.peer_credentials(fabric, noc, icac)?;
            if creds.peer_id.node_id != e.peer_node_id {
                return Err(ErrorCode::CertNotTrusted).context(format!(
                    "responder is node {:x}, expected {:x}",
                    creds.peer_id.node_id, e.peer_node_id
                ));
            }
            keypair::verify_signature(&creds.noc_public_key, &raw_body, &signature)
                .context("begin response signature")?;
            match e.config.key_confirm {
                KeyConfirmMode::Always if !key_confirm => {
                    return Err(ErrorCode::UnsupportedParameters).context("responder declined key confirmation")
                }
                KeyConfirmMode::Never if key_confirm => {
                    return Err(ErrorCode::UnsupportedParameters).context("responder requires key confirmation")
                }
                _ => {}
            }

            let ephemeral = e
                .ephemeral
                .take()
                .ok_or(ErrorCode::IncorrectState)
                .context("no ephemeral key")?;
            let shared = ephemeral.diffie_hellman(&peer_ephemeral);
            e.peer_session_id = peer_session_id;
            e.key_confirm = key_confirm;
            e.response = msg.to_vec();
            e.derive_secrets(shared.raw_secret_bytes().as_slice())?;
            e.state = if key_confirm {
                CaseState::BeginResponseProcessed
            } else {
                CaseState::Complete
            };
            Ok(())
        })
    }

    /// Key confirmation message; completes the initiator side.
    pub fn key_confirm(&mut self) -> Result<Vec<u8>> {
        self.expect_state(Role::Initiator, CaseState::BeginResponseProcessed)?;
        self.step(|e| {
            let suite = e.suite()?;
            let mac = suite.hmac(&e.transcript_hash()?, &e.confirm_key)?;
            let mut tlv = tlv::TlvBuffer::new();
            tlv.write_anon_struct()?;
            tlv.write_octetstring(1, &mac)?;
            tlv.write_struct_end()?;
            e.state = CaseState::Complete;
            Ok(tlv.data)
        })
    }

    pub fn process_key_confirm(&mut self, msg: &[u8]) -> Result<()> {
        self.expect_state(Role::Responder, CaseState::BeginResponseGenerated)?;
        self.step(|e| {
            let item = tlv::decode_tlv(msg).map_err(|err| bad_message(&format!("key confirm: {}", err)))?;
            let mac = octets(&item, 1, "key confirmation")?;
            let suite = e.suite()?;
            if !suite.hmac_verify(&e.transcript_hash()?, &e.confirm_key, mac)? {
                return Err(ErrorCode::InvalidSignature).context("key confirmation mismatch");
            }
            e.state = CaseState::Complete;
            Ok(())
        })
    }

    /// Install the established session into `store` and return its local id.
    /// The engine is idle afterwards.
    pub fn commit(&mut self, store: &mut SessionKeyStore) -> Result<u16> {
        if self.state != CaseState::Complete {
            return Err(ErrorCode::IncorrectState).context(format!("commit in state {:?}", self.state));
        }
        let secrets = self
            .secrets
            .as_ref()
            .ok_or(ErrorCode::IncorrectState)
            .context("no session keys")?;
        let key = SessionKey::new(
            self.fabric_index,
            self.local_session_id,
            self.peer_session_id,
            self.local_node_id,
            self.peer_node_id,
            secrets,
            self.role == Role::Initiator,
        );
        store.install(key)?;
        let id = self.local_session_id;
        self.abort();
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::CertificateAuthority;
    use crate::config::{ReplacementPolicy, SessionConfig};
    use crate::error;
    use crate::session;
    use crate::storage::MemoryStorage;
    use crate::testutil;
    use std::sync::Arc;

    struct Node {
        _storage: Arc<MemoryStorage>,
        table: FabricTable,
        index: FabricIndex,
        sessions: SessionKeyStore,
    }

    impl Node {
        fn new(ca: &CertificateAuthority, node_id: u64) -> Result<Self> {
            let (storage, mut table) = testutil::table(4)?;
            let index = table.add_new_fabric(&mut testutil::candidate(ca, node_id)?)?;
            let config = SessionConfig {
                replacement: ReplacementPolicy::KeepExisting,
                ..Default::default()
            };
            Ok(Self {
                _storage: storage,
                table,
                index,
                sessions: SessionKeyStore::new(&config, session::sys_epoch),
            })
        }

        fn fabric(&self) -> Result<&FabricInfo> {
            self.table.fabric(self.index).context("fabric")
        }

        fn ipk(&self) -> Result<Vec<u8>> {
            self.fabric()?.derive_operational_ipk(&testutil::EPOCH_KEY)
        }
    }

    fn case_config(configs: &[u16], key_confirm: KeyConfirmMode) -> CaseConfig {
        CaseConfig {
            protocol_configs: configs.to_vec(),
            key_confirm,
            ..Default::default()
        }
    }

    /// Runs the exchange and checks both ends can talk over the new session.
    fn handshake(init_cfg: &CaseConfig, resp_cfg: &CaseConfig, with_icac: bool) -> Result<(bool, u16)> {
        let ca = testutil::ca(0xCA5E, with_icac)?;
        let mut a = Node::new(&ca, 0x10)?;
        let mut b = Node::new(&ca, 0x20)?;
        let mut init = CaseEngine::initiator(init_cfg);
        let mut resp = CaseEngine::responder(resp_cfg);

        let sid_a = a.sessions.allocate_key_id()?;
        let req = init.begin_request(a.fabric()?, &a.ipk()?, 0x20, sid_a)?;
        assert_eq!(init.state(), CaseState::BeginRequestGenerated);

        let sid_b = b.sessions.allocate_key_id()?;
        let ipks = vec![vec![0u8; 16], b.ipk()?];
        assert_eq!(resp.process_begin_request(&req, &mut b.table, &ipks, sid_b)?, RequestOutcome::Accepted);
        assert_eq!(resp.peer_node_id(), 0x10);
        let rsp = resp.begin_response(b.fabric()?)?;
        init.process_begin_response(&rsp, a.fabric()?)?;
        assert_eq!(init.peer_session_id(), sid_b);

        let confirmed = init.key_confirm_negotiated();
        if confirmed {
            assert_eq!(init.state(), CaseState::BeginResponseProcessed);
            assert_eq!(resp.state(), CaseState::BeginResponseGenerated);
            let kc = init.key_confirm()?;
            resp.process_key_confirm(&kc)?;
        }
        assert_eq!(init.state(), CaseState::Complete);
        assert_eq!(resp.state(), CaseState::Complete);
        let protocol_config = init.protocol_config();

        assert_eq!(init.commit(&mut a.sessions)?, sid_a);
        assert_eq!(resp.commit(&mut b.sessions)?, sid_b);
        assert_eq!(init.state(), CaseState::Idle);

        let sa = a.sessions.get(sid_a).context("initiator session")?;
        let sb = b.sessions.get(sid_b).context("responder session")?;
        assert_eq!(sa.peer_key_id, sid_b);
        assert_eq!(sb.peer_key_id, sid_a);
        assert_eq!(sa.attestation_challenge(), sb.attestation_challenge());
        assert!(sa.flags.contains(session::SessionFlags::LOCALLY_INITIATED));
        assert!(!sb.flags.contains(session::SessionFlags::LOCALLY_INITIATED));

        let (ctr, sealed) = a.sessions.seal(sid_a, b"aad", b"ping")?;
        assert_eq!(b.sessions.open(sid_b, ctr, b"aad", &sealed)?, b"ping");
        let (ctr, sealed) = b.sessions.seal(sid_b, b"aad", b"pong")?;
        assert_eq!(a.sessions.open(sid_a, ctr, b"aad", &sealed)?, b"pong");
        Ok((confirmed, protocol_config))
    }

    #[test]
    fn happy_path_without_key_confirm() -> Result<()> {
        testutil::init_logging();
        let cfg = CaseConfig::default();
        assert_eq!(handshake(&cfg, &cfg, false)?, (false, CONFIG_2));
        Ok(())
    }

    #[test]
    fn happy_path_with_key_confirm() -> Result<()> {
        let init = case_config(&[CONFIG_2], KeyConfirmMode::Always);
        let resp = CaseConfig::default();
        assert_eq!(handshake(&init, &resp, true)?, (true, CONFIG_2));
        // responder insisting on confirmation
        let resp = case_config(&[CONFIG_2], KeyConfirmMode::Always);
        assert_eq!(handshake(&CaseConfig::default(), &resp, false)?, (true, CONFIG_2));
        Ok(())
    }

    #[test]
    fn legacy_hash_suite() -> Result<()> {
        let cfg = case_config(&[CONFIG_1], KeyConfirmMode::Always);
        assert_eq!(handshake(&cfg, &cfg, false)?, (true, CONFIG_1));
        Ok(())
    }

    #[test]
    fn reconfigure_negotiation() -> Result<()> {
        let ca = testutil::ca(0xCA5E, false)?;
        let a = Node::new(&ca, 0x10)?;
        let mut b = Node::new(&ca, 0x20)?;
        let b_ipk = b.ipk()?;
        let mut init = CaseEngine::initiator(&case_config(&[CONFIG_1, CONFIG_2], KeyConfirmMode::IfRequested));
        let mut resp = CaseEngine::responder(&CaseConfig::default());

        let req = init.begin_request(a.fabric()?, &a.ipk()?, 0x20, 1)?;
        let reconf = match resp.process_begin_request(&req, &mut b.table, &[&b_ipk], 2)? {
            RequestOutcome::Reconfigure(m) => m,
            RequestOutcome::Accepted => anyhow::bail!("responder accepted unsupported config"),
        };
        assert_eq!(resp.state(), CaseState::Idle);

        init.process_reconfigure(&reconf)?;
        assert_eq!(init.state(), CaseState::Reconfigure);
        init.reconfigure()?;
        assert_eq!(init.state(), CaseState::Idle);
        assert_eq!(init.protocol_config(), CONFIG_2);

        let req = init.begin_request(a.fabric()?, &a.ipk()?, 0x20, 1)?;
        assert_eq!(resp.process_begin_request(&req, &mut b.table, &[&b_ipk], 2)?, RequestOutcome::Accepted);
        let rsp = resp.begin_response(b.fabric()?)?;
        init.process_begin_response(&rsp, a.fabric()?)?;
        assert_eq!(init.state(), CaseState::Complete);

        // initiator that can't follow the responder's choice
        let mut strict = CaseEngine::initiator(&case_config(&[CONFIG_1], KeyConfirmMode::IfRequested));
        strict.begin_request(a.fabric()?, &a.ipk()?, 0x20, 3)?;
        let res = strict.process_reconfigure(&reconf);
        assert!(error::has_code(&res, ErrorCode::UnsupportedParameters));
        assert_eq!(strict.state(), CaseState::Failed);
        Ok(())
    }

    #[test]
    fn reconfigure_to_offered_parameters_rejected() -> Result<()> {
        let ca = testutil::ca(0xCA5E, false)?;
        let a = Node::new(&ca, 0x10)?;
        let mut init = CaseEngine::initiator(&CaseConfig::default());
        init.begin_request(a.fabric()?, &a.ipk()?, 0x20, 1)?;
        assert_eq!((init.protocol_config(), init.curve()), (CONFIG_2, CURVE_P256));

        let same = CaseEngine::responder(&CaseConfig::default()).reconfigure_message()?;
        let res = init.process_reconfigure(&same);
        assert!(error::has_code(&res, ErrorCode::InvalidMessage));
        assert_eq!(init.state(), CaseState::Failed);
        assert!(error::has_code(&init.reconfigure(), ErrorCode::IncorrectState));
        Ok(())
    }

    #[test]
    fn key_confirm_never_refuses_demanding_responder() -> Result<()> {
        let ca = testutil::ca(0xCA5E, false)?;
        let a = Node::new(&ca, 0x10)?;
        let mut b = Node::new(&ca, 0x20)?;
        let b_ipk = b.ipk()?;
        let mut init = CaseEngine::initiator(&case_config(&[CONFIG_2], KeyConfirmMode::Never));
        let mut resp = CaseEngine::responder(&case_config(&[CONFIG_2], KeyConfirmMode::Always));

        let req = init.begin_request(a.fabric()?, &a.ipk()?, 0x20, 1)?;
        resp.process_begin_request(&req, &mut b.table, &[&b_ipk], 2)?;
        assert!(resp.key_confirm_negotiated());
        let rsp = resp.begin_response(b.fabric()?)?;

        let res = init.process_begin_response(&rsp, a.fabric()?);
        assert!(error::has_code(&res, ErrorCode::UnsupportedParameters));
        assert_eq!(init.state(), CaseState::Failed);
        assert!(!init.key_confirm_negotiated());
        Ok(())
    }

    #[test]
    fn responder_from_other_fabric_rejected() -> Result<()> {
        let ca = testutil::ca(0xCA5E, false)?;
        let a = Node::new(&ca, 0x10)?;
        let mut b = Node::new(&ca, 0x20)?;
        let b_ipk = b.ipk()?;

        // same root, responder signs with a NOC for another fabric id
        let kp = crate::keypair::OperationalKeypair::generate();
        let noc = ca.issue_noc(0x20, 0xBAD, &[], kp.public_key())?;
        let mut rogue = FabricInfo::new();
        rogue.set_operational_key(kp);
        rogue.set_root_cert(ca.root_cert())?;
        rogue.set_operational_certs_from_cert_array(&credentials::encode_op_cert_array(&noc, None)?)?;
        let (_s, mut rogue_table) = testutil::table(4)?;
        let rogue_index = rogue_table.add_new_fabric(&mut rogue)?;
        assert_eq!(rogue_index, b.index);
        let rogue = rogue_table.fabric(rogue_index).context("rogue")?;

        let mut init = CaseEngine::initiator(&CaseConfig::default());
        let req = init.begin_request(a.fabric()?, &a.ipk()?, 0x20, 1)?;

        // same index in another table is not the fabric the request matched
        let mut resp = CaseEngine::responder(&CaseConfig::default());
        resp.process_begin_request(&req, &mut b.table, &[&b_ipk], 2)?;
        let res = resp.begin_response(rogue);
        assert!(error::has_code(&res, ErrorCode::InvalidArgument));
        assert_eq!(resp.state(), CaseState::Failed);

        // a responder that skips the check still gets caught by the initiator
        let mut resp = CaseEngine::responder(&CaseConfig::default());
        resp.process_begin_request(&req, &mut b.table, &[&b_ipk], 2)?;
        resp.fabric_id = rogue.fabric_id();
        let rsp = resp.begin_response(rogue)?;

        let res = init.process_begin_response(&rsp, a.fabric()?);
        assert!(error::has_code(&res, ErrorCode::FabricMismatch));
        assert_eq!(init.state(), CaseState::Failed);
        let mut store = SessionKeyStore::new(&SessionConfig::default(), session::sys_epoch);
        assert!(error::has_code(&init.commit(&mut store), ErrorCode::IncorrectState));
        assert!(store.is_empty());
        Ok(())
    }

    #[test]
    fn unknown_destination_and_bad_key_confirm() -> Result<()> {
        let ca = testutil::ca(0xCA5E, false)?;
        let stranger = testutil::ca(0x5757, false)?;
        let a = Node::new(&ca, 0x10)?;
        let mut b = Node::new(&ca, 0x20)?;
        let mut c = Node::new(&stranger, 0x20)?;
        let b_ipk = b.ipk()?;
        let c_ipk = c.ipk()?;

        let mut init = CaseEngine::initiator(&case_config(&[CONFIG_2], KeyConfirmMode::Always));
        let req = init.begin_request(a.fabric()?, &a.ipk()?, 0x20, 1)?;

        let mut resp = CaseEngine::responder(&CaseConfig::default());
        let res = resp.process_begin_request(&req, &mut c.table, &[&c_ipk], 2);
        assert!(error::has_code(&res, ErrorCode::CertNotTrusted));
        assert_eq!(resp.state(), CaseState::Failed);

        let mut resp = CaseEngine::responder(&CaseConfig::default());
        resp.process_begin_request(&req, &mut b.table, &[&b_ipk], 2)?;
        let rsp = resp.begin_response(b.fabric()?)?;
        init.process_begin_response(&rsp, a.fabric()?)?;
        let mut kc = init.key_confirm()?;
        let last = kc.len() - 2;
        kc[last] ^= 0x01;
        let res = resp.process_key_confirm(&kc);
        assert!(error::has_code(&res, ErrorCode::InvalidSignature));
        assert_eq!(resp.state(), CaseState::Failed);
        Ok(())
    }

    #[test]
    fn responder_finds_fabric_only_in_storage() -> Result<()> {
        let ca = testutil::ca(0xCA5E, false)?;
        let a = Node::new(&ca, 0x10)?;
        let mut b = Node::new(&ca, 0x20)?;
        let b_ipk = b.ipk()?;
        b.table.reset();

        let mut init = CaseEngine::initiator(&CaseConfig::default());
        let mut resp = CaseEngine::responder(&CaseConfig::default());
        let req = init.begin_request(a.fabric()?, &a.ipk()?, 0x20, 1)?;
        resp.process_begin_request(&req, &mut b.table, &[&b_ipk], 2)?;
        assert_eq!(resp.fabric_index(), b.index);
        let rsp = resp.begin_response(b.fabric()?)?;
        init.process_begin_response(&rsp, a.fabric()?)?;
        assert_eq!(init.state(), CaseState::Complete);
        Ok(())
    }

    #[test]
    fn abort_discards_exchange() -> Result<()> {
        let ca = testutil::ca(0xCA5E, false)?;
        let a = Node::new(&ca, 0x10)?;
        let mut b = Node::new(&ca, 0x20)?;
        let b_ipk = b.ipk()?;
        let mut init = CaseEngine::initiator(&CaseConfig::default());
        let mut resp = CaseEngine::responder(&CaseConfig::default());
        let req = init.begin_request(a.fabric()?, &a.ipk()?, 0x20, 1)?;
        resp.process_begin_request(&req, &mut b.table, &[&b_ipk], 2)?;
        let rsp = resp.begin_response(b.fabric()?)?;
        assert_eq!(resp.state(), CaseState::Complete);

        init.on_timeout();
        assert_eq!(init.state(), CaseState::Idle);
        let res = init.process_begin_response(&rsp, a.fabric()?);
        assert!(error::has_code(&res, ErrorCode::IncorrectState));
        // wrong role
        assert!(error::has_code(&init.key_confirm(), ErrorCode::IncorrectState));

        resp.abort();
        let mut store = SessionKeyStore::new(&SessionConfig::default(), session::sys_epoch);
        assert!(error::has_code(&resp.commit(&mut store), ErrorCode::IncorrectState));
        Ok(())
    }
}
