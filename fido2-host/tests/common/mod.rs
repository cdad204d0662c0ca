//! Simulated CTAPHID authenticator shared by the integration tests
//!
//! Speaks enough CTAPHID (INIT, CBOR, CANCEL, WINK) and CTAP2 (GetInfo,
//! MakeCredential, GetAssertion, GetNextAssertion, ClientPIN) to drive the
//! client end to end. Touch is simulated with a delay during which the
//! device sends UPNEEDED keepalives.

#![allow(dead_code)]

use fido2_host::{DeviceLocation, HidBackend, HidConnection, User};
use fido2_host_crypto::{KeyPair, PinProtocol, pin_hash};
use fido2_host_ctap::StatusCode;
use fido2_host_ctap::cbor::{self, MapBuilder, MapParser, Value, int_entry, text_entry};
use fido2_host_transport::{Cmd, Error as HidError, Message, Packet, Result as HidResult};

use p256::PublicKey;
use p256::ecdsa::{Signature, SigningKey, signature::Signer};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub const AAGUID: [u8; 16] = *b"fido2-host-sim\0\0";

const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(20);
const KEEPALIVE_UP_NEEDED: u8 = 0x02;
const INIT_DATA: usize = 57;
const CONT_DATA: usize = 59;

/// Install a fmt subscriber once; `RUST_LOG=fido2_host=trace` shows the traffic
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// How the device reacts to CTAPHID_CANCEL while a command waits for touch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReply {
    /// Finish the command with CTAP2_ERR_KEEPALIVE_CANCEL
    Acknowledge,
    /// Carry on as if nothing arrived
    Ignore,
    /// The touch raced the cancel: send the real result
    Success,
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Time until the simulated user touches the device; `None` never touches
    pub touch_after: Option<Duration>,
    /// Send UPNEEDED keepalives while waiting for touch
    pub keepalives: bool,
    pub cancel_reply: CancelReply,
    /// Answer every touch-gated command with this status instead of its result
    pub deny_with: Option<StatusCode>,
    /// PIN configured on the device
    pub pin: Option<String>,
    /// Advertise getPinUvAuthTokenUsingPinWithPermissions
    pub pin_uv_auth_token: bool,
    pub pin_protocols: Vec<u8>,
    pub hmac_secret: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            touch_after: Some(Duration::ZERO),
            keepalives: true,
            cancel_reply: CancelReply::Acknowledge,
            deny_with: None,
            pin: None,
            pin_uv_auth_token: true,
            pin_protocols: vec![2, 1],
            hmac_secret: true,
        }
    }
}

impl SimConfig {
    pub fn never_touched() -> Self {
        Self {
            touch_after: None,
            ..Self::default()
        }
    }

    pub fn touched_after(delay: Duration) -> Self {
        Self {
            touch_after: Some(delay),
            ..Self::default()
        }
    }

    pub fn with_pin(mut self, pin: &str) -> Self {
        self.pin = Some(pin.to_string());
        self
    }

    pub fn silent(mut self) -> Self {
        self.keepalives = false;
        self
    }

    pub fn with_cancel_reply(mut self, reply: CancelReply) -> Self {
        self.cancel_reply = reply;
        self
    }

    pub fn denied_with(mut self, status: StatusCode) -> Self {
        self.deny_with = Some(status);
        self
    }
}

struct Credential {
    id: Vec<u8>,
    rp_id: String,
    user: User,
    key: SigningKey,
    cred_random: [u8; 32],
    resident: bool,
}

struct State {
    credentials: Vec<Credential>,
    sign_count: u32,
    key_agreement: KeyPair,
    pin_token: [u8; 32],
    next_cid: u32,
    /// Responses queued for GetNextAssertion
    next_assertions: VecDeque<Vec<u8>>,
    /// CTAP2 requests in arrival order (opcode + params)
    requests: Vec<Vec<u8>>,
    last_permissions: Option<u8>,
}

/// What a CBOR request produces
enum Reply {
    Now(Vec<u8>),
    AfterTouch(Vec<u8>),
}

pub struct SimAuthenticator {
    config: SimConfig,
    touch_after: Mutex<Option<Duration>>,
    state: Mutex<State>,
    waiting_for_touch: AtomicBool,
    cancels: AtomicUsize,
    inits: AtomicUsize,
}

impl SimAuthenticator {
    pub fn new(config: SimConfig) -> Self {
        let mut pin_token = [0u8; 32];
        OsRng.fill_bytes(&mut pin_token);
        Self {
            touch_after: Mutex::new(config.touch_after),
            config,
            state: Mutex::new(State {
                credentials: Vec::new(),
                sign_count: 0,
                key_agreement: KeyPair::generate(),
                pin_token,
                next_cid: 0x0100_0000,
                next_assertions: VecDeque::new(),
                requests: Vec::new(),
                last_permissions: None,
            }),
            waiting_for_touch: AtomicBool::new(false),
            cancels: AtomicUsize::new(0),
            inits: AtomicUsize::new(0),
        }
    }

    /// True while a command is parked waiting for the simulated touch
    pub fn waiting_for_touch(&self) -> bool {
        self.waiting_for_touch.load(Ordering::SeqCst)
    }

    /// Block until a command is waiting for touch, or panic after `timeout`
    pub fn wait_until_pending(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while !self.waiting_for_touch() {
            assert!(Instant::now() < deadline, "no command reached the authenticator");
            thread::sleep(Duration::from_millis(2));
        }
    }

    /// Change when the simulated user touches, for commands sent from now on
    pub fn set_touch_after(&self, delay: Option<Duration>) {
        *self.touch_after.lock().unwrap() = delay;
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub fn inits(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    pub fn credential_count(&self) -> usize {
        self.state.lock().unwrap().credentials.len()
    }

    pub fn last_permissions(&self) -> Option<u8> {
        self.state.lock().unwrap().last_permissions
    }

    /// Parameters of the latest request with opcode `cmd`, decoded
    pub fn last_request(&self, cmd: u8) -> Option<Value> {
        let state = self.state.lock().unwrap();
        let request = state.requests.iter().rev().find(|r| r.first() == Some(&cmd))?;
        Some(cbor::decode(&request[1..]).unwrap())
    }

    /// Opcodes of every CTAP2 request received so far
    pub fn opcodes(&self) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        state.requests.iter().filter_map(|r| r.first().copied()).collect()
    }

    fn allocate_cid(&self) -> u32 {
        self.inits.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        state.next_cid += 1;
        state.next_cid
    }

    fn handle_cbor(&self, request: &[u8]) -> Reply {
        self.state.lock().unwrap().requests.push(request.to_vec());
        let Some((&cmd, params)) = request.split_first() else {
            return Reply::Now(vec![StatusCode::InvalidLength.to_u8()]);
        };

        let result = match cmd {
            0x01 => self.make_credential(params),
            0x02 => self.get_assertion(params),
            0x04 => Ok(Reply::Now(ok(self.get_info()))),
            0x06 => self.client_pin(params).map(|body| Reply::Now(ok(body))),
            0x07 => {
                self.state.lock().unwrap().credentials.clear();
                Ok(Reply::AfterTouch(vec![0]))
            }
            0x08 => self.get_next_assertion().map(Reply::Now),
            0x0B => Ok(Reply::AfterTouch(vec![0])),
            _ => Err(StatusCode::InvalidCommand),
        };
        result.unwrap_or_else(|status| Reply::Now(vec![status.to_u8()]))
    }

    fn get_info(&self) -> Vec<u8> {
        let mut options = vec![
            ("rk".to_string(), true),
            ("up".to_string(), true),
            ("plat".to_string(), false),
            ("clientPin".to_string(), self.config.pin.is_some()),
        ];
        if self.config.pin_uv_auth_token {
            options.push(("pinUvAuthToken".to_string(), true));
        }
        let options: std::collections::BTreeMap<String, bool> = options.into_iter().collect();

        let mut extensions = vec!["credProtect"];
        if self.config.hmac_secret {
            extensions.push("hmac-secret");
        }

        MapBuilder::new()
            .insert(0x01, ["FIDO_2_0", "FIDO_2_1"])
            .unwrap()
            .insert(0x02, extensions)
            .unwrap()
            .insert_bytes(0x03, &AAGUID)
            .unwrap()
            .insert(0x04, options)
            .unwrap()
            .insert(0x05, 1200u32)
            .unwrap()
            .insert(0x06, &self.config.pin_protocols)
            .unwrap()
            .insert(0x09, ["usb"])
            .unwrap()
            .build()
    }

    fn check_pin_auth(&self, param: &[u8], protocol: Option<u8>, cdh: &[u8]) -> Result<(), StatusCode> {
        let protocol = PinProtocol::from_version(protocol.ok_or(StatusCode::MissingParameter)?)
            .map_err(|_| StatusCode::InvalidParameter)?;
        let state = self.state.lock().unwrap();
        if protocol.verify(&state.pin_token, cdh, param) {
            Ok(())
        } else {
            Err(StatusCode::PinAuthInvalid)
        }
    }

    fn make_credential(&self, params: &[u8]) -> Result<Reply, StatusCode> {
        let p = MapParser::from_bytes(params).map_err(|_| StatusCode::InvalidCbor)?;
        let cdh = p.get_bytes(0x01).map_err(|_| StatusCode::MissingParameter)?;
        let rp_id = match p.get_raw(0x02).and_then(|rp| text_entry(rp, "id")) {
            Some(Value::Text(id)) => id.clone(),
            _ => return Err(StatusCode::MissingParameter),
        };
        let user: User = p.get(0x03).map_err(|_| StatusCode::MissingParameter)?;

        let es256 = match p.get_raw(0x04) {
            Some(Value::Array(params)) => params
                .iter()
                .any(|param| text_entry(param, "alg") == Some(&Value::Integer(-7))),
            _ => return Err(StatusCode::MissingParameter),
        };
        if !es256 {
            return Err(StatusCode::UnsupportedAlgorithm);
        }

        let mut uv = false;
        if let Some(param) = p.get_bytes_opt(0x08).map_err(|_| StatusCode::CborUnexpectedType)? {
            if param.is_empty() {
                // Touch probe: answer after the touch
                let status = if self.config.pin.is_some() {
                    StatusCode::PinInvalid
                } else {
                    StatusCode::PinNotSet
                };
                return Ok(Reply::AfterTouch(vec![status.to_u8()]));
            }
            self.check_pin_auth(&param, p.get_opt(0x09).ok().flatten(), &cdh)?;
            uv = true;
        }

        let excluded = ids_in(p.get_raw(0x05));
        let extensions = p.get_raw(0x06);
        let hmac_secret = extensions.and_then(|ext| text_entry(ext, "hmac-secret")) == Some(&Value::Bool(true));
        let cred_protect = match extensions.and_then(|ext| text_entry(ext, "credProtect")) {
            Some(Value::Integer(level)) => Some(*level),
            _ => None,
        };
        let resident = p.get_raw(0x07).and_then(|opts| text_entry(opts, "rk")) == Some(&Value::Bool(true));

        let mut state = self.state.lock().unwrap();
        if state
            .credentials
            .iter()
            .any(|cred| cred.rp_id == rp_id && excluded.contains(&cred.id))
        {
            return Ok(Reply::AfterTouch(vec![StatusCode::CredentialExcluded.to_u8()]));
        }

        let key = SigningKey::random(&mut OsRng);
        let mut id = vec![0u8; 32];
        OsRng.fill_bytes(&mut id);
        let mut cred_random = [0u8; 32];
        OsRng.fill_bytes(&mut cred_random);

        let point = PublicKey::from(key.verifying_key()).to_encoded_point(false);
        let cose_key = MapBuilder::new()
            .insert(1, 2)
            .unwrap()
            .insert(3, -7)
            .unwrap()
            .insert(-1, 1)
            .unwrap()
            .insert_bytes(-2, point.x().unwrap())
            .unwrap()
            .insert_bytes(-3, point.y().unwrap())
            .unwrap()
            .build();

        let mut ext_entries = Vec::new();
        if let Some(level) = cred_protect {
            ext_entries.push((Value::Text("credProtect".into()), Value::Integer(level)));
        }
        if hmac_secret {
            ext_entries.push((Value::Text("hmac-secret".into()), Value::Bool(true)));
        }

        state.sign_count += 1;
        let mut flags = 0x01 | 0x40;
        if uv {
            flags |= 0x04;
        }
        if !ext_entries.is_empty() {
            flags |= 0x80;
        }
        let mut auth_data = auth_data_header(&rp_id, flags, state.sign_count);
        auth_data.extend_from_slice(&AAGUID);
        auth_data.extend_from_slice(&(id.len() as u16).to_be_bytes());
        auth_data.extend_from_slice(&id);
        auth_data.extend_from_slice(&cose_key);
        if !ext_entries.is_empty() {
            auth_data.extend(cbor::encode(&Value::Map(ext_entries)).unwrap());
        }

        let sig: Signature = key.sign(&[auth_data.as_slice(), &cdh].concat());
        let statement = Value::Map(vec![
            (Value::Text("alg".into()), Value::Integer(-7)),
            (Value::Text("sig".into()), Value::Bytes(sig.to_der().as_bytes().to_vec())),
        ]);

        state.credentials.push(Credential {
            id,
            rp_id,
            user,
            key,
            cred_random,
            resident,
        });

        let body = MapBuilder::new()
            .insert(0x01, "packed")
            .unwrap()
            .insert_bytes(0x02, &auth_data)
            .unwrap()
            .insert_encoded(0x03, cbor::encode(&statement).unwrap())
            .build();
        Ok(Reply::AfterTouch(ok(body)))
    }

    fn get_assertion(&self, params: &[u8]) -> Result<Reply, StatusCode> {
        let p = MapParser::from_bytes(params).map_err(|_| StatusCode::InvalidCbor)?;
        let rp_id: String = p.get(0x01).map_err(|_| StatusCode::MissingParameter)?;
        let cdh = p.get_bytes(0x02).map_err(|_| StatusCode::MissingParameter)?;
        let allow = ids_in(p.get_raw(0x03));
        let up = p.get_raw(0x05).and_then(|opts| text_entry(opts, "up")) != Some(&Value::Bool(false));

        let mut uv = false;
        if let Some(param) = p.get_bytes_opt(0x06).map_err(|_| StatusCode::CborUnexpectedType)? {
            self.check_pin_auth(&param, p.get_opt(0x07).ok().flatten(), &cdh)?;
            uv = true;
        }

        let hmac = match p.get_raw(0x04).and_then(|ext| text_entry(ext, "hmac-secret")) {
            Some(input) => Some(self.hmac_secret_input(input)?),
            None => None,
        };

        let mut state = self.state.lock().unwrap();
        let matching: Vec<usize> = state
            .credentials
            .iter()
            .enumerate()
            .filter(|(_, cred)| {
                cred.rp_id == rp_id
                    && if allow.is_empty() {
                        cred.resident
                    } else {
                        allow.contains(&cred.id)
                    }
            })
            .map(|(i, _)| i)
            .collect();
        if matching.is_empty() {
            return Err(StatusCode::NoCredentials);
        }

        let mut responses = Vec::new();
        for (n, &index) in matching.iter().enumerate() {
            state.sign_count += 1;
            let cred = &state.credentials[index];

            let mut ext_entries = Vec::new();
            if let Some((shared, salts)) = &hmac {
                let mut output = Vec::new();
                for salt in salts.chunks(32) {
                    output.extend(PinProtocol::V2.authenticate(&cred.cred_random, salt).unwrap());
                }
                let encrypted = shared.encrypt(&output).unwrap();
                ext_entries.push((Value::Text("hmac-secret".into()), Value::Bytes(encrypted)));
            }

            let mut flags = if up { 0x01 } else { 0x00 };
            if uv {
                flags |= 0x04;
            }
            if !ext_entries.is_empty() {
                flags |= 0x80;
            }
            let mut auth_data = auth_data_header(&rp_id, flags, state.sign_count);
            if !ext_entries.is_empty() {
                auth_data.extend(cbor::encode(&Value::Map(ext_entries)).unwrap());
            }
            let sig: Signature = cred.key.sign(&[auth_data.as_slice(), &cdh].concat());

            let descriptor = fido2_host_ctap::PublicKeyCredentialDescriptor::new(cred.id.clone());
            let mut body = MapBuilder::new()
                .insert(0x01, &descriptor)
                .unwrap()
                .insert_bytes(0x02, &auth_data)
                .unwrap()
                .insert_bytes(0x03, sig.to_der().as_bytes())
                .unwrap();
            if cred.resident {
                body = body.insert(0x04, &cred.user).unwrap();
            }
            if n == 0 && allow.is_empty() && matching.len() > 1 {
                body = body.insert(0x05, matching.len() as u32).unwrap();
            }
            responses.push(ok(body.build()));
        }

        let first = responses.remove(0);
        state.next_assertions = responses.into();
        Ok(if up {
            Reply::AfterTouch(first)
        } else {
            Reply::Now(first)
        })
    }

    /// Decode `{1: keyAgreement, 2: saltEnc, 3: saltAuth, 4: protocol}` into the
    /// shared secret and the decrypted salts
    fn hmac_secret_input(
        &self,
        input: &Value,
    ) -> Result<(fido2_host_crypto::SharedSecret, Vec<u8>), StatusCode> {
        let bytes = |key| match int_entry(input, key) {
            Some(Value::Bytes(bytes)) => Ok(bytes.clone()),
            _ => Err(StatusCode::MissingParameter),
        };
        let key = int_entry(input, 1).ok_or(StatusCode::MissingParameter)?;
        let coord = |label| match int_entry(key, label) {
            Some(Value::Bytes(bytes)) => Ok(bytes.clone()),
            _ => Err(StatusCode::InvalidParameter),
        };
        let (x, y) = (coord(-2)?, coord(-3)?);
        let salt_enc = bytes(2)?;
        let salt_auth = bytes(3)?;
        let version = match int_entry(input, 4) {
            Some(Value::Integer(v)) => *v as u8,
            _ => 1,
        };
        let protocol = PinProtocol::from_version(version).map_err(|_| StatusCode::InvalidParameter)?;

        let state = self.state.lock().unwrap();
        let z = state
            .key_agreement
            .shared_point_x(&x, &y)
            .map_err(|_| StatusCode::InvalidParameter)?;
        let shared = protocol.kdf(&z).unwrap();
        if shared.authenticate(&salt_enc).unwrap() != salt_auth {
            return Err(StatusCode::PinAuthInvalid);
        }
        let salts = shared.decrypt(&salt_enc).map_err(|_| StatusCode::InvalidParameter)?;
        if salts.len() != 32 && salts.len() != 64 {
            return Err(StatusCode::InvalidLength);
        }
        Ok((shared, salts))
    }

    fn get_next_assertion(&self) -> Result<Vec<u8>, StatusCode> {
        self.state
            .lock()
            .unwrap()
            .next_assertions
            .pop_front()
            .ok_or(StatusCode::NotAllowed)
    }

    fn client_pin(&self, params: &[u8]) -> Result<Vec<u8>, StatusCode> {
        let p = MapParser::from_bytes(params).map_err(|_| StatusCode::InvalidCbor)?;
        let version: u8 = p.get(0x01).map_err(|_| StatusCode::MissingParameter)?;
        let protocol = PinProtocol::from_version(version).map_err(|_| StatusCode::InvalidParameter)?;
        let sub: u8 = p.get(0x02).map_err(|_| StatusCode::MissingParameter)?;

        let mut state = self.state.lock().unwrap();
        match sub {
            0x01 => Ok(MapBuilder::new().insert(0x03, 8).unwrap().build()),
            0x02 => {
                let (x, y) = state.key_agreement.public_key_xy();
                let key = MapBuilder::new()
                    .insert(1, 2)
                    .unwrap()
                    .insert(3, -25)
                    .unwrap()
                    .insert(-1, 1)
                    .unwrap()
                    .insert_bytes(-2, &x)
                    .unwrap()
                    .insert_bytes(-3, &y)
                    .unwrap()
                    .build();
                Ok(MapBuilder::new().insert_encoded(0x01, key).build())
            }
            0x05 | 0x09 => {
                let Some(pin) = &self.config.pin else {
                    return Err(StatusCode::PinNotSet);
                };
                let key = p.get_raw(0x03).ok_or(StatusCode::MissingParameter)?;
                let coord = |label| match int_entry(key, label) {
                    Some(Value::Bytes(bytes)) => Ok(bytes.clone()),
                    _ => Err(StatusCode::InvalidParameter),
                };
                let z = state
                    .key_agreement
                    .shared_point_x(&coord(-2)?, &coord(-3)?)
                    .map_err(|_| StatusCode::InvalidParameter)?;
                let shared = protocol.kdf(&z).unwrap();

                let pin_hash_enc = p.get_bytes(0x06).map_err(|_| StatusCode::MissingParameter)?;
                let decrypted = shared.decrypt(&pin_hash_enc).map_err(|_| StatusCode::PinInvalid)?;
                if decrypted != pin_hash(pin) {
                    return Err(StatusCode::PinInvalid);
                }

                if sub == 0x09 {
                    state.last_permissions = Some(p.get(0x09).map_err(|_| StatusCode::MissingParameter)?);
                }
                let token = shared.encrypt(&state.pin_token).unwrap();
                Ok(MapBuilder::new().insert_bytes(0x02, &token).unwrap().build())
            }
            _ => Err(StatusCode::InvalidSubcommand),
        }
    }
}

fn ok(body: Vec<u8>) -> Vec<u8> {
    let mut frame = vec![0x00];
    frame.extend(body);
    frame
}

fn auth_data_header(rp_id: &str, flags: u8, sign_count: u32) -> Vec<u8> {
    let mut data = Sha256::digest(rp_id.as_bytes()).to_vec();
    data.push(flags);
    data.extend_from_slice(&sign_count.to_be_bytes());
    data
}

/// Credential IDs in an allow or exclude list
fn ids_in(list: Option<&Value>) -> Vec<Vec<u8>> {
    match list {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match text_entry(item, "id") {
                Some(Value::Bytes(id)) => Some(id.clone()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Command parked until the simulated touch
struct Pending {
    cid: u32,
    frame: Vec<u8>,
    ready_at: Option<Instant>,
    next_keepalive: Instant,
    cancelled: bool,
}

/// One open handle on a [`SimAuthenticator`]
pub struct SimConnection {
    auth: Arc<SimAuthenticator>,
    inbound: Vec<Packet>,
    outbound: VecDeque<Packet>,
    pending: Option<Pending>,
    closed: bool,
}

impl SimConnection {
    fn reply(&mut self, cid: u32, cmd: Cmd, data: Vec<u8>) {
        let packets = Message::new(cid, cmd, data).to_packets().unwrap();
        self.outbound.extend(packets);
    }

    fn dispatch(&mut self, message: Message) {
        match message.cmd {
            Cmd::Init => {
                // Resynchronisation abandons whatever was in flight
                if self.pending.take().is_some() {
                    self.auth.waiting_for_touch.store(false, Ordering::SeqCst);
                }
                let cid = self.auth.allocate_cid();
                let mut data = message.data.clone();
                data.truncate(8);
                data.extend_from_slice(&cid.to_be_bytes());
                // protocol 2, device 1.0.0, WINK | CBOR
                data.extend_from_slice(&[2, 1, 0, 0, 0x01 | 0x04]);
                self.reply(message.cid, Cmd::Init, data);
            }
            Cmd::Cancel => {
                self.auth.cancels.fetch_add(1, Ordering::SeqCst);
                if let Some(pending) = self.pending.as_mut()
                    && pending.cid == message.cid
                {
                    match self.auth.config.cancel_reply {
                        CancelReply::Acknowledge => pending.cancelled = true,
                        CancelReply::Ignore => {}
                        CancelReply::Success => pending.ready_at = Some(Instant::now()),
                    }
                }
            }
            Cmd::Cbor if self.pending.is_some() => {
                self.reply(message.cid, Cmd::Error, vec![0x06]);
            }
            Cmd::Cbor => match self.auth.handle_cbor(&message.data) {
                Reply::Now(frame) => self.reply(message.cid, Cmd::Cbor, frame),
                Reply::AfterTouch(frame) => {
                    let now = Instant::now();
                    self.pending = Some(Pending {
                        cid: message.cid,
                        frame,
                        ready_at: self.auth.touch_after.lock().unwrap().map(|delay| now + delay),
                        next_keepalive: now,
                        cancelled: false,
                    });
                    self.auth.waiting_for_touch.store(true, Ordering::SeqCst);
                }
            },
            Cmd::Wink => self.reply(message.cid, Cmd::Wink, Vec::new()),
            Cmd::Ping => self.reply(message.cid, Cmd::Ping, message.data),
            _ => self.reply(message.cid, Cmd::Error, vec![0x01]),
        }
    }

    /// Move a parked command along: keepalive, final frame, or cancel ack
    fn advance(&mut self) {
        let Some(mut pending) = self.pending.take() else {
            return;
        };
        let now = Instant::now();

        if pending.cancelled {
            self.reply(pending.cid, Cmd::Cbor, vec![StatusCode::KeepaliveCancel.to_u8()]);
        } else if pending.ready_at.is_some_and(|at| now >= at) {
            let frame = match self.auth.config.deny_with {
                Some(status) => vec![status.to_u8()],
                None => std::mem::take(&mut pending.frame),
            };
            self.reply(pending.cid, Cmd::Cbor, frame);
        } else {
            if self.auth.config.keepalives && now >= pending.next_keepalive {
                self.reply(pending.cid, Cmd::Keepalive, vec![KEEPALIVE_UP_NEEDED]);
                pending.next_keepalive = now + KEEPALIVE_INTERVAL;
            }
            self.pending = Some(pending);
            return;
        }
        self.auth.waiting_for_touch.store(false, Ordering::SeqCst);
    }
}

impl HidConnection for SimConnection {
    fn write_packet(&mut self, packet: &Packet) -> HidResult<()> {
        if self.closed {
            return Err(HidError::Io("connection closed".to_string()));
        }
        if packet.is_init() {
            self.inbound.clear();
        } else if self.inbound.is_empty() {
            return Ok(());
        }
        self.inbound.push(packet.clone());

        let total = usize::from(self.inbound[0].payload_len().unwrap_or(0));
        if INIT_DATA + CONT_DATA * (self.inbound.len() - 1) < total {
            return Ok(());
        }
        let message = Message::from_packets(&std::mem::take(&mut self.inbound))?;
        self.dispatch(message);
        Ok(())
    }

    fn read_packet(&mut self, timeout: Duration) -> HidResult<Option<Packet>> {
        if self.closed {
            return Err(HidError::Io("connection closed".to_string()));
        }
        let deadline = Instant::now() + timeout;
        loop {
            self.advance();
            if let Some(packet) = self.outbound.pop_front() {
                return Ok(Some(packet));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep((deadline - now).min(Duration::from_millis(2)));
        }
    }

    fn close(&mut self) {
        self.closed = true;
        if self.pending.take().is_some() {
            self.auth.waiting_for_touch.store(false, Ordering::SeqCst);
        }
    }
}

/// Backend holding any number of simulated authenticators
#[derive(Clone, Default)]
pub struct SimBackend {
    devices: Arc<Mutex<Vec<(DeviceLocation, Arc<SimAuthenticator>)>>>,
}

impl SimBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend with a single device at `path`
    pub fn single(path: &str, config: SimConfig) -> (Self, Arc<SimAuthenticator>) {
        let backend = Self::new();
        let auth = backend.add(path, config);
        (backend, auth)
    }

    pub fn add(&self, path: &str, config: SimConfig) -> Arc<SimAuthenticator> {
        let auth = Arc::new(SimAuthenticator::new(config));
        let location = DeviceLocation {
            path: path.to_string(),
            vendor_id: 0x1209,
            product_id: 0xF1D0,
            manufacturer: Some("fido2-host".to_string()),
            product: Some("Simulated Authenticator".to_string()),
            serial_number: None,
        };
        self.devices
            .lock()
            .unwrap()
            .push((location, Arc::clone(&auth)));
        auth
    }

    pub fn remove(&self, path: &str) {
        self.devices.lock().unwrap().retain(|(loc, _)| loc.path != path);
    }
}

impl HidBackend for SimBackend {
    fn enumerate(&self) -> HidResult<Vec<DeviceLocation>> {
        Ok(self
            .devices
            .lock()
            .unwrap()
            .iter()
            .map(|(loc, _)| loc.clone())
            .collect())
    }

    fn open(&self, path: &str) -> HidResult<Box<dyn HidConnection>> {
        let devices = self.devices.lock().unwrap();
        let (_, auth) = devices
            .iter()
            .find(|(loc, _)| loc.path == path)
            .ok_or_else(|| HidError::NotFound(path.to_string()))?;
        Ok(Box::new(SimConnection {
            auth: Arc::clone(auth),
            inbound: Vec::new(),
            outbound: VecDeque::new(),
            pending: None,
            closed: false,
        }))
    }
}
