//! Open authenticator handle
//!
//! A [`Device`] owns the HID link behind a mutex that doubles as the
//! device's single command slot: every operation holds it for its whole
//! duration, so a second command waits rather than interleaving. The
//! operation's [`CancelToken`] is published in a separate slot that
//! [`Device::cancel`] and [`Device::close`] reach without the link lock.

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::info::AuthenticatorInfo;
use crate::pin::{PinUvAuthToken, get_pin_token, key_agreement, permission};
use crate::request::{
    AssertionOptions, ClientDataHash, MakeCredentialExtensionsWire, MakeCredentialOptions,
    OptionsWire,
};
use crate::response::{Assertion, Attestation};
use crate::session::{CancelToken, CommandSession, KeepaliveObserver};
use crate::touch::TouchHandle;
use crate::transport::HidLink;

use fido2_host_crypto::{PinProtocol, SharedSecret};
use fido2_host_ctap::cbor::{self, MapBuilder, Value};
use fido2_host_ctap::{
    CoseAlgorithm, CtapCommand, PublicKeyCredentialDescriptor, PublicKeyCredentialParameters,
    RelyingParty, StatusCode, User, decode_response, encode_command,
};
use fido2_host_transport::{Capabilities, Cmd, DeviceLocation};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Statuses that prove a touch happened during the presence probe
const TOUCH_STATUSES: [StatusCode; 4] = [
    StatusCode::PinAuthInvalid,
    StatusCode::PinInvalid,
    StatusCode::PinNotSet,
    StatusCode::UpRequired,
];

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Protocol family a device speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Fido2,
    /// CTAP1 only
    U2f,
}

struct Shared {
    location: DeviceLocation,
    config: ClientConfig,
    link: Mutex<Option<HidLink>>,
    /// Token of the operation holding `link`, if any
    current: Mutex<Option<CancelToken>>,
    closed: AtomicBool,
    info: Mutex<Option<AuthenticatorInfo>>,
    observer: Mutex<Option<Arc<dyn KeepaliveObserver>>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let link = self.link.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut link) = link.take() {
            link.close();
        }
    }
}

/// Handle to one opened authenticator
///
/// Clones share the same link, so one thread can [`cancel`](Self::cancel)
/// an operation another thread is blocked in.
#[derive(Clone)]
pub struct Device {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("path", &self.shared.location.path)
            .field("closed", &self.shared.closed.load(Ordering::SeqCst))
            .finish()
    }
}

/// One command after another on a locked link, sharing a token and deadline
pub(crate) struct Exchange<'a> {
    link: &'a mut HidLink,
    config: &'a ClientConfig,
    token: &'a CancelToken,
    observer: Option<&'a dyn KeepaliveObserver>,
    deadline: Instant,
}

impl Exchange<'_> {
    /// Run one CTAP2 command, turning a nonzero status into `Error::Device`
    pub(crate) fn cbor(&mut self, cmd: CtapCommand, params: Option<&[u8]>) -> Result<Option<Value>> {
        let request = encode_command(cmd, params);
        let mut session = CommandSession::new(self.link, self.config, self.token, self.deadline)
            .with_observer(self.observer);
        let frame = session.transact(Cmd::Cbor, &request)?;
        tracing::trace!(%cmd, state = ?session.state(), "command finished");

        let response = decode_response(&frame)?;
        if !response.is_success() {
            let status = StatusCode::from_u8(response.status);
            tracing::debug!(%cmd, %status, "authenticator returned error");
            return Err(Error::Device(status));
        }
        Ok(response.body)
    }

    /// Run a bare CTAPHID command
    fn hid(&mut self, cmd: Cmd, payload: &[u8]) -> Result<Vec<u8>> {
        CommandSession::new(self.link, self.config, self.token, self.deadline).transact(cmd, payload)
    }

    fn capabilities(&mut self) -> Result<Capabilities> {
        self.link.capabilities(self.config)
    }

    fn info(&mut self) -> Result<AuthenticatorInfo> {
        let body = self
            .cbor(CtapCommand::GetInfo, None)?
            .ok_or_else(|| Error::Protocol("empty GetInfo response".to_string()))?;
        AuthenticatorInfo::from_value(body)
    }
}

/// hmac-secret input and the key agreement its output is encrypted under
struct HmacSecretRequest {
    extension: Vec<u8>,
    shared: SharedSecret,
}

impl Device {
    pub(crate) fn new(link: HidLink, config: ClientConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                location: link.location().clone(),
                config,
                link: Mutex::new(Some(link)),
                current: Mutex::new(None),
                closed: AtomicBool::new(false),
                info: Mutex::new(None),
                observer: Mutex::new(None),
            }),
        }
    }

    pub fn path(&self) -> &str {
        &self.shared.location.path
    }

    pub fn location(&self) -> &DeviceLocation {
        &self.shared.location
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Receive keepalive statuses of every later operation (touch prompts, say)
    pub fn on_keepalive(&self, observer: impl KeepaliveObserver + 'static) {
        *lock(&self.shared.observer) = Some(Arc::new(observer));
    }

    /// Hold the command slot for the duration of `f`
    fn exchange<T>(
        &self,
        token: CancelToken,
        timeout: Option<Duration>,
        f: impl FnOnce(&mut Exchange<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut guard = lock(&self.shared.link);
        let link = guard.as_mut().ok_or(Error::Closed)?;

        *lock(&self.shared.current) = Some(token.clone());
        // close() may have run between taking the link and publishing the token
        if self.is_closed() {
            token.cancel();
        }

        let observer = lock(&self.shared.observer).clone();
        let config = &self.shared.config;
        let deadline = Instant::now() + timeout.unwrap_or(config.operation_timeout);
        let mut exchange = Exchange {
            link,
            config,
            token: &token,
            observer: observer.as_deref(),
            deadline,
        };
        let result = f(&mut exchange);

        let mut current = lock(&self.shared.current);
        if current.as_ref().is_some_and(|t| t.same_as(&token)) {
            *current = None;
        }
        result
    }

    fn refresh_info(&self, ex: &mut Exchange<'_>) -> Result<AuthenticatorInfo> {
        let info = ex.info()?;
        *lock(&self.shared.info) = Some(info.clone());
        Ok(info)
    }

    /// True if the device speaks CTAP2 (CTAPHID_CBOR capability)
    ///
    /// Allocates the HID channel if that has not happened yet.
    pub fn is_fido2(&self) -> Result<bool> {
        self.exchange(CancelToken::new(), None, |ex| {
            Ok(ex.capabilities()?.contains(Capabilities::CBOR))
        })
    }

    pub fn device_type(&self) -> Result<DeviceType> {
        Ok(if self.is_fido2()? {
            DeviceType::Fido2
        } else {
            DeviceType::U2f
        })
    }

    /// Query authenticatorGetInfo
    ///
    /// Every call asks the device again; back-to-back calls each run
    /// their own fully drained command.
    #[tracing::instrument(skip_all, fields(path = %self.path()))]
    pub fn info(&self) -> Result<AuthenticatorInfo> {
        self.exchange(CancelToken::new(), None, |ex| self.refresh_info(ex))
    }

    /// The GetInfo result from the most recent operation, if any ran
    pub fn last_info(&self) -> Option<AuthenticatorInfo> {
        lock(&self.shared.info).clone()
    }

    /// Blink the device's LED (CTAPHID_WINK)
    pub fn wink(&self) -> Result<()> {
        self.exchange(CancelToken::new(), None, |ex| {
            if !ex.capabilities()?.contains(Capabilities::WINK) {
                return Err(Error::Unsupported("wink"));
            }
            ex.hid(Cmd::Wink, &[])?;
            Ok(())
        })
    }

    /// Create a credential
    ///
    /// Blocks until the user touches the device, the operation is
    /// cancelled, or the deadline passes. With a `pin`, a PIN/UV auth
    /// token is obtained first and the request carries pinUvAuthParam.
    #[tracing::instrument(skip_all, fields(path = %self.path(), rp = %rp.id))]
    pub fn make_credential(
        &self,
        client_data_hash: &ClientDataHash,
        rp: &RelyingParty,
        user: &User,
        algorithm: CoseAlgorithm,
        pin: Option<&str>,
        options: &MakeCredentialOptions,
    ) -> Result<Attestation> {
        self.exchange(CancelToken::new(), options.timeout, |ex| {
            let info = self.refresh_info(ex)?;
            if options.extensions.hmac_secret && !info.supports_extension("hmac-secret") {
                return Err(Error::Unsupported("hmac-secret"));
            }
            let token = pin
                .map(|pin| {
                    get_pin_token(ex, &info, pin, permission::MAKE_CREDENTIAL, Some(&rp.id))
                })
                .transpose()?;

            let mut params = MapBuilder::new()
                .insert_bytes(0x01, client_data_hash.as_slice())?
                .insert(0x02, rp)?
                .insert(0x03, user)?
                .insert(0x04, [PublicKeyCredentialParameters::new(algorithm)])?;
            if !options.exclude_list.is_empty() {
                let exclude: Vec<_> = options
                    .exclude_list
                    .iter()
                    .map(|id| PublicKeyCredentialDescriptor::new(id.clone()))
                    .collect();
                params = params.insert(0x05, exclude)?;
            }
            if !options.extensions.is_empty() {
                params = params.insert(0x06, MakeCredentialExtensionsWire::from(&options.extensions))?;
            }
            let flags = OptionsWire {
                rk: options.rk.as_bool(),
                up: None,
                uv: options.uv.as_bool(),
            };
            if !flags.is_empty() {
                params = params.insert(0x07, flags)?;
            }
            params = with_auth_param(params, token.as_ref(), client_data_hash, 0x08)?;

            let body = ex
                .cbor(CtapCommand::MakeCredential, Some(&params.build()))?
                .ok_or_else(|| Error::Protocol("empty MakeCredential response".to_string()))?;
            let attestation = Attestation::from_value(body)?;
            tracing::debug!(
                fmt = %attestation.format,
                alg = attestation.algorithm,
                "credential created"
            );
            Ok(attestation)
        })
    }

    /// Get one assertion
    ///
    /// When several discoverable credentials match, the first is returned;
    /// [`get_assertions`](Self::get_assertions) fetches all of them.
    #[tracing::instrument(skip_all, fields(path = %self.path(), rp = rp_id))]
    pub fn get_assertion(
        &self,
        rp_id: &str,
        client_data_hash: &ClientDataHash,
        allow_list: &[Vec<u8>],
        pin: Option<&str>,
        options: &AssertionOptions,
    ) -> Result<Assertion> {
        options.validate()?;
        self.exchange(CancelToken::new(), options.timeout, |ex| {
            let (assertion, _) =
                self.first_assertion(ex, rp_id, client_data_hash, allow_list, pin, options)?;
            Ok(assertion)
        })
    }

    /// Get every matching assertion, following up with GetNextAssertion
    #[tracing::instrument(skip_all, fields(path = %self.path(), rp = rp_id))]
    pub fn get_assertions(
        &self,
        rp_id: &str,
        client_data_hash: &ClientDataHash,
        allow_list: &[Vec<u8>],
        pin: Option<&str>,
        options: &AssertionOptions,
    ) -> Result<Vec<Assertion>> {
        options.validate()?;
        self.exchange(CancelToken::new(), options.timeout, |ex| {
            let (first, shared) =
                self.first_assertion(ex, rp_id, client_data_hash, allow_list, pin, options)?;
            let count = first.number_of_credentials.unwrap_or(1).max(1);

            let mut assertions = Vec::with_capacity(count as usize);
            assertions.push(first);
            for _ in 1..count {
                let body = ex
                    .cbor(CtapCommand::GetNextAssertion, None)?
                    .ok_or_else(|| Error::Protocol("empty GetNextAssertion response".to_string()))?;
                assertions.push(Assertion::from_value(body, allow_list, shared.as_ref())?);
            }
            Ok(assertions)
        })
    }

    fn first_assertion(
        &self,
        ex: &mut Exchange<'_>,
        rp_id: &str,
        client_data_hash: &ClientDataHash,
        allow_list: &[Vec<u8>],
        pin: Option<&str>,
        options: &AssertionOptions,
    ) -> Result<(Assertion, Option<SharedSecret>)> {
        let info = self.refresh_info(ex)?;
        let hmac = match &options.hmac_salt {
            Some(salt) => Some(hmac_secret_request(ex, &info, salt)?),
            None => None,
        };
        let token = pin
            .map(|pin| get_pin_token(ex, &info, pin, permission::GET_ASSERTION, Some(rp_id)))
            .transpose()?;

        let mut params = MapBuilder::new()
            .insert(0x01, rp_id)?
            .insert_bytes(0x02, client_data_hash.as_slice())?;
        if !allow_list.is_empty() {
            let allow: Vec<_> = allow_list
                .iter()
                .map(|id| PublicKeyCredentialDescriptor::new(id.clone()))
                .collect();
            params = params.insert(0x03, allow)?;
        }
        let (extension, shared) = match hmac {
            Some(HmacSecretRequest { extension, shared }) => (Some(extension), Some(shared)),
            None => (None, None),
        };
        if let Some(extension) = extension {
            params = params.insert_encoded(0x04, extension);
        }
        let flags = OptionsWire {
            rk: None,
            up: options.up.as_bool(),
            uv: options.uv.as_bool(),
        };
        if !flags.is_empty() {
            params = params.insert(0x05, flags)?;
        }
        params = with_auth_param(params, token.as_ref(), client_data_hash, 0x06)?;

        let body = ex
            .cbor(CtapCommand::GetAssertion, Some(&params.build()))?
            .ok_or_else(|| Error::Protocol("empty GetAssertion response".to_string()))?;
        let assertion = Assertion::from_value(body, allow_list, shared.as_ref())?;
        tracing::debug!(
            count = ?assertion.number_of_credentials,
            hmac_secret = assertion.hmac_secret.is_some(),
            "assertion received"
        );
        Ok((assertion, shared))
    }

    /// Wait for a touch on a background thread
    pub fn begin_touch(&self) -> Result<TouchHandle> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        TouchHandle::spawn(self.clone())
    }

    /// Presence probe run by the touch thread
    ///
    /// A throwaway MakeCredential the authenticator can only finish once
    /// touched. Devices with a PIN or built-in UV get an empty
    /// pinUvAuthParam, which they answer after the touch with a PIN error.
    pub(crate) fn touch_probe(&self, token: CancelToken) -> Result<()> {
        self.exchange(token, None, |ex| {
            let info = self.refresh_info(ex)?;
            let client_data_hash: [u8; 32] = rand::random();

            let mut params = MapBuilder::new()
                .insert_bytes(0x01, &client_data_hash)?
                .insert(0x02, RelyingParty::new(".dummy"))?
                .insert(0x03, User::new(b"dummy".to_vec()).with_name("dummy"))?
                .insert(0x04, [PublicKeyCredentialParameters::new(CoseAlgorithm::ES256)])?;
            if info.has_pin() || info.has_uv() {
                params = params
                    .insert_bytes(0x08, &[])?
                    .insert(0x09, info.preferred_pin_protocol().version())?;
            }

            match ex.cbor(CtapCommand::MakeCredential, Some(&params.build())) {
                Ok(_) => Ok(()),
                Err(Error::Device(status)) if TOUCH_STATUSES.contains(&status) => {
                    tracing::trace!(%status, "touch probe answered");
                    Ok(())
                }
                Err(err) => Err(err),
            }
        })
    }

    /// Signal the operation currently running on this device
    ///
    /// Does nothing when no operation is outstanding. The interrupted call
    /// returns `Error::Cancelled` once the device acknowledges, unless its
    /// result was already on the way.
    pub fn cancel(&self) {
        if let Some(token) = lock(&self.shared.current).as_ref() {
            tracing::debug!(path = %self.path(), "cancel requested");
            token.cancel();
        }
    }

    /// Release the device
    ///
    /// An outstanding operation is cancelled and drained first; the path
    /// can be opened again as soon as this returns. Closing twice is fine.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel();
        if let Some(mut link) = lock(&self.shared.link).take() {
            link.close();
        }
    }
}

/// Attach pinUvAuthParam (at `key`) and its protocol (at `key + 1`)
fn with_auth_param(
    params: MapBuilder,
    token: Option<&PinUvAuthToken>,
    client_data_hash: &ClientDataHash,
    key: i32,
) -> Result<MapBuilder> {
    let Some(token) = token else {
        return Ok(params);
    };
    let param = token.authenticate(client_data_hash.as_slice())?;
    Ok(params
        .insert_bytes(key, &param)?
        .insert(key + 1, token.protocol().version())?)
}

/// Build `{"hmac-secret": {1: keyAgreement, 2: saltEnc, 3: saltAuth[, 4: protocol]}}`
fn hmac_secret_request(
    ex: &mut Exchange<'_>,
    info: &AuthenticatorInfo,
    salt: &[u8],
) -> Result<HmacSecretRequest> {
    if !info.supports_extension("hmac-secret") {
        return Err(Error::Unsupported("hmac-secret"));
    }

    let protocol = info.preferred_pin_protocol();
    let agreement = key_agreement(ex, protocol)?;
    let salt_enc = agreement.shared.encrypt(salt)?;
    let salt_auth = agreement.shared.authenticate(&salt_enc)?;

    let mut inner = MapBuilder::new()
        .insert_encoded(0x01, agreement.platform_key)
        .insert_bytes(0x02, &salt_enc)?
        .insert_bytes(0x03, &salt_auth)?;
    if protocol == PinProtocol::V2 {
        inner = inner.insert(0x04, protocol.version())?;
    }

    let mut extension = vec![0xA1];
    extension.extend(cbor::encode(&"hmac-secret")?);
    extension.extend(inner.build());

    Ok(HmacSecretRequest {
        extension,
        shared: agreement.shared,
    })
}
