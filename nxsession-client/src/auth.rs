//! Login and the two-factor sub-protocol.

use crate::config::TimeoutCategory;
use crate::correlation::check_completion;
use crate::error::SessionError;
use crate::session::{LoginInfo, SessionInner};
use ed25519_dalek::{Signer, SigningKey};
use nxsession_protocol::codes::*;
use nxsession_protocol::{Frame, ResultCode};
use std::fmt;
use std::sync::Arc;

/// How the session authenticates.
#[derive(Clone)]
pub enum Credentials {
    Password {
        login: String,
        password: String,
    },
    /// Signs the server's challenge with `signing_key`; `certificate` is
    /// the encoded certificate the server checks the signature against.
    Certificate {
        login: String,
        signing_key: SigningKey,
        certificate: Vec<u8>,
    },
    /// A reusable token issued by an earlier login.
    Token(String),
}

impl Credentials {
    pub fn password(login: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials::Password {
            login: login.into(),
            password: password.into(),
        }
    }

    pub fn login_name(&self) -> Option<&str> {
        match self {
            Credentials::Password { login, .. } | Credentials::Certificate { login, .. } => {
                Some(login)
            }
            Credentials::Token(_) => None,
        }
    }

    fn apply(&self, frame: &mut Frame, challenge: Option<&[u8]>) -> Result<(), SessionError> {
        match self {
            Credentials::Password { login, password } => {
                frame.set(VID_AUTH_TYPE, AUTH_TYPE_PASSWORD);
                frame.set(VID_LOGIN_NAME, login.as_str());
                frame.set(VID_PASSWORD, password.as_str());
            }
            Credentials::Certificate {
                login,
                signing_key,
                certificate,
            } => {
                let challenge = challenge
                    .ok_or_else(|| SessionError::Auth("server sent no challenge".into()))?;
                let signature = signing_key.sign(challenge);
                frame.set(VID_AUTH_TYPE, AUTH_TYPE_CERTIFICATE);
                frame.set(VID_LOGIN_NAME, login.as_str());
                frame.set(VID_SIGNATURE, signature.to_bytes().to_vec());
                frame.set(VID_CERTIFICATE, certificate.clone());
            }
            Credentials::Token(token) => {
                frame.set(VID_AUTH_TYPE, AUTH_TYPE_TOKEN);
                frame.set(VID_AUTH_TOKEN, token.as_str());
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Password { login, .. } => write!(f, "Password({})", login),
            Credentials::Certificate { login, .. } => write!(f, "Certificate({})", login),
            Credentials::Token(_) => f.write_str("Token"),
        }
    }
}

/// Challenge presented for the selected second factor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwoFactorChallenge {
    pub method: String,
    pub challenge: Option<String>,
    /// Label for a QR code to show the user, if the method uses one.
    pub qr_label: Option<String>,
}

/// Drives the second authentication step. Called on the connecting
/// task, never on the reader.
pub trait TwoFactorHandler: Send + Sync {
    /// Picks a method by index, or `None` to give up.
    fn select_method(&self, methods: &[String]) -> Option<usize>;

    /// Produces the user's response, or `None` to give up.
    fn challenge_response(&self, challenge: &TwoFactorChallenge) -> Option<String>;

    /// Token from an earlier "trust this device" login.
    fn trusted_device_token(&self) -> Option<Vec<u8>> {
        None
    }

    fn trust_this_device(&self) -> bool {
        false
    }

    fn save_trusted_device_token(&self, _token: &[u8]) {}
}

/// Sends `CMD_LOGIN` and completes the second factor when requested.
pub(crate) async fn login(
    inner: &Arc<SessionInner>,
    credentials: &Credentials,
    two_factor: Option<&dyn TwoFactorHandler>,
) -> Result<LoginInfo, SessionError> {
    let challenge = inner.server_info().challenge;
    let mut request = Frame::new(CMD_LOGIN)
        .with_field(VID_CLIENT_INFO, inner.config.client_info.as_str())
        .with_field(VID_OS_INFO, os_info())
        .with_field(VID_CLIENT_TYPE, inner.config.client_type);
    credentials.apply(&mut request, challenge.as_deref())?;
    if let Some(token) = two_factor.and_then(|h| h.trusted_device_token()) {
        request.set(VID_TRUSTED_DEVICE_TOKEN, token);
    }

    let reply = inner
        .request(request, CMD_LOGIN_RESPONSE, TimeoutCategory::Command)
        .await?;
    let rcc = ResultCode::from_u32(reply.get_u32(VID_RCC).unwrap_or(0));

    let reply = if rcc == ResultCode::NeedSecondFactor {
        let handler = two_factor.ok_or_else(|| {
            SessionError::Auth("server requires a second factor but no handler is set".into())
        })?;
        second_factor(inner, &reply, handler).await?
    } else {
        check_completion(reply)?
    };

    let info = LoginInfo::from_frame(&reply);
    tracing::info!(
        "logged in as {} (user id {}, session {})",
        credentials.login_name().unwrap_or("<token>"),
        info.user_id,
        info.session_id
    );
    Ok(info)
}

async fn second_factor(
    inner: &Arc<SessionInner>,
    login_reply: &Frame,
    handler: &dyn TwoFactorHandler,
) -> Result<Frame, SessionError> {
    let count = login_reply.get_u32(VID_2FA_METHOD_COUNT).unwrap_or(0);
    let methods: Vec<String> = (0..count)
        .filter_map(|i| login_reply.get_str(VID_2FA_METHOD_LIST_BASE + i))
        .collect();
    if methods.is_empty() {
        return Err(SessionError::Auth("no second factor methods available".into()));
    }

    let index = handler
        .select_method(&methods)
        .filter(|i| *i < methods.len())
        .ok_or_else(|| SessionError::Auth("second factor method selection cancelled".into()))?;
    let method = methods[index].clone();
    tracing::debug!("using second factor method {}", method);

    let prepare = Frame::new(CMD_2FA_PREPARE_CHALLENGE).with_field(VID_2FA_METHOD, method.as_str());
    let prepared = inner
        .request_completion(prepare, TimeoutCategory::Command)
        .await?;
    let challenge = TwoFactorChallenge {
        method,
        challenge: prepared.get_str(VID_CHALLENGE_TEXT),
        qr_label: prepared.get_str(VID_QR_LABEL),
    };

    let response = handler
        .challenge_response(&challenge)
        .ok_or_else(|| SessionError::Auth("second factor response cancelled".into()))?;
    let trust = handler.trust_this_device();
    let validate = Frame::new(CMD_2FA_VALIDATE_RESPONSE)
        .with_field(VID_2FA_RESPONSE, response)
        .with_field(VID_TRUST_THIS_DEVICE, trust);
    let reply = inner
        .request(validate, CMD_LOGIN_RESPONSE, TimeoutCategory::Command)
        .await
        .and_then(check_completion)?;

    if let Some(token) = reply.get_bytes(VID_TRUSTED_DEVICE_TOKEN) {
        handler.save_trusted_device_token(&token);
    }
    Ok(reply)
}

/// Requests a reusable token for re-authentication after reconnects.
pub(crate) async fn request_auth_token(inner: &Arc<SessionInner>) -> Result<String, SessionError> {
    let reply = inner
        .request_completion(Frame::new(CMD_REQUEST_AUTH_TOKEN), TimeoutCategory::Command)
        .await?;
    reply
        .get_str(VID_AUTH_TOKEN)
        .ok_or(SessionError::Protocol(nxsession_protocol::ProtocolError::MissingField(
            VID_AUTH_TOKEN,
        )))
}

fn os_info() -> String {
    format!("{} {}", std::env::consts::OS, std::env::consts::ARCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, Verifier};

    #[test]
    fn test_password_fields() {
        let mut frame = Frame::new(CMD_LOGIN);
        Credentials::password("admin", "s3cret").apply(&mut frame, None).unwrap();
        assert_eq!(frame.get_u16(VID_AUTH_TYPE), Some(AUTH_TYPE_PASSWORD));
        assert_eq!(frame.get_str(VID_LOGIN_NAME).as_deref(), Some("admin"));
        assert_eq!(frame.get_str(VID_PASSWORD).as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_certificate_signs_challenge() {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let verifying = key.verifying_key();
        let credentials = Credentials::Certificate {
            login: "ops".into(),
            signing_key: key,
            certificate: b"CERT".to_vec(),
        };

        let mut frame = Frame::new(CMD_LOGIN);
        credentials.apply(&mut frame, Some(b"nonce-123")).unwrap();
        let sig_bytes = frame.get_bytes(VID_SIGNATURE).unwrap();
        let signature = Signature::from_slice(&sig_bytes).unwrap();
        assert!(verifying.verify(b"nonce-123", &signature).is_ok());
        assert_eq!(frame.get_bytes(VID_CERTIFICATE).unwrap().as_ref(), b"CERT");
    }

    #[test]
    fn test_certificate_needs_challenge() {
        let credentials = Credentials::Certificate {
            login: "ops".into(),
            signing_key: SigningKey::from_bytes(&[1u8; 32]),
            certificate: Vec::new(),
        };
        let result = credentials.apply(&mut Frame::new(CMD_LOGIN), None);
        assert!(matches!(result, Err(SessionError::Auth(_))));
    }

    #[test]
    fn test_debug_hides_secrets() {
        let text = format!("{:?}", Credentials::password("admin", "s3cret"));
        assert!(!text.contains("s3cret"));
        assert_eq!(format!("{:?}", Credentials::Token("abc".into())), "Token");
    }
}
