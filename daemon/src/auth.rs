//! Authentication handshake relay
//!
//! The agent never performs NTLM / Kerberos itself: it keeps one
//! [`AuthSession`] per token and drives an [`AuthProvider`] context one leg at a
//! time. Provider calls are synchronous and run on the blocking pool.

use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use wsrelay_protocol::{
    AuthStepReply, CommandType, KerberosRequest, MaterialReply, NtlmAuthRequest,
    NtlmChallengeRequest, Payload, WireError,
};

/// Security status codes, as signed 32-bit values on the wire
pub mod status {
    pub const SEC_E_OK: i32 = 0;
    pub const SEC_I_CONTINUE_NEEDED: i32 = 0x0009_0312;
    pub const SEC_E_INVALID_HANDLE: i32 = 0x8009_0301_u32 as i32;
    pub const SEC_E_UNSUPPORTED_FUNCTION: i32 = 0x8009_0302_u32 as i32;
    pub const SEC_E_NO_CREDENTIALS: i32 = 0x8009_030E_u32 as i32;
    /// Generic failure not coming from the provider
    pub const GENERIC: i32 = -1;
}

/// A failed provider call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (status {status:#010x})")]
pub struct AuthFailure {
    pub status: i32,
    pub message: String,
}

impl AuthFailure {
    pub fn new(status: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Output of one handshake leg
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthStep {
    /// `SEC_E_OK` when complete, `SEC_I_CONTINUE_NEEDED` when another leg follows
    pub status: i32,
    pub context_attributes: i64,
    pub token: Vec<u8>,
}

/// Security package selected for a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Package {
    Ntlm,
    Kerberos,
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ntlm => f.write_str("NTLM"),
            Self::Kerberos => f.write_str("Kerberos"),
        }
    }
}

/// One provider-side security context (credentials + context handle)
pub trait AuthContext: Send {
    fn acquire_credentials(
        &mut self,
        package: Package,
        username: Option<&str>,
        credential_usage: i64,
    ) -> Result<(), AuthFailure>;

    /// Advance the handshake; `input` is `None` on the first leg
    fn step(
        &mut self,
        target: Option<&str>,
        context_attributes: i64,
        input: Option<&[u8]>,
    ) -> Result<AuthStep, AuthFailure>;

    fn session_key(&mut self) -> Result<Vec<u8>, AuthFailure>;

    /// Sealed message exposing the context's sequence material
    fn sequence(&mut self) -> Result<Vec<u8>, AuthFailure>;
}

/// Platform capability that creates security contexts
pub trait AuthProvider: Send + Sync {
    fn open_context(&self) -> Box<dyn AuthContext>;
}

/// Provider used where no platform security package is available
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedProvider;

struct UnsupportedContext;

fn unsupported() -> AuthFailure {
    AuthFailure::new(
        status::SEC_E_UNSUPPORTED_FUNCTION,
        "Security provider not available on this platform",
    )
}

impl AuthContext for UnsupportedContext {
    fn acquire_credentials(&mut self, _: Package, _: Option<&str>, _: i64) -> Result<(), AuthFailure> {
        Err(unsupported())
    }

    fn step(&mut self, _: Option<&str>, _: i64, _: Option<&[u8]>) -> Result<AuthStep, AuthFailure> {
        Err(unsupported())
    }

    fn session_key(&mut self) -> Result<Vec<u8>, AuthFailure> {
        Err(unsupported())
    }

    fn sequence(&mut self) -> Result<Vec<u8>, AuthFailure> {
        Err(unsupported())
    }
}

impl AuthProvider for UnsupportedProvider {
    fn open_context(&self) -> Box<dyn AuthContext> {
        Box::new(UnsupportedContext)
    }
}

/// Per-token handshake state
pub struct AuthSession {
    context: Box<dyn AuthContext>,
    has_credentials: bool,
    has_security_context: bool,
}

pub type SharedAuthSession = Arc<Mutex<AuthSession>>;

impl AuthSession {
    pub fn new(provider: &dyn AuthProvider) -> Self {
        Self {
            context: provider.open_context(),
            has_credentials: false,
            has_security_context: false,
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.has_credentials
    }

    pub fn has_security_context(&self) -> bool {
        self.has_security_context
    }

    /// NTLM first leg: always fresh credentials and a fresh context
    pub fn ntlm_auth(&mut self, req: &NtlmAuthRequest) -> Result<AuthStepReply, AuthFailure> {
        self.has_credentials = false;
        self.has_security_context = false;
        self.context.acquire_credentials(
            Package::Ntlm,
            req.username.as_deref(),
            req.credential_usage,
        )?;
        self.has_credentials = true;

        let step = self
            .context
            .step(req.target.as_deref(), req.context_attributes, None)?;
        self.has_security_context = true;
        Ok(step_reply(step))
    }

    /// NTLM second leg: feed the server challenge into the existing context
    pub fn ntlm_challenge(&mut self, req: &NtlmChallengeRequest) -> Result<AuthStepReply, AuthFailure> {
        self.require_context()?;
        let step = self.context.step(
            req.target.as_deref(),
            req.context_attributes,
            Some(&req.auth_data),
        )?;
        Ok(step_reply(step))
    }

    /// Kerberos leg: credentials once, first call starts the context
    pub fn kerberos(&mut self, req: &KerberosRequest) -> Result<AuthStepReply, AuthFailure> {
        if !self.has_credentials {
            self.context.acquire_credentials(
                Package::Kerberos,
                req.username.as_deref(),
                req.credential_usage,
            )?;
            self.has_credentials = true;
        }

        let input = if self.has_security_context {
            req.auth_data.as_deref()
        } else {
            None
        };
        let step = self
            .context
            .step(req.target.as_deref(), req.context_attributes, input)?;
        self.has_security_context = true;
        Ok(step_reply(step))
    }

    pub fn session_key(&mut self) -> Result<MaterialReply, AuthFailure> {
        self.require_context()?;
        let material = self.context.session_key()?;
        Ok(MaterialReply {
            status: status::SEC_E_OK as i64,
            material: Bytes::from(material),
        })
    }

    pub fn sequence(&mut self) -> Result<MaterialReply, AuthFailure> {
        self.require_context()?;
        let material = self.context.sequence()?;
        Ok(MaterialReply {
            status: status::SEC_E_OK as i64,
            material: Bytes::from(material),
        })
    }

    fn require_context(&self) -> Result<(), AuthFailure> {
        if self.has_security_context {
            Ok(())
        } else {
            Err(AuthFailure::new(
                status::SEC_E_INVALID_HANDLE,
                "No security context established for token",
            ))
        }
    }
}

fn step_reply(step: AuthStep) -> AuthStepReply {
    AuthStepReply {
        status: step.status as i64,
        context_attributes: step.context_attributes,
        token: Bytes::from(step.token),
    }
}

/// A decoded auth command
#[derive(Debug, Clone)]
pub enum AuthRequest {
    NtlmAuth(NtlmAuthRequest),
    NtlmChallenge(NtlmChallengeRequest),
    Kerberos(KerberosRequest),
    SessionKey,
    Sequence,
}

impl AuthRequest {
    /// `None` for commands that are not auth requests
    pub fn decode(command: CommandType, payload: &[u8]) -> Option<Result<Self, WireError>> {
        let request = match command {
            CommandType::NtlmAuth => NtlmAuthRequest::decode(payload).map(Self::NtlmAuth),
            CommandType::NtlmChall => NtlmChallengeRequest::decode(payload).map(Self::NtlmChallenge),
            CommandType::Kerberos => KerberosRequest::decode(payload).map(Self::Kerberos),
            CommandType::SessionKey => Ok(Self::SessionKey),
            CommandType::Sequence => Ok(Self::Sequence),
            _ => return None,
        };
        Some(request)
    }

    /// Whether this request may create the token's auth session
    pub fn opens_session(&self) -> bool {
        matches!(self, Self::NtlmAuth(_) | Self::Kerberos(_))
    }

    /// Reply command on success
    pub fn reply_command(&self) -> CommandType {
        match self {
            Self::NtlmAuth(_) => CommandType::NtlmAuthReply,
            Self::NtlmChallenge(_) => CommandType::NtlmChallReply,
            Self::Kerberos(_) => CommandType::KerberosReply,
            Self::SessionKey => CommandType::SessionKeyReply,
            Self::Sequence => CommandType::SequenceReply,
        }
    }

    /// Run against a session; returns the encoded reply payload
    pub fn apply(&self, session: &mut AuthSession) -> Result<Bytes, AuthFailure> {
        match self {
            Self::NtlmAuth(req) => session.ntlm_auth(req).map(|r| r.encode()),
            Self::NtlmChallenge(req) => session.ntlm_challenge(req).map(|r| r.encode()),
            Self::Kerberos(req) => session.kerberos(req).map(|r| r.encode()),
            Self::SessionKey => session.session_key().map(|r| r.encode()),
            Self::Sequence => session.sequence().map(|r| r.encode()),
        }
    }
}

/// Run `request` on the blocking pool under the session's lock
pub async fn execute(session: SharedAuthSession, request: AuthRequest) -> Result<(CommandType, Bytes), AuthFailure> {
    let command = request.reply_command();
    let joined = tokio::task::spawn_blocking(move || {
        let mut session = session.lock();
        request.apply(&mut session)
    })
    .await;

    match joined {
        Ok(result) => result.map(|payload| (command, payload)),
        Err(e) => {
            debug!("Auth worker failed: {}", e);
            Err(AuthFailure::new(status::GENERIC, format!("Generic error -auth- {}", e)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two-leg provider that records what it was asked
    #[derive(Default)]
    struct ScriptedContext {
        calls: Arc<Mutex<Vec<String>>>,
        legs: u32,
    }

    impl AuthContext for ScriptedContext {
        fn acquire_credentials(
            &mut self,
            package: Package,
            username: Option<&str>,
            _: i64,
        ) -> Result<(), AuthFailure> {
            self.calls
                .lock()
                .push(format!("acquire {} {}", package, username.unwrap_or("-")));
            self.legs = 0;
            Ok(())
        }

        fn step(&mut self, _: Option<&str>, attrs: i64, input: Option<&[u8]>) -> Result<AuthStep, AuthFailure> {
            self.calls
                .lock()
                .push(format!("step {}", input.map(|i| i.len()).unwrap_or(0)));
            self.legs += 1;
            if input == Some(b"bad".as_slice()) {
                return Err(AuthFailure::new(0x8009_0308_u32 as i32, "InitializeSecurityContext failed"));
            }
            Ok(AuthStep {
                status: if self.legs == 1 {
                    status::SEC_I_CONTINUE_NEEDED
                } else {
                    status::SEC_E_OK
                },
                context_attributes: attrs,
                token: vec![self.legs as u8; 4],
            })
        }

        fn session_key(&mut self) -> Result<Vec<u8>, AuthFailure> {
            Ok(vec![0xAA; 16])
        }

        fn sequence(&mut self) -> Result<Vec<u8>, AuthFailure> {
            Ok(vec![0x20; 16])
        }
    }

    struct ScriptedProvider {
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl AuthProvider for ScriptedProvider {
        fn open_context(&self) -> Box<dyn AuthContext> {
            Box::new(ScriptedContext {
                calls: self.calls.clone(),
                legs: 0,
            })
        }
    }

    fn provider() -> (ScriptedProvider, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        (
            ScriptedProvider {
                calls: calls.clone(),
            },
            calls,
        )
    }

    fn ntlm_auth() -> NtlmAuthRequest {
        NtlmAuthRequest {
            username: Some("alice".into()),
            credential_usage: 2,
            context_attributes: 0x800,
            target: None,
        }
    }

    #[test]
    fn test_ntlm_two_legs() {
        let (provider, calls) = provider();
        let mut session = AuthSession::new(&provider);

        let first = session.ntlm_auth(&ntlm_auth()).unwrap();
        assert_eq!(first.status, status::SEC_I_CONTINUE_NEEDED as i64);
        assert_eq!(first.context_attributes, 0x800);

        let second = session
            .ntlm_challenge(&NtlmChallengeRequest {
                auth_data: Bytes::from_static(b"challenge"),
                context_attributes: 0x800,
                target: Some("HOST/srv".into()),
            })
            .unwrap();
        assert_eq!(second.status, status::SEC_E_OK as i64);
        assert_eq!(
            *calls.lock(),
            vec!["acquire NTLM alice", "step 0", "step 9"]
        );
    }

    #[test]
    fn test_ntlm_auth_restarts_context() {
        let (provider, calls) = provider();
        let mut session = AuthSession::new(&provider);
        session.ntlm_auth(&ntlm_auth()).unwrap();
        let again = session.ntlm_auth(&ntlm_auth()).unwrap();
        assert_eq!(again.status, status::SEC_I_CONTINUE_NEEDED as i64);
        assert_eq!(calls.lock().len(), 4);
    }

    #[test]
    fn test_challenge_without_context() {
        let (provider, _) = provider();
        let mut session = AuthSession::new(&provider);
        let err = session
            .ntlm_challenge(&NtlmChallengeRequest {
                auth_data: Bytes::new(),
                context_attributes: 0,
                target: None,
            })
            .unwrap_err();
        assert_eq!(err.status, status::SEC_E_INVALID_HANDLE);
    }

    #[test]
    fn test_kerberos_acquires_once() {
        let (provider, calls) = provider();
        let mut session = AuthSession::new(&provider);
        let mut req = KerberosRequest {
            username: None,
            credential_usage: 2,
            context_attributes: 0,
            target: Some("HTTP/web".into()),
            auth_data: Some(Bytes::from_static(b"ignored-first")),
        };
        session.kerberos(&req).unwrap();
        req.auth_data = Some(Bytes::from_static(b"ap-rep"));
        session.kerberos(&req).unwrap();

        assert_eq!(
            *calls.lock(),
            vec!["acquire Kerberos -", "step 0", "step 6"]
        );
        assert_eq!(session.session_key().unwrap().material.len(), 16);
    }

    #[test]
    fn test_material_requires_context() {
        let (provider, _) = provider();
        let mut session = AuthSession::new(&provider);
        assert!(session.session_key().is_err());
        assert!(session.sequence().is_err());
    }

    #[test]
    fn test_unsupported_provider() {
        let mut session = AuthSession::new(&UnsupportedProvider);
        let err = session.ntlm_auth(&ntlm_auth()).unwrap_err();
        assert_eq!(err.status, status::SEC_E_UNSUPPORTED_FUNCTION);
        assert!(!session.has_credentials());
        assert!(!session.has_security_context());
    }

    #[tokio::test]
    async fn test_execute_maps_reply_command() {
        let (provider, _) = provider();
        let session = Arc::new(Mutex::new(AuthSession::new(&provider)));

        let (command, payload) = execute(session.clone(), AuthRequest::NtlmAuth(ntlm_auth()))
            .await
            .unwrap();
        assert_eq!(command, CommandType::NtlmAuthReply);
        let reply = AuthStepReply::decode(&payload).unwrap();
        assert_eq!(&reply.token[..], &[1, 1, 1, 1]);

        let bad = AuthRequest::NtlmChallenge(NtlmChallengeRequest {
            auth_data: Bytes::from_static(b"bad"),
            context_attributes: 0,
            target: None,
        });
        let failure = execute(session, bad).await.unwrap_err();
        assert_eq!(failure.status, 0x8009_0308_u32 as i32);
    }

    #[test]
    fn test_decode_routes_commands() {
        assert!(AuthRequest::decode(CommandType::Sd, &[]).is_none());
        let req = AuthRequest::decode(CommandType::Sequence, &[]).unwrap().unwrap();
        assert!(!req.opens_session());
        assert_eq!(req.reply_command(), CommandType::SequenceReply);
    }
}
