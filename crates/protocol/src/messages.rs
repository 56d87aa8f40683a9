//! Control, authentication, info and resolver payloads

use crate::wire::{WireError, WireReader, WireWriter, decode_wide};
use crate::Payload;
use bytes::Bytes;

/// Code the agent always puts in ERR replies
pub const ERR_CODE: i64 = -1;

/// ERR payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReply {
    pub code: i64,
    pub message: String,
}

impl ErrorReply {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: ERR_CODE,
            message: message.into(),
        }
    }
}

impl Payload for ErrorReply {
    fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = WireReader::new(payload);
        Ok(Self {
            code: r.number("code")?,
            message: r.string("message")?,
        })
    }

    fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        w.number(self.code).string(&self.message);
        w.finish()
    }
}

/// AUTHERR payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthErrorReply {
    pub status: i64,
    pub message: String,
}

impl Payload for AuthErrorReply {
    fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = WireReader::new(payload);
        Ok(Self {
            status: r.number("status")?,
            message: r.string("message")?,
        })
    }

    fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        w.number(self.status).string(&self.message);
        w.finish()
    }
}

/// NTLMAUTH: first leg of an NTLM handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtlmAuthRequest {
    pub username: Option<String>,
    pub credential_usage: i64,
    pub context_attributes: i64,
    pub target: Option<String>,
}

impl Payload for NtlmAuthRequest {
    fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = WireReader::new(payload);
        Ok(Self {
            username: r.opt_string("username")?,
            credential_usage: r.number("cred_usage")?,
            context_attributes: r.number("ctx_attrs")?,
            target: r.opt_string("target")?,
        })
    }

    fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        w.string(self.username.as_deref().unwrap_or(""))
            .number(self.credential_usage)
            .number(self.context_attributes)
            .string(self.target.as_deref().unwrap_or(""));
        w.finish()
    }
}

/// NTLMCHALL: server challenge fed into an existing context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtlmChallengeRequest {
    pub auth_data: Bytes,
    pub context_attributes: i64,
    pub target: Option<String>,
}

impl Payload for NtlmChallengeRequest {
    fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = WireReader::new(payload);
        Ok(Self {
            auth_data: Bytes::copy_from_slice(r.bytes()?),
            context_attributes: r.number("ctx_attrs")?,
            target: r.opt_string("target")?,
        })
    }

    fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        w.bytes(&self.auth_data)
            .number(self.context_attributes)
            .string(self.target.as_deref().unwrap_or(""));
        w.finish()
    }
}

/// KERBEROS: one leg of a Kerberos handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KerberosRequest {
    pub username: Option<String>,
    pub credential_usage: i64,
    pub context_attributes: i64,
    pub target: Option<String>,
    /// Absent on the first leg
    pub auth_data: Option<Bytes>,
}

impl Payload for KerberosRequest {
    fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = WireReader::new(payload);
        let username = r.opt_string("username")?;
        let credential_usage = r.number("cred_usage")?;
        let context_attributes = r.number("ctx_attrs")?;
        let target = r.opt_string("target")?;
        let auth_data = if r.is_empty() {
            None
        } else {
            let raw = r.bytes()?;
            (!raw.is_empty()).then(|| Bytes::copy_from_slice(raw))
        };
        Ok(Self {
            username,
            credential_usage,
            context_attributes,
            target,
            auth_data,
        })
    }

    fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        w.string(self.username.as_deref().unwrap_or(""))
            .number(self.credential_usage)
            .number(self.context_attributes)
            .string(self.target.as_deref().unwrap_or(""));
        if let Some(data) = &self.auth_data {
            w.bytes(data);
        }
        w.finish()
    }
}

/// NTLMAUTHREPLY / NTLMCHALLREPLY / KERBEROSREPLY payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthStepReply {
    pub status: i64,
    pub context_attributes: i64,
    pub token: Bytes,
}

impl Payload for AuthStepReply {
    fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = WireReader::new(payload);
        Ok(Self {
            status: r.number("status")?,
            context_attributes: r.number("ctx_attrs")?,
            token: Bytes::copy_from_slice(r.bytes()?),
        })
    }

    fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        w.number(self.status)
            .number(self.context_attributes)
            .bytes(&self.token);
        w.finish()
    }
}

/// SESSIONKEYREPLY / SEQUENCEREPLY payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterialReply {
    pub status: i64,
    pub material: Bytes,
}

impl Payload for MaterialReply {
    fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = WireReader::new(payload);
        Ok(Self {
            status: r.number("status")?,
            material: Bytes::copy_from_slice(r.bytes()?),
        })
    }

    fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        w.number(self.status).bytes(&self.material);
        w.finish()
    }
}

/// GETINFOREPLY payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InfoReply {
    pub pid: String,
    pub username: String,
    pub domain: String,
    pub logon_server: String,
    pub cpu_arch: String,
    pub hostname: String,
    pub user_sid: String,
}

impl Payload for InfoReply {
    fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = WireReader::new(payload);
        Ok(Self {
            pid: r.string("pid")?,
            username: decode_wide(r.bytes()?)?,
            domain: decode_wide(r.bytes()?)?,
            logon_server: decode_wide(r.bytes()?)?,
            cpu_arch: r.string("cpuarch")?,
            hostname: decode_wide(r.bytes()?)?,
            user_sid: r.string("usersid")?,
        })
    }

    fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        w.string(&self.pid)
            .wide_string(&self.username)
            .wide_string(&self.domain)
            .wide_string(&self.logon_server)
            .string(&self.cpu_arch)
            .wide_string(&self.hostname)
            .string(&self.user_sid);
        w.finish()
    }
}

/// RESOLV payload: names on the way in, results (same order) on the way out
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameList(pub Vec<String>);

impl Payload for NameList {
    fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = WireReader::new(payload);
        let count = r.u32()? as usize;
        // Every entry needs at least its 4-byte length
        if count > r.remaining() / 4 {
            return Err(WireError::Truncated {
                needed: count * 4,
                available: r.remaining(),
            });
        }
        let mut names = Vec::with_capacity(count);
        for _ in 0..count {
            names.push(r.string("name")?);
        }
        Ok(Self(names))
    }

    fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        w.u32(self.0.len() as u32);
        for name in &self.0 {
            w.string(name);
        }
        w.finish()
    }
}
