//! CONNECT and SDSRV payloads, plus the shared address encoding

use crate::token::{ConnectionToken, TOKEN_LEN};
use crate::wire::{WireError, WireReader, WireWriter};
use crate::Payload;
use bytes::Bytes;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Address type tags
pub const IPTYPE_V4: u8 = 4;
pub const IPTYPE_V6: u8 = 6;
pub const IPTYPE_HOSTNAME: u8 = 0xFF;

/// Transport protocol requested by CONNECT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    fn from_wire(raw: &[u8]) -> Result<Self, WireError> {
        match raw {
            b"TCP" | b"tcp" => Ok(Self::Tcp),
            b"UDP" | b"udp" => Ok(Self::Udp),
            other => Err(WireError::UnknownProtocol(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }

    fn as_wire(self) -> &'static [u8; 3] {
        match self {
            Self::Tcp => b"TCP",
            Self::Udp => b"UDP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("TCP"),
            Self::Udp => f.write_str("UDP"),
        }
    }
}

/// IP literal or hostname
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    Ip(IpAddr),
    Name(String),
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(ip) => write!(f, "{}", ip),
            Self::Name(name) => f.write_str(name),
        }
    }
}

/// Host + port, as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: Host,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: Host, port: u16) -> Self {
        Self { host, port }
    }

    /// Socket address, if the host is an IP literal
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match &self.host {
            Host::Ip(ip) => Some(SocketAddr::new(*ip, self.port)),
            Host::Name(_) => None,
        }
    }

    /// `0.0.0.0:0` / `[::]:0`
    pub fn is_unspecified(&self) -> bool {
        self.port == 0 && matches!(&self.host, Host::Ip(ip) if ip.is_unspecified())
    }

    /// `host:port` string suitable for `lookup_host` / `connect`
    pub fn authority(&self) -> String {
        match &self.host {
            Host::Ip(IpAddr::V6(ip)) => format!("[{}]:{}", ip, self.port),
            host => format!("{}:{}", host, self.port),
        }
    }

    pub(crate) fn read(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let iptype = r.u8()?;
        let host = match iptype {
            IPTYPE_V4 => {
                let raw = r.take(4)?;
                Host::Ip(IpAddr::V4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3])))
            }
            IPTYPE_V6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(r.take(16)?);
                Host::Ip(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            IPTYPE_HOSTNAME => Host::Name(r.string("hostname")?),
            other => return Err(WireError::UnknownIpType(other)),
        };
        let port = r.u16()?;
        Ok(Self { host, port })
    }

    pub(crate) fn write(&self, w: &mut WireWriter) {
        match &self.host {
            Host::Ip(IpAddr::V4(ip)) => {
                w.u8(IPTYPE_V4).raw(&ip.octets());
            }
            Host::Ip(IpAddr::V6(ip)) => {
                w.u8(IPTYPE_V6).raw(&ip.octets());
            }
            Host::Name(name) => {
                w.u8(IPTYPE_HOSTNAME).string(name);
            }
        }
        w.u16(self.port);
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        // v4-mapped peers from dual-stack sockets are reported as plain v4
        let ip = match addr.ip() {
            IpAddr::V6(v6) => v6
                .to_ipv4_mapped()
                .map(IpAddr::V4)
                .unwrap_or(IpAddr::V6(v6)),
            v4 => v4,
        };
        Self::new(Host::Ip(ip), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

/// Parsed CONNECT payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectSpec {
    pub protocol: Protocol,
    pub bind: bool,
    pub endpoint: Endpoint,
    /// 1 = plain; UDP servers accept further bind profiles
    pub bindtype: u8,
}

impl Payload for ConnectSpec {
    fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = WireReader::new(payload);
        let protocol = Protocol::from_wire(r.take(3)?)?;
        let bind = r.u8()? != 0;
        let endpoint = Endpoint::read(&mut r)?;
        let bindtype = r.u8()?;
        Ok(Self {
            protocol,
            bind,
            endpoint,
            bindtype,
        })
    }

    fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        w.raw(self.protocol.as_wire()).u8(self.bind as u8);
        self.endpoint.write(&mut w);
        w.u8(self.bindtype);
        w.finish()
    }
}

/// SDSRV payload: addressed socket data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketData {
    pub connection: ConnectionToken,
    pub endpoint: Endpoint,
    pub data: Bytes,
}

impl SocketData {
    pub fn new(connection: ConnectionToken, endpoint: Endpoint, data: impl Into<Bytes>) -> Self {
        Self {
            connection,
            endpoint,
            data: data.into(),
        }
    }
}

impl Payload for SocketData {
    fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = WireReader::new(payload);
        let connection = ConnectionToken::from_slice(r.take(TOKEN_LEN)?)
            .ok_or(WireError::MissingField("connection token"))?;
        let endpoint = Endpoint::read(&mut r)?;
        let data = Bytes::copy_from_slice(r.rest());
        Ok(Self {
            connection,
            endpoint,
            data,
        })
    }

    fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        w.raw(self.connection.as_bytes());
        self.endpoint.write(&mut w);
        w.raw(&self.data);
        w.finish()
    }
}
