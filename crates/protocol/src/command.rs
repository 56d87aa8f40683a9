//! Command type codes carried in every frame header

use std::fmt;

/// Command type - closed set of frame kinds understood by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CommandType {
    Ok = 0,
    Err = 1,
    Log = 2,
    Stop = 3,
    Continue = 4,
    Connect = 5,
    Disconnect = 6,
    /// Socket data on a client session
    Sd = 7,
    GetInfo = 8,
    GetInfoReply = 9,
    AuthErr = 10,
    NtlmAuth = 11,
    NtlmAuthReply = 12,
    NtlmChall = 13,
    NtlmChallReply = 14,
    Kerberos = 15,
    KerberosReply = 16,
    SessionKey = 17,
    SessionKeyReply = 18,
    Sequence = 19,
    SequenceReply = 20,
    /// Addressed socket data (server sessions, UDP)
    SdSrv = 200,
    Resolv = 202,
    Nop = 254,
    DirLs = 300,
    DirMk = 301,
    DirRm = 302,
    DirCopy = 303,
    DirMove = 304,
    FileOpen = 305,
    FileRead = 306,
    FileData = 307,
    FileEntry = 308,
    FileCopy = 309,
    FileMove = 310,
    FileRm = 311,
    FileStat = 312,
}

impl CommandType {
    /// Map a raw wire code to a command type
    pub fn from_u16(code: u16) -> Option<Self> {
        let cmd = match code {
            0 => Self::Ok,
            1 => Self::Err,
            2 => Self::Log,
            3 => Self::Stop,
            4 => Self::Continue,
            5 => Self::Connect,
            6 => Self::Disconnect,
            7 => Self::Sd,
            8 => Self::GetInfo,
            9 => Self::GetInfoReply,
            10 => Self::AuthErr,
            11 => Self::NtlmAuth,
            12 => Self::NtlmAuthReply,
            13 => Self::NtlmChall,
            14 => Self::NtlmChallReply,
            15 => Self::Kerberos,
            16 => Self::KerberosReply,
            17 => Self::SessionKey,
            18 => Self::SessionKeyReply,
            19 => Self::Sequence,
            20 => Self::SequenceReply,
            200 => Self::SdSrv,
            202 => Self::Resolv,
            254 => Self::Nop,
            300 => Self::DirLs,
            301 => Self::DirMk,
            302 => Self::DirRm,
            303 => Self::DirCopy,
            304 => Self::DirMove,
            305 => Self::FileOpen,
            306 => Self::FileRead,
            307 => Self::FileData,
            308 => Self::FileEntry,
            309 => Self::FileCopy,
            310 => Self::FileMove,
            311 => Self::FileRm,
            312 => Self::FileStat,
            _ => return None,
        };
        Some(cmd)
    }

    /// Raw wire code
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Wire name, as used in logs
    pub fn name(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Err => "ERR",
            Self::Log => "LOG",
            Self::Stop => "STOP",
            Self::Continue => "CONTINUE",
            Self::Connect => "CONNECT",
            Self::Disconnect => "DISCONNECT",
            Self::Sd => "SD",
            Self::GetInfo => "GETINFO",
            Self::GetInfoReply => "GETINFOREPLY",
            Self::AuthErr => "AUTHERR",
            Self::NtlmAuth => "NTLMAUTH",
            Self::NtlmAuthReply => "NTLMAUTHREPLY",
            Self::NtlmChall => "NTLMCHALL",
            Self::NtlmChallReply => "NTLMCHALLREPLY",
            Self::Kerberos => "KERBEROS",
            Self::KerberosReply => "KERBEROSREPLY",
            Self::SessionKey => "SESSIONKEY",
            Self::SessionKeyReply => "SESSIONKEYREPLY",
            Self::Sequence => "SEQUENCE",
            Self::SequenceReply => "SEQUENCEREPLY",
            Self::SdSrv => "SDSRV",
            Self::Resolv => "RESOLV",
            Self::Nop => "NOP",
            Self::DirLs => "DIRLS",
            Self::DirMk => "DIRMK",
            Self::DirRm => "DIRRM",
            Self::DirCopy => "DIRCOPY",
            Self::DirMove => "DIRMOVE",
            Self::FileOpen => "FILEOPEN",
            Self::FileRead => "FILEREAD",
            Self::FileData => "FILEDATA",
            Self::FileEntry => "FILEENTRY",
            Self::FileCopy => "FILECOPY",
            Self::FileMove => "FILEMOVE",
            Self::FileRm => "FILERM",
            Self::FileStat => "FILESTAT",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
