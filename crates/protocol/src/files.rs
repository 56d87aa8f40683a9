//! Filesystem command payloads

use crate::wire::{WireError, WireReader, WireWriter};
use crate::Payload;
use bytes::Bytes;

/// DIRLS, DIRMK, DIRRM, FILERM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRequest {
    pub path: String,
}

impl Payload for PathRequest {
    fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = WireReader::new(payload);
        let path = r.opt_string("path")?.ok_or(WireError::MissingField("path"))?;
        Ok(Self { path })
    }

    fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        w.string(&self.path);
        w.finish()
    }
}

/// DIRCOPY, DIRMOVE, FILECOPY, FILEMOVE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPair {
    pub src: String,
    pub dst: String,
}

impl Payload for PathPair {
    fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = WireReader::new(payload);
        let src = r.opt_string("src")?.ok_or(WireError::MissingField("src"))?;
        let dst = r.opt_string("dst")?.ok_or(WireError::MissingField("dst"))?;
        Ok(Self { src, dst })
    }

    fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        w.string(&self.src).string(&self.dst);
        w.finish()
    }
}

/// FILEOPEN
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOpenRequest {
    pub path: String,
    /// fopen-style mode; empty means read-only
    pub mode: String,
}

impl Payload for FileOpenRequest {
    fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = WireReader::new(payload);
        let path = r.opt_string("path")?.ok_or(WireError::MissingField("path"))?;
        let mode = if r.is_empty() {
            String::new()
        } else {
            r.string("mode")?
        };
        Ok(Self { path, mode })
    }

    fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        w.string(&self.path).string(&self.mode);
        w.finish()
    }
}

/// FILEREAD
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileReadRequest {
    pub offset: u64,
    pub size: u32,
}

impl Payload for FileReadRequest {
    fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = WireReader::new(payload);
        Ok(Self {
            offset: r.u64()?,
            size: r.u32()?,
        })
    }

    fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        w.u64(self.offset).u32(self.size);
        w.finish()
    }
}

/// FILEDATA, both directions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileData {
    pub offset: u64,
    pub data: Bytes,
}

impl Payload for FileData {
    fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = WireReader::new(payload);
        Ok(Self {
            offset: r.u64()?,
            data: Bytes::copy_from_slice(r.bytes()?),
        })
    }

    fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        w.u64(self.offset).bytes(&self.data);
        w.finish()
    }
}

/// FILESTAT; no path means the file opened under the frame's token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStatRequest {
    pub path: Option<String>,
}

impl Payload for FileStatRequest {
    fn decode(payload: &[u8]) -> Result<Self, WireError> {
        if payload.is_empty() {
            return Ok(Self { path: None });
        }
        let mut r = WireReader::new(payload);
        Ok(Self {
            path: r.opt_string("path")?,
        })
    }

    fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        w.string(self.path.as_deref().unwrap_or(""));
        w.finish()
    }
}

/// FILEENTRY: one directory entry (also the FILESTAT reply)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileEntry {
    pub root: String,
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    /// Unix seconds
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
}

impl Payload for FileEntry {
    fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = WireReader::new(payload);
        Ok(Self {
            root: r.string("root")?,
            name: r.string("name")?,
            is_dir: r.u8()? != 0,
            size: r.u64()?,
            atime: r.u64()?,
            mtime: r.u64()?,
            ctime: r.u64()?,
        })
    }

    fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        w.string(&self.root)
            .string(&self.name)
            .u8(self.is_dir as u8)
            .u64(self.size)
            .u64(self.atime)
            .u64(self.mtime)
            .u64(self.ctime);
        w.finish()
    }
}
