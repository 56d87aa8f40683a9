//! Filesystem collaborator
//!
//! Thin wrappers over `tokio::fs`. Directory walks are boxed recursive futures.

use bytes::Bytes;
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use wsrelay_protocol::FileEntry;

#[derive(Error, Debug)]
pub enum FileOpError {
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Source directory does not exist: {0}")]
    SourceMissing(String),

    #[error("Destination already exists: {0}")]
    DestinationExists(String),

    #[error("Invalid file mode: {0:?}")]
    InvalidMode(String),
}

type Result<T> = std::result::Result<T, FileOpError>;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> FileOpError + '_ {
    move |source| FileOpError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn unix_secs(time: std::io::Result<SystemTime>) -> u64 {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn entry_for(path: &Path, meta: &std::fs::Metadata) -> FileEntry {
    let root = path
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    FileEntry {
        root,
        name,
        is_dir: meta.is_dir(),
        size: if meta.is_dir() { 0 } else { meta.len() },
        atime: unix_secs(meta.accessed()),
        mtime: unix_secs(meta.modified()),
        ctime: unix_secs(meta.created()),
    }
}

/// DIRLS: files first, then directories, each group sorted by name
pub async fn list_dir(path: &str) -> Result<Vec<FileEntry>> {
    let dir = Path::new(path);
    let mut reader = fs::read_dir(dir).await.map_err(io_err(dir))?;
    let mut files = Vec::new();
    let mut dirs = Vec::new();

    while let Some(entry) = reader.next_entry().await.map_err(io_err(dir))? {
        let entry_path = entry.path();
        // Entries can vanish between listing and stat
        let Ok(meta) = fs::metadata(&entry_path).await else {
            continue;
        };
        let item = entry_for(&entry_path, &meta);
        if item.is_dir {
            dirs.push(item);
        } else {
            files.push(item);
        }
    }

    files.sort_by(|a, b| a.name.cmp(&b.name));
    dirs.sort_by(|a, b| a.name.cmp(&b.name));
    files.extend(dirs);
    Ok(files)
}

/// DIRMK: recursive, succeeds if already present
pub async fn make_dir(path: &str) -> Result<()> {
    let dir = Path::new(path);
    fs::create_dir_all(dir).await.map_err(io_err(dir))
}

/// DIRRM: recursive, succeeds if absent
pub async fn remove_dir(path: &str) -> Result<()> {
    let dir = Path::new(path);
    match fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(dir)(e)),
    }
}

/// DIRCOPY: recursive, existing files are overwritten
pub async fn copy_dir(src: &str, dst: &str) -> Result<()> {
    let src = Path::new(src);
    if !fs::try_exists(src).await.unwrap_or(false) {
        return Err(FileOpError::SourceMissing(src.display().to_string()));
    }
    copy_tree(src.to_path_buf(), PathBuf::from(dst)).await
}

fn copy_tree(src: PathBuf, dst: PathBuf) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move {
        fs::create_dir_all(&dst).await.map_err(io_err(&dst))?;
        let mut reader = fs::read_dir(&src).await.map_err(io_err(&src))?;
        while let Some(entry) = reader.next_entry().await.map_err(io_err(&src))? {
            let from = entry.path();
            let to = dst.join(entry.file_name());
            let kind = entry.file_type().await.map_err(io_err(&from))?;
            if kind.is_dir() {
                copy_tree(from, to).await?;
            } else {
                fs::copy(&from, &to).await.map_err(io_err(&from))?;
            }
        }
        Ok(())
    })
}

/// DIRMOVE: the source must exist and the destination must not
pub async fn move_dir(src: &str, dst: &str) -> Result<()> {
    let (from, to) = (Path::new(src), Path::new(dst));
    if !fs::try_exists(from).await.unwrap_or(false) {
        return Err(FileOpError::SourceMissing(src.to_string()));
    }
    if fs::try_exists(to).await.unwrap_or(false) {
        return Err(FileOpError::DestinationExists(dst.to_string()));
    }
    fs::rename(from, to).await.map_err(io_err(from))
}

/// FILECOPY: overwrites the destination
pub async fn copy_file(src: &str, dst: &str) -> Result<()> {
    let from = Path::new(src);
    fs::copy(from, dst).await.map(|_| ()).map_err(io_err(from))
}

/// FILEMOVE: the destination must not exist
pub async fn move_file(src: &str, dst: &str) -> Result<()> {
    let (from, to) = (Path::new(src), Path::new(dst));
    if fs::try_exists(to).await.unwrap_or(false) {
        return Err(FileOpError::DestinationExists(dst.to_string()));
    }
    fs::rename(from, to).await.map_err(io_err(from))
}

/// FILERM
pub async fn remove_file(path: &str) -> Result<()> {
    let file = Path::new(path);
    fs::remove_file(file).await.map_err(io_err(file))
}

/// FILESTAT on a path
pub async fn stat(path: &str) -> Result<FileEntry> {
    let target = Path::new(path);
    let meta = fs::metadata(target).await.map_err(io_err(target))?;
    Ok(entry_for(target, &meta))
}

/// A file opened by FILEOPEN and addressed by its token
#[derive(Debug)]
pub struct OpenFile {
    file: File,
    path: String,
}

impl OpenFile {
    /// Open with a C-style mode string (`r`, `w`, `a`, optional `+` and `b`)
    pub async fn open(path: &str, mode: &str) -> Result<Self> {
        let options = open_options(mode)?;
        let target = Path::new(path);
        let file = options.open(target).await.map_err(io_err(target))?;
        Ok(Self {
            file,
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Read up to `size` bytes at `offset`; short reads are returned as-is
    pub async fn read_at(&mut self, offset: u64, size: usize) -> Result<Bytes> {
        let target = Path::new(&self.path);
        self.file
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(io_err(target))?;

        let mut buf = Vec::with_capacity(size);
        (&mut self.file)
            .take(size as u64)
            .read_to_end(&mut buf)
            .await
            .map_err(io_err(target))?;
        Ok(Bytes::from(buf))
    }

    pub async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let target = Path::new(&self.path);
        self.file
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(io_err(target))?;
        self.file.write_all(data).await.map_err(io_err(target))?;
        self.file.flush().await.map_err(io_err(target))
    }

    pub async fn stat(&self) -> Result<FileEntry> {
        let target = Path::new(&self.path);
        let meta = self.file.metadata().await.map_err(io_err(target))?;
        Ok(entry_for(target, &meta))
    }
}

fn open_options(mode: &str) -> Result<OpenOptions> {
    let flags: String = mode.chars().filter(|c| *c != 'b' && *c != 't').collect();
    let plus = flags.contains('+');
    let mut options = OpenOptions::new();

    match flags.trim_end_matches('+') {
        "" | "r" => {
            options.read(true).write(plus);
        }
        "w" => {
            options.write(true).create(true).truncate(true).read(plus);
        }
        "a" => {
            options.append(true).create(true).read(plus);
        }
        "x" => {
            options.write(true).create_new(true).read(plus);
        }
        _ => return Err(FileOpError::InvalidMode(mode.to_string())),
    }
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn p(dir: &TempDir, rel: &str) -> String {
        dir.path().join(rel).display().to_string()
    }

    #[tokio::test]
    async fn test_list_dir_files_before_dirs() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("a_dir")).unwrap();
        std::fs::write(tmp.path().join("z_file"), b"12345").unwrap();
        std::fs::write(tmp.path().join("b_file"), b"1").unwrap();

        let entries = list_dir(&tmp.path().display().to_string()).await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["b_file", "z_file", "a_dir"]);
        assert_eq!(entries[1].size, 5);
        assert!(entries[2].is_dir);
        assert_eq!(entries[0].root, tmp.path().display().to_string());
    }

    #[tokio::test]
    async fn test_make_and_remove_dir_idempotent() {
        let tmp = TempDir::new().unwrap();
        let nested = p(&tmp, "x/y/z");
        make_dir(&nested).await.unwrap();
        make_dir(&nested).await.unwrap();
        assert!(Path::new(&nested).is_dir());

        remove_dir(&p(&tmp, "x")).await.unwrap();
        remove_dir(&p(&tmp, "x")).await.unwrap();
        assert!(!Path::new(&p(&tmp, "x")).exists());
    }

    #[tokio::test]
    async fn test_copy_dir_recursive_overwrites() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("src/inner")).unwrap();
        std::fs::write(tmp.path().join("src/inner/f"), b"new").unwrap();
        std::fs::create_dir_all(tmp.path().join("dst/inner")).unwrap();
        std::fs::write(tmp.path().join("dst/inner/f"), b"old").unwrap();

        copy_dir(&p(&tmp, "src"), &p(&tmp, "dst")).await.unwrap();
        assert_eq!(std::fs::read(tmp.path().join("dst/inner/f")).unwrap(), b"new");

        assert!(matches!(
            copy_dir(&p(&tmp, "missing"), &p(&tmp, "dst2")).await,
            Err(FileOpError::SourceMissing(_))
        ));
    }

    #[tokio::test]
    async fn test_move_dir_rules() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("a")).unwrap();
        std::fs::create_dir(tmp.path().join("taken")).unwrap();

        assert!(matches!(
            move_dir(&p(&tmp, "nope"), &p(&tmp, "b")).await,
            Err(FileOpError::SourceMissing(_))
        ));
        assert!(matches!(
            move_dir(&p(&tmp, "a"), &p(&tmp, "taken")).await,
            Err(FileOpError::DestinationExists(_))
        ));
        move_dir(&p(&tmp, "a"), &p(&tmp, "b")).await.unwrap();
        assert!(tmp.path().join("b").is_dir());
    }

    #[tokio::test]
    async fn test_file_copy_move_remove() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("one"), b"1").unwrap();
        std::fs::write(tmp.path().join("two"), b"2").unwrap();

        copy_file(&p(&tmp, "one"), &p(&tmp, "two")).await.unwrap();
        assert_eq!(std::fs::read(tmp.path().join("two")).unwrap(), b"1");

        assert!(matches!(
            move_file(&p(&tmp, "one"), &p(&tmp, "two")).await,
            Err(FileOpError::DestinationExists(_))
        ));
        move_file(&p(&tmp, "one"), &p(&tmp, "three")).await.unwrap();

        remove_file(&p(&tmp, "three")).await.unwrap();
        let err = remove_file(&p(&tmp, "three")).await.unwrap_err();
        assert!(err.to_string().contains("three"));
    }

    #[tokio::test]
    async fn test_open_file_read_write() {
        let tmp = TempDir::new().unwrap();
        let path = p(&tmp, "data.bin");

        let mut file = OpenFile::open(&path, "w+b").await.unwrap();
        file.write_at(0, b"hello world").await.unwrap();
        file.write_at(6, b"WORLD").await.unwrap();

        assert_eq!(&file.read_at(6, 100).await.unwrap()[..], b"WORLD");
        assert_eq!(&file.read_at(0, 5).await.unwrap()[..], b"hello");
        assert!(file.read_at(50, 10).await.unwrap().is_empty());

        let entry = file.stat().await.unwrap();
        assert_eq!(entry.name, "data.bin");
        assert_eq!(entry.size, 11);
        assert_eq!(stat(&path).await.unwrap().size, 11);
    }

    #[tokio::test]
    async fn test_open_modes() {
        let tmp = TempDir::new().unwrap();
        let path = p(&tmp, "log.txt");
        assert!(OpenFile::open(&path, "r").await.is_err());
        assert!(matches!(
            OpenFile::open(&path, "q").await,
            Err(FileOpError::InvalidMode(_))
        ));

        let mut file = OpenFile::open(&path, "a").await.unwrap();
        file.write_at(0, b"ab").await.unwrap();
        file.write_at(0, b"cd").await.unwrap();
        drop(file);
        assert_eq!(std::fs::read(&path).unwrap(), b"abcd");

        let mut reader = OpenFile::open(&path, "").await.unwrap();
        assert_eq!(&reader.read_at(2, 2).await.unwrap()[..], b"cd");
        assert_eq!(reader.path(), path);
    }
}
