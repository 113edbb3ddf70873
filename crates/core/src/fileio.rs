//! Positioned file access for concurrent chunk workers
//!
//! Workers share one file handle and read or write at explicit offsets, so no
//! seek position is shared between them. The blocking calls run on tokio's
//! blocking pool.

use std::fs::File;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Error, Result};

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    std::os::unix::fs::FileExt::read_exact_at(file, buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(std::io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    std::os::unix::fs::FileExt::write_all_at(file, buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => return Err(std::io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::General(format!("file worker failed: {e}")))?
        .map_err(Error::from)
}

/// Read `len` bytes starting at `offset`
pub async fn read_at(file: Arc<File>, offset: u64, len: usize) -> Result<Bytes> {
    blocking(move || {
        let mut buf = vec![0u8; len];
        read_exact_at(&file, &mut buf, offset)?;
        Ok(Bytes::from(buf))
    })
    .await
}

/// Write all of `data` starting at `offset`
pub async fn write_at(file: Arc<File>, offset: u64, data: Bytes) -> Result<()> {
    blocking(move || write_all_at(&file, &data, offset)).await
}

/// Open `path` for reading and return it with its length
pub async fn open_source(path: &std::path::Path) -> Result<(Arc<File>, u64)> {
    let path = path.to_path_buf();
    let (file, len) = blocking(move || {
        let file = File::open(&path)?;
        let len = file.metadata()?.len();
        Ok((file, len))
    })
    .await?;
    Ok((Arc::new(file), len))
}

/// Create (or truncate) `path` and size it to `len` bytes
pub async fn create_sized(path: &std::path::Path, len: u64) -> Result<Arc<File>> {
    let path = path.to_path_buf();
    let file = blocking(move || {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(len)?;
        Ok(file)
    })
    .await?;
    Ok(Arc::new(file))
}

/// Flush file contents to disk
pub async fn sync(file: Arc<File>) -> Result<()> {
    blocking(move || file.sync_all()).await
}
