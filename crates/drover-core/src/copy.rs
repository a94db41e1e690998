//! Size-tiered single-file copy.
//!
//! Files above 1 MiB go through a kernel-assisted transfer first (sendfile on
//! Linux); a partial or unsupported transfer falls back to a buffered
//! read/write loop for the remainder. Cancellation is observed between
//! chunks, and a cancelled copy removes the partially written destination
//! instead of leaving it truncated.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use filetime::FileTime;

use crate::buffer::BufferPolicy;
use crate::cancel::CancelFlag;
use crate::errors::{CopyError, CopyResult};

const MB: u64 = 1024 * 1024;

/// Idempotence check: the destination already holds this file if it exists
/// with the same size and a modification time no older than the source.
pub fn is_up_to_date(src: &Path, dst: &Path) -> bool {
    let Ok(src_meta) = fs::metadata(src) else {
        return false;
    };
    let Ok(dst_meta) = fs::metadata(dst) else {
        return false;
    };
    if src_meta.len() != dst_meta.len() {
        return false;
    }
    let src_mtime = FileTime::from_last_modification_time(&src_meta);
    let dst_mtime = FileTime::from_last_modification_time(&dst_meta);
    dst_mtime >= src_mtime
}

/// Copy `src` to `dst`, returning the bytes written. Parent directories are
/// created on demand; mode and timestamps are mirrored onto the destination.
pub fn fast_copy(
    src: &Path,
    dst: &Path,
    size: u64,
    policy: &BufferPolicy,
    cancel: &CancelFlag,
    preserve_times: bool,
) -> CopyResult<u64> {
    if cancel.is_cancelled() {
        return Err(CopyError::Cancelled);
    }

    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut reader = File::open(src)?;
    let mut writer = File::create(dst)?;
    let chunk = policy.chunk_size(size);

    let result = transfer(&mut reader, &mut writer, size, chunk, cancel);
    let written = match result {
        Ok(written) => written,
        Err(err) => {
            if matches!(err, CopyError::Cancelled) {
                drop(writer);
                remove_partial(dst);
            }
            return Err(err);
        }
    };

    writer.flush()?;
    drop(writer);
    apply_metadata(src, dst, preserve_times)?;
    Ok(written)
}

fn transfer(
    reader: &mut File,
    writer: &mut File,
    size: u64,
    chunk: usize,
    cancel: &CancelFlag,
) -> CopyResult<u64> {
    #[cfg(all(unix, not(target_os = "macos")))]
    if size > MB {
        match sendfile_loop(reader, writer, size, chunk, cancel)? {
            SendfileOutcome::Done(written) => return Ok(written),
            SendfileOutcome::Partial(written) => {
                log::debug!("sendfile stopped at {written} of {size} bytes, switching to buffered");
                let rest = buffered_loop(reader, writer, written, chunk, cancel)?;
                return Ok(written + rest);
            }
            SendfileOutcome::Unsupported => {}
        }
    }

    let written = buffered_loop(reader, writer, 0, chunk, cancel)?;
    Ok(written)
}

fn buffered_loop(
    reader: &mut File,
    writer: &mut File,
    offset: u64,
    chunk: usize,
    cancel: &CancelFlag,
) -> CopyResult<u64> {
    reader.seek(SeekFrom::Start(offset))?;
    writer.seek(SeekFrom::Start(offset))?;

    let mut buf = vec![0u8; chunk.max(1)];
    let mut written = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(CopyError::Cancelled);
        }
        let read = reader.read(&mut buf)?;
        if read == 0 {
            return Ok(written);
        }
        writer.write_all(&buf[..read])?;
        written += read as u64;
    }
}

#[cfg(all(unix, not(target_os = "macos")))]
enum SendfileOutcome {
    Done(u64),
    /// Kernel transfer stopped early; `0..n` bytes are already in place.
    Partial(u64),
    Unsupported,
}

#[cfg(all(unix, not(target_os = "macos")))]
fn sendfile_loop(
    reader: &File,
    writer: &File,
    size: u64,
    chunk: usize,
    cancel: &CancelFlag,
) -> CopyResult<SendfileOutcome> {
    use std::io;
    use std::os::unix::io::AsRawFd;

    let in_fd = reader.as_raw_fd();
    let out_fd = writer.as_raw_fd();
    let mut offset: libc::off_t = 0;

    while (offset as u64) < size {
        if cancel.is_cancelled() {
            return Err(CopyError::Cancelled);
        }
        let remaining = size - offset as u64;
        let step = remaining.min(chunk as u64) as usize;
        let sent = unsafe { libc::sendfile(out_fd, in_fd, &mut offset, step) };
        if sent > 0 {
            continue;
        }
        if sent == 0 {
            // Source shrank underneath us; let the buffered path finish.
            return Ok(SendfileOutcome::Partial(offset as u64));
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == libc::EINTR || code == libc::EAGAIN => continue,
            Some(code) if code == libc::EINVAL || code == libc::ENOSYS => {
                if offset == 0 {
                    return Ok(SendfileOutcome::Unsupported);
                }
                return Ok(SendfileOutcome::Partial(offset as u64));
            }
            _ => return Err(CopyError::Io(err)),
        }
    }

    Ok(SendfileOutcome::Done(offset as u64))
}

fn apply_metadata(src: &Path, dst: &Path, preserve_times: bool) -> CopyResult<()> {
    let meta = fs::metadata(src)?;
    fs::set_permissions(dst, meta.permissions())?;
    if preserve_times {
        let atime = FileTime::from_last_access_time(&meta);
        let mtime = FileTime::from_last_modification_time(&meta);
        filetime::set_file_times(dst, atime, mtime)?;
    }
    Ok(())
}

fn remove_partial(dst: &Path) {
    if let Err(err) = fs::remove_file(dst) {
        log::warn!("could not remove partial file {}: {err}", dst.display());
    }
}
