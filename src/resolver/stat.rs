//! Stat shaping (§4.2): a host file's `lstat` with write bits cleared, or a
//! synthetic stat for an archive-interior entry built from the archive
//! file's own `lstat` plus the entry's own size/type/timestamp.

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::SystemTime;

use time::{Date, Month, PrimitiveDateTime, Time};

use crate::archive::block::parse_dos_timestamp;
use crate::archive::Entry;

const S_IWUSR: u32 = 0o200;
const S_IWGRP: u32 = 0o020;
const S_IWOTH: u32 = 0o002;
const S_IRUSR: u32 = 0o400;
const S_IRGRP: u32 = 0o040;
const S_IROTH: u32 = 0o004;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;

/// A filesystem-agnostic stat record; [`crate::fs`] turns this into a
/// [`fuser::FileAttr`].
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub mode: u32,
    pub size: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl Stat {
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT as u32 == S_IFDIR
    }
}

/// `lstat` a host path and clear the write bits (§4.2, "Read-only host
/// stat").
pub fn host_stat(path: &Path) -> io::Result<Stat> {
    let meta = fs::symlink_metadata(path)?;
    let mode = meta.mode() & !(S_IWUSR | S_IWGRP | S_IWOTH);
    Ok(Stat {
        mode,
        size: meta.size(),
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        atime: meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
        mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        ctime: ctime_from_meta(&meta),
    })
}

#[cfg(unix)]
fn ctime_from_meta(meta: &fs::Metadata) -> SystemTime {
    let secs = meta.ctime();
    let nanos = meta.ctime_nsec() as u32;
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + std::time::Duration::new(secs as u64, nanos)
    } else {
        SystemTime::UNIX_EPOCH - std::time::Duration::new((-secs) as u64, 0)
    }
}

/// Synthesize a stat for an archive-interior entry (§4.2, "Archive-interior
/// stat"): type and size from `entry`, permission/ownership/mtime borrowed
/// from the archive file itself, `ctime` from the entry's own DOS
/// timestamp.
///
/// The DOS timestamp is treated as UTC rather than the host's local time
/// zone (the reference implementation uses `mktime`, which is local-time);
/// this avoids pulling in a local-offset dependency for a field most
/// callers never inspect.
pub fn rar_stat(archive_file: &Path, entry: &Entry) -> io::Result<Stat> {
    let host = fs::symlink_metadata(archive_file)?;

    let mut mode = if entry.is_directory { S_IFDIR } else { S_IFREG };
    mode |= host.mode() & (S_IRUSR | S_IRGRP | S_IROTH);

    Ok(Stat {
        mode,
        size: entry.file_size,
        nlink: 1,
        uid: host.uid(),
        gid: host.gid(),
        atime: SystemTime::now(),
        mtime: host.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        ctime: dos_time_to_system_time(entry.dos_time),
    })
}

fn dos_time_to_system_time(dos_time: u32) -> SystemTime {
    let (year, month, day, hour, min, sec) = parse_dos_timestamp(dos_time);

    let month = Month::try_from(month.max(1).min(12)).unwrap_or(Month::January);
    let date = match Date::from_calendar_date(year as i32, month, day.max(1)) {
        Ok(d) => d,
        Err(_) => return SystemTime::UNIX_EPOCH,
    };
    let time = match Time::from_hms(hour.min(23), min.min(59), sec.min(59)) {
        Ok(t) => t,
        Err(_) => return SystemTime::UNIX_EPOCH,
    };

    PrimitiveDateTime::new(date, time).assume_utc().into()
}
