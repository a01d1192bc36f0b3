//! The RAR archive reader (§4.1): parses the RAR15 block stream into a
//! table of [`Entry`] records and serves random-access partial reads of
//! store-method entries across multi-volume archives.

pub mod block;
pub mod unicode_name;
pub mod volname;

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use block::{is_comment_sub_block, EndArcHeader, FileHeader, MainHeader, RawBlock, MAGIC};
use volname::Numbering;

use crate::error::{Error, RarResult};

/// Compression method byte for uncompressed ("store") entries.
pub const STORE_METHOD: u8 = 0x30;

/// Name of the extractor binary used for compressed entries (§6). Must be
/// on `PATH` and support `p -inul` (pipe to stdout) and `e -inul -y` (the
/// extraction-cache form used by [`crate::cache`]).
pub const EXTRACTOR: &str = "unrar";

/// Multi-volume traversal policy during archive open/enumeration (§4.1,
/// "Volume traversal policy").
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OnlyFirst {
    /// Read only the first volume.
    Yes,
    /// Walk all volumes.
    No,
    /// Read the next volume only if needed to resolve a split.
    Auto,
}

/// A fabricated 13-byte MAIN block used by the extract hack (§4.1):
/// `crc=0x90CF, type=0x73, flags=0, size=13, res1=0, res2=0`.
const SYNTHETIC_MAIN_HEADER: [u8; 13] = [
    0xcf, 0x90, // header_crc
    0x73, // type = MAIN
    0x00, 0x00, // flags
    0x0d, 0x00, // header_size = 13
    0x00, 0x00, // reserved1 (u16)
    0x00, 0x00, 0x00, 0x00, // reserved2 (u32)
];

/// One entry in an archive's directory table (§3).
#[derive(Debug, Clone)]
pub struct Entry {
    /// Filename as recorded in the header: the ASCII/OEM prefix when
    /// [`block::FileFlags::unicode`] is set, the ISO-8859-1-decoded raw
    /// bytes otherwise. This is the key used to index entries and the
    /// string split on `\` for directory-listing basenames (§4.2),
    /// matching the reference implementation.
    pub filename: String,
    /// Fully Unicode-decoded filename, when the header carried one.
    pub unicode_filename: Option<String>,
    pub file_size: u64,
    pub compress_size: u64,
    pub crc32: i32,
    pub compress_type: u8,
    pub host_os: u8,
    pub dos_time: u32,
    pub mode: u32,
    pub is_directory: bool,
    /// Volume index (0-based) on which this entry's data begins.
    pub volume: u32,
    /// Offset of this entry's FILE block header within `volume`.
    pub header_offset: u64,
    /// Offset within `volume` where this entry's data begins.
    pub file_offset: u64,
    /// Data bytes for this entry within `volume`.
    pub add_size: u64,
    pub next_file_offset: Option<u64>,
    pub next_add_size: Option<u64>,
    pub next_compress_size: Option<u64>,
    /// Whether the most recently seen header for this entry carried
    /// `SPLIT_AFTER` (the entry continues into another volume).
    pub split_after: bool,
}

impl PartialEq for Entry {
    // Open question 2 (§9): compare the two entries' names, not a name to
    // itself.
    fn eq(&self, other: &Self) -> bool {
        self.filename == other.filename
    }
}

impl Entry {
    pub fn is_store(&self) -> bool {
        self.compress_type == STORE_METHOD
    }
}

fn raw_header_name(header: &FileHeader) -> String {
    if header.flags.unicode() {
        header
            .filename_raw
            .iter()
            .map(|&b| b as char)
            .collect::<String>()
    } else {
        header.name()
    }
}

fn skip_payload<R: Seek>(reader: &mut R, block: &RawBlock) -> io::Result<()> {
    if block.add_size > 0 {
        reader.seek(SeekFrom::Current(block.add_size as i64))?;
    }
    Ok(())
}

fn open_volume_blocks(path: &Path) -> io::Result<File> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; MAGIC.len()];
    file.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad RAR signature"));
    }
    Ok(file)
}

/// Should the next volume be read, given the current parse state?
///
/// Mirrors `_must_read_next` in the reference implementation: only the
/// second volume is ever of interest here, and only when the archive had a
/// comment sub-block before any FILE record and the first entry is split.
fn must_read_next(volume: u32, first_entry_split_after: Option<bool>, has_comment: bool) -> bool {
    if volume > 0 {
        return false;
    }
    match first_entry_split_after {
        None => true,
        Some(split_after) => has_comment && split_after,
    }
}

/// An opened multi-volume RAR archive (§3).
#[derive(Debug)]
pub struct Archive {
    /// Path of the first volume, as supplied to [`Archive::open`].
    pub base_path: PathBuf,
    entries: HashMap<String, Entry>,
    pub is_solid: bool,
    pub uses_volumes: bool,
    pub uses_newnumbering: bool,
    pub has_comment: bool,
    numbering: Numbering,
}

impl Archive {
    /// Parse an archive starting from its first volume, following
    /// continuation volumes per `only_first` (§4.1).
    pub fn open(path: impl AsRef<Path>, only_first: OnlyFirst) -> RarResult<Self> {
        let base_path = path.as_ref().to_path_buf();

        let mut entries: HashMap<String, Entry> = HashMap::new();
        let mut first_entry_split_after: Option<bool> = None;
        let mut is_solid = false;
        let mut uses_volumes = false;
        let mut uses_newnumbering = false;
        let mut has_comment = false;
        let mut got_main_header = false;

        let mut volume: u32 = 0;
        let mut more_vols = false;
        let mut file = open_volume_blocks(&base_path).map_err(|_| Error::NotRarFile)?;

        loop {
            let block = RawBlock::read(&mut file)?;
            let block = match block {
                Some(b) => b,
                None => {
                    let stop_here = !must_read_next(volume, first_entry_split_after, has_comment)
                        && match only_first {
                            OnlyFirst::Yes => true,
                            OnlyFirst::Auto => entries.len() == 1,
                            OnlyFirst::No => false,
                        };
                    if stop_here {
                        break;
                    }
                    if more_vols {
                        let next_volume = volume + 1;
                        let next_path = match Self::volume_path(&base_path, next_volume, uses_newnumbering)
                        {
                            Some(p) => p,
                            None => break,
                        };
                        match open_volume_blocks(&next_path) {
                            Ok(f) => {
                                file = f;
                                volume = next_volume;
                                more_vols = false;
                                continue;
                            }
                            Err(_) => break,
                        }
                    }
                    break;
                }
            };

            if block.is_mark() {
                skip_payload(&mut file, &block)?;
                continue;
            }

            if block.is_main() && !got_main_header {
                let main = MainHeader::parse(&block);
                uses_newnumbering = main.flags.new_numbering();
                uses_volumes = main.flags.volume();
                is_solid = main.flags.solid();
                got_main_header = true;
            } else if block.is_endarc() {
                let end = EndArcHeader::parse(&block);
                more_vols = end.flags.next_volume();
            }

            if block.is_file_or_sub() {
                let header = FileHeader::parse(&block)?;
                let name = raw_header_name(&header);

                if is_comment_sub_block(&header) {
                    has_comment = true;
                }

                let gated = only_first == OnlyFirst::Yes
                    && !must_read_next(volume, first_entry_split_after, has_comment);

                if !gated {
                    if first_entry_split_after.is_none() {
                        first_entry_split_after = Some(header.flags.split_after());
                    }
                    process_entry(&mut entries, &header, &block, volume, name);
                }
            }

            skip_payload(&mut file, &block)?;
        }

        let numbering = if uses_newnumbering { Numbering::New } else { Numbering::Old };

        Ok(Archive {
            base_path,
            entries,
            is_solid,
            uses_volumes,
            uses_newnumbering,
            has_comment,
            numbering,
        })
    }

    fn volume_path(base_path: &Path, volume: u32, uses_newnumbering: bool) -> Option<PathBuf> {
        let base_str = base_path.to_string_lossy();
        let numbering = if uses_newnumbering { Numbering::New } else { Numbering::Old };
        volname::volume_name(&base_str, volume, numbering).map(PathBuf::from)
    }

    fn path_for_volume(&self, volume: u32) -> RarResult<PathBuf> {
        if volume == 0 {
            return Ok(self.base_path.clone());
        }
        let base_str = self.base_path.to_string_lossy();
        volname::volume_name(&base_str, volume, self.numbering)
            .map(PathBuf::from)
            .ok_or_else(|| Error::BadVolumeName(base_str.into_owned()))
    }

    /// All entries, keyed by their raw archive filename.
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    pub fn entry(&self, name: &str) -> Option<&Entry> {
        self.entries.get(name)
    }

    /// Random-access partial read of a store-method entry (§4.1).
    ///
    /// Assumes `next_add_size` is uniform across all tail volumes past the
    /// second (§9, open question 1) — a documented simplification, not a
    /// bug: production archives with irregular trailing volume sizes would
    /// need to re-derive each tail volume's true `add_size` from its own
    /// header instead of extrapolating from the first continuation.
    pub fn read_partial(&self, name: &str, offset: u64, length: u64) -> RarResult<Vec<u8>> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| Error::NoSuchEntry(name.to_string()))?;

        if !entry.is_store() {
            return Err(Error::NotStoreMethod(name.to_string()));
        }

        if offset >= entry.file_size {
            return Ok(Vec::new());
        }
        let mut length = length.min(entry.file_size - offset);

        let add_size = if entry.add_size == 0 {
            entry.compress_size
        } else {
            entry.add_size
        };
        let next_add_size = entry.next_add_size.unwrap_or(add_size);
        let next_file_offset = entry.next_file_offset.unwrap_or(entry.file_offset);

        let (mut volume, mut vol_offset, mut vol_budget, mut file_offset);
        if offset <= add_size {
            volume = entry.volume;
            vol_offset = offset;
            vol_budget = add_size - vol_offset;
            file_offset = entry.file_offset;
        } else {
            if next_add_size == 0 {
                return Err(Error::CorruptHeader);
            }
            let k = (offset - add_size) / next_add_size;
            volume = entry.volume + 1 + k as u32;
            vol_offset = (offset - add_size) % next_add_size;
            vol_budget = next_add_size - vol_offset;
            file_offset = next_file_offset;
        }
        if length < vol_budget {
            vol_budget = length;
        }

        let mut out = Vec::with_capacity(length as usize);
        while length > 0 {
            let path = self.path_for_volume(volume)?;
            let mut f = File::open(&path)?;
            f.seek(SeekFrom::Start(file_offset + vol_offset))?;
            let mut chunk = vec![0u8; vol_budget as usize];
            f.read_exact(&mut chunk)?;
            out.extend_from_slice(&chunk);
            length -= vol_budget;

            vol_offset = 0;
            volume += 1;
            file_offset = next_file_offset;
            vol_budget = if length < next_add_size { length } else { next_add_size };
        }

        Ok(out)
    }

    /// Read and concatenate every volume's contribution to a store-method
    /// entry, walking `SPLIT_AFTER` chains by re-parsing each volume's
    /// header (§4.1, "Bulk read").
    pub fn bulk_read(&self, name: &str) -> RarResult<Vec<u8>> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| Error::NoSuchEntry(name.to_string()))?;
        if !entry.is_store() {
            return Err(Error::NotStoreMethod(name.to_string()));
        }

        let mut buf = Vec::with_capacity(entry.file_size as usize);
        let mut volume = entry.volume;
        let mut at_known_offset = true;

        loop {
            let path = self.path_for_volume(volume)?;
            let mut f = File::open(&path)?;

            if at_known_offset {
                f.seek(SeekFrom::Start(entry.header_offset))?;
            } else {
                f.seek(SeekFrom::Start(MAGIC.len() as u64))?;
            }

            let (add_size, split_after) = loop {
                let block = RawBlock::read(&mut f)?
                    .ok_or_else(|| Error::CrcMismatch(name.to_string()))?;

                if block.is_file_or_sub() {
                    let header = FileHeader::parse(&block)?;
                    if raw_header_name(&header) == name {
                        break (block.add_size as u64, header.flags.split_after());
                    }
                }
                skip_payload(&mut f, &block)?;
            };

            let mut chunk = vec![0u8; add_size as usize];
            f.read_exact(&mut chunk)?;
            buf.extend_from_slice(&chunk);

            if !split_after {
                break;
            }
            volume += 1;
            at_known_offset = false;
        }

        Ok(buf)
    }

    /// Read and decompress a whole entry, verifying its CRC32 (§4.1).
    ///
    /// Store entries are served by [`Self::bulk_read`]; compressed entries
    /// go through the extract hack (single-file, non-solid, non-volume
    /// archives) or a direct `unrar p` pipe otherwise.
    pub fn read(&self, name: &str) -> RarResult<Vec<u8>> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| Error::NoSuchEntry(name.to_string()))?;

        let data = if entry.is_store() {
            self.bulk_read(name)?
        } else if !self.is_solid && !self.uses_volumes {
            self.extract_hack(entry)?
        } else {
            self.extract_unrar(&self.base_path, name)?
        };

        if crc32fast::hash(&data) != entry.crc32 as u32 {
            return Err(Error::CrcMismatch(name.to_string()));
        }

        Ok(data)
    }

    fn extract_unrar(&self, archive_path: &Path, interior_name: &str) -> RarResult<Vec<u8>> {
        // Linux unrar wants '/' path separators; argv-based spawning means
        // there is no shell to escape metacharacters for (see §4.1).
        let normalized = interior_name.replace('\\', "/");

        let output = Command::new(EXTRACTOR)
            .arg("p")
            .arg("-inul")
            .arg(archive_path)
            .arg(&normalized)
            .output()?;

        if !output.status.success() {
            return Err(Error::ExtractorFailed(output.status.code().unwrap_or(-1)));
        }

        Ok(output.stdout)
    }

    fn extract_hack(&self, entry: &Entry) -> RarResult<Vec<u8>> {
        let header_size = entry.file_offset - entry.header_offset;
        let total = entry.compress_size + header_size;

        let mut src = File::open(&self.base_path)?;
        src.seek(SeekFrom::Start(entry.header_offset))?;

        let mut tmp = tempfile::Builder::new().suffix(".rar").tempfile()?;
        tmp.write_all(MAGIC)?;
        tmp.write_all(&SYNTHETIC_MAIN_HEADER)?;
        io::copy(&mut src.take(total), tmp.as_file_mut())?;
        tmp.flush()?;

        let result = self.extract_unrar(tmp.path(), &entry.filename);
        drop(tmp);
        result
    }
}

fn process_entry(
    entries: &mut HashMap<String, Entry>,
    header: &FileHeader,
    block: &RawBlock,
    volume: u32,
    name: String,
) {
    let file_offset = block.offset + block.header_size as u64;

    if !header.flags.split_before() {
        entries.insert(
            name.clone(),
            Entry {
                filename: name,
                unicode_filename: header.unicode_name.clone(),
                file_size: header.file_size,
                compress_size: header.compress_size,
                crc32: header.crc32,
                compress_type: header.compress_type,
                host_os: header.host_os,
                dos_time: header.dos_time,
                mode: header.mode,
                is_directory: header.is_directory(),
                volume,
                header_offset: block.offset,
                file_offset,
                add_size: block.add_size as u64,
                next_file_offset: None,
                next_add_size: None,
                next_compress_size: None,
                split_after: header.flags.split_after(),
            },
        );
    } else if let Some(primary) = entries.get_mut(&name) {
        if primary.next_add_size.is_none() {
            primary.next_add_size = Some(block.add_size as u64);
        }
        if primary.next_file_offset.is_none() {
            primary.next_file_offset = Some(file_offset);
        }
        if primary.next_compress_size.is_none() {
            primary.next_compress_size = Some(header.compress_size);
        }
        primary.split_after = header.flags.split_after();
    }
}

/// Process-wide, path-keyed registry of opened archives (§9), so that
/// concurrent opens of sibling entries in the same archive share the same
/// parsed state.
#[derive(Debug, Default)]
pub struct ArchiveRegistry {
    archives: Mutex<HashMap<PathBuf, Arc<Archive>>>,
}

impl ArchiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_open(&self, path: &Path, only_first: OnlyFirst) -> RarResult<Arc<Archive>> {
        let mut archives = self.archives.lock().unwrap();
        if let Some(existing) = archives.get(path) {
            return Ok(Arc::clone(existing));
        }
        let archive = Arc::new(Archive::open(path, only_first)?);
        archives.insert(path.to_path_buf(), Arc::clone(&archive));
        Ok(archive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Builds a minimal single-volume, single-entry, store-method archive
    /// in memory: signature, MAIN block, FILE block, payload, ENDARC.
    fn build_store_archive(name: &str, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);

        // MAIN block: no flags, no payload.
        push_block(&mut out, 0x73, 0, &[]);

        // FILE block.
        let mut body = Vec::new();
        body.extend_from_slice(&(data.len() as u32).to_le_bytes()); // compress_size
        body.extend_from_slice(&(data.len() as u32).to_le_bytes()); // file_size
        body.push(3); // host_os = unix
        body.extend_from_slice(&0i32.to_le_bytes()); // crc placeholder, fixed below
        body.extend_from_slice(&0u32.to_le_bytes()); // dos_time
        body.push(29); // extract_version
        body.push(STORE_METHOD);
        body.extend_from_slice(&(name.len() as u16).to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes()); // mode
        body.extend_from_slice(name.as_bytes());

        let crc = crc32fast::hash(data);
        body[9..13].copy_from_slice(&(crc as i32).to_le_bytes());

        // LONG_BLOCK flag (payload follows): push add_size then rest.
        let mut long_body = Vec::new();
        long_body.extend_from_slice(&(data.len() as u32).to_le_bytes());
        long_body.extend_from_slice(&body);
        push_block(&mut out, 0x74, 0x8000, &long_body);
        out.extend_from_slice(data);

        out
    }

    fn push_block(out: &mut Vec<u8>, block_type: u8, flags: u16, body: &[u8]) {
        let header_size = (7 + body.len()) as u16;
        let mut crc_data = Vec::new();
        crc_data.push(block_type);
        crc_data.extend_from_slice(&flags.to_le_bytes());
        crc_data.extend_from_slice(&header_size.to_le_bytes());
        if block_type == 0x73 {
            crc_data.extend_from_slice(&body[..body.len().min(6)]);
        } else {
            crc_data.extend_from_slice(body);
        }
        let crc = (crc32fast::hash(&crc_data) & 0xffff) as u16;

        out.extend_from_slice(&crc.to_le_bytes());
        out.push(block_type);
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&header_size.to_le_bytes());
        out.extend_from_slice(body);
    }

    fn write_temp(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::Builder::new().suffix(".rar").tempfile().unwrap();
        f.write_all(bytes).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn parses_single_store_entry() {
        let data = (0u16..1024).map(|b| (b % 256) as u8).collect::<Vec<_>>();
        let bytes = build_store_archive("inner.bin", &data);
        let tmp = write_temp(&bytes);

        let archive = Archive::open(tmp.path(), OnlyFirst::No).unwrap();
        let entry = archive.entry("inner.bin").expect("entry present");
        assert_eq!(entry.file_size, data.len() as u64);
        assert!(entry.is_store());
        assert!(!entry.is_directory);
    }

    #[test]
    fn partial_read_matches_bulk_read() {
        let data = (0u32..4000).map(|b| (b % 251) as u8).collect::<Vec<_>>();
        let bytes = build_store_archive("inner.bin", &data);
        let tmp = write_temp(&bytes);
        let archive = Archive::open(tmp.path(), OnlyFirst::No).unwrap();

        let whole = archive.bulk_read("inner.bin").unwrap();
        assert_eq!(whole, data);
        assert_eq!(crc32fast::hash(&whole), archive.entry("inner.bin").unwrap().crc32 as u32);

        for block_size in [1u64, 7, 64, 4096] {
            let mut collected = Vec::new();
            let mut offset = 0u64;
            while offset < data.len() as u64 {
                let chunk = archive.read_partial("inner.bin", offset, block_size).unwrap();
                if chunk.is_empty() {
                    break;
                }
                collected.extend_from_slice(&chunk);
                offset += block_size;
            }
            assert_eq!(collected, data, "block size {block_size}");
        }
    }

    #[test]
    fn partial_read_at_and_past_eof() {
        let data = vec![7u8; 100];
        let bytes = build_store_archive("f.bin", &data);
        let tmp = write_temp(&bytes);
        let archive = Archive::open(tmp.path(), OnlyFirst::No).unwrap();

        assert_eq!(archive.read_partial("f.bin", 100, 10).unwrap(), Vec::<u8>::new());
        assert_eq!(archive.read_partial("f.bin", 95, 10).unwrap().len(), 5);
    }
}
