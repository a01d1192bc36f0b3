//! End-to-end coverage of the projection: a source tree containing a
//! plain file and a RAR archive, read back through [`rardirfs::resolver`]
//! and [`rardirfs::archive`] the way [`rardirfs::fs`] would (§8,
//! end-to-end scenarios 1 and 3).

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use rardirfs::archive::block::MAGIC;
use rardirfs::archive::{Archive, OnlyFirst};
use rardirfs::config::Config;
use rardirfs::resolver::Resolver;

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

fn file_header_body(name: &str, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&(data.len() as u32).to_le_bytes()); // compress_size
    body.extend_from_slice(&(data.len() as u32).to_le_bytes()); // file_size
    body.push(3); // host_os = unix
    let crc = crc32fast::hash(data);
    body.extend_from_slice(&(crc as i32).to_le_bytes());
    body.extend_from_slice(&0u32.to_le_bytes()); // dos_time
    body.push(29); // extract_version
    body.push(0x30); // STORE_METHOD
    body.extend_from_slice(&(name.len() as u16).to_le_bytes());
    body.extend_from_slice(&0u32.to_le_bytes()); // mode
    body.extend_from_slice(name.as_bytes());
    body
}

/// A single-volume archive storing one store-method entry.
fn build_single_volume_archive(name: &str, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    push_block(&mut out, 0x73, 0, &[]);

    let body = file_header_body(name, data);
    let mut long_body = Vec::new();
    long_body.extend_from_slice(&(data.len() as u32).to_le_bytes());
    long_body.extend_from_slice(&body);
    push_block(&mut out, 0x74, 0x8000, &long_body);
    out.extend_from_slice(data);

    out
}

fn make_config(source_dir: PathBuf) -> Config {
    Config {
        source_dir,
        mountpoint: PathBuf::from("/mnt/unused"),
        filter: None,
        flatten: None,
        only_first: OnlyFirst::Auto,
        enable_unrar: false,
        cache_dir: None,
        foreground: false,
    }
}

fn write_filter_file(dir: &Path, pattern: &str) -> PathBuf {
    let path = dir.join("filter.txt");
    let mut f = fs::File::create(&path).unwrap();
    writeln!(f, "{pattern}").unwrap();
    path
}

/// Scenario 1 (§8): a plain file alongside a store-method archive; the
/// archive itself is invisible, its entry appears in its place.
#[test]
fn archive_entries_replace_the_archive_in_the_listing() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("a.txt"), b"hello\n").unwrap();

    let data: Vec<u8> = (0..4).flat_map(|_| (0u16..256).map(|b| b as u8)).collect();
    let archive_bytes = build_single_volume_archive("inner.bin", &data);
    fs::write(dir.path().join("pack.rar"), &archive_bytes).unwrap();

    let resolver = Resolver::new(&make_config(dir.path().to_path_buf()));

    let mut names = resolver.readdir(Path::new("/")).unwrap();
    names.sort();
    assert_eq!(names, vec!["a.txt".to_string(), "inner.bin".to_string()]);

    let stat = resolver.getattr(Path::new("/inner.bin")).unwrap().unwrap();
    assert_eq!(stat.size, 1024);

    let target = resolver.resolve_open(Path::new("/inner.bin")).unwrap();
    let bytes = match target {
        rardirfs::resolver::OpenTarget::Store { archive, entry_name } => {
            archive.read_partial(&entry_name, 0, 1024).unwrap()
        }
        _ => panic!("expected a store entry"),
    };
    assert_eq!(bytes, data);
    assert_eq!(crc32fast::hash(&bytes), Archive::open(dir.path().join("pack.rar"), OnlyFirst::No).unwrap().entry("inner.bin").unwrap().crc32 as u32);
}

/// Scenario 3 (§8): a filtered plain file disappears from both
/// `getattr` and `readdir`.
#[test]
fn filtered_file_is_not_found_and_not_listed() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("sample.txt"), vec![b'x'; 500]).unwrap();
    let filter_path = write_filter_file(dir.path(), r"^sample\..*$");

    let mut config = make_config(dir.path().to_path_buf());
    config.filter = Some(filter_path);
    let resolver = Resolver::new(&config);

    assert!(resolver.getattr(Path::new("/sample.txt")).unwrap().is_none());
    assert!(resolver.readdir(Path::new("/")).unwrap().is_empty());
}

/// Boundary behavior (§8): a filter-matching name that also looks like
/// the first volume of a RAR archive is not hidden — it is replaced by
/// its contents instead.
#[test]
fn filtered_name_that_is_a_first_volume_still_expands() {
    let dir = tempfile::tempdir().unwrap();
    let data = b"archive contents".to_vec();
    let archive_bytes = build_single_volume_archive("payload.bin", &data);
    // ".rar" also happens to satisfy a filter pattern matching anything
    // ending in "ar.rar" style names — use a pattern matching the whole
    // basename to prove the RAR-name override, not an absent match.
    fs::write(dir.path().join("stuff.rar"), &archive_bytes).unwrap();
    let filter_path = write_filter_file(dir.path(), r"^stuff\.rar$");

    let mut config = make_config(dir.path().to_path_buf());
    config.filter = Some(filter_path);
    let resolver = Resolver::new(&config);

    let names = resolver.readdir(Path::new("/")).unwrap();
    assert_eq!(names, vec!["payload.bin".to_string()]);
}

/// Round-trip law (§8): concatenating `read_partial` at any block size
/// reconstructs `bulk_read`, and the result's CRC matches the entry.
#[test]
fn partial_read_roundtrip_law_holds_for_several_block_sizes() {
    let dir = tempfile::tempdir().unwrap();
    let data: Vec<u8> = (0u32..5000).map(|b| (b % 253) as u8).collect();
    let archive_bytes = build_single_volume_archive("f.bin", &data);
    let path = dir.path().join("f.rar");
    fs::write(&path, &archive_bytes).unwrap();

    let archive = Archive::open(&path, OnlyFirst::No).unwrap();
    let bulk = archive.bulk_read("f.bin").unwrap();
    assert_eq!(bulk, data);
    assert_eq!(crc32fast::hash(&bulk), archive.entry("f.bin").unwrap().crc32 as u32);

    for block_size in [1u64, 3, 17, 512, 8192] {
        let mut collected = Vec::new();
        let mut offset = 0u64;
        loop {
            let chunk = archive.read_partial("f.bin", offset, block_size).unwrap();
            if chunk.is_empty() {
                break;
            }
            offset += chunk.len() as u64;
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, bulk[..collected.len()], "block size {block_size}");
        assert_eq!(collected.len(), bulk.len());
    }
}
