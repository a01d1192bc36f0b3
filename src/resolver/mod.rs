//! Name resolution and directory projection (§4.2): maps virtual paths onto
//! either a literal host path or an entry inside a RAR archive, flattening
//! and filtering directories along the way.

pub mod pattern;
pub mod stat;

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use regex::Regex;

use crate::archive::{Archive, ArchiveRegistry, OnlyFirst, volname};
use crate::config::Config;
use crate::error::{Error, RarResult};
use stat::Stat;

/// A virtual path that does not map onto a literal host path: either a
/// flattened host file/directory, or an entry living inside a RAR archive.
#[derive(Debug, Clone)]
pub enum VfsEntry {
    /// A host file or directory reachable at a different real path because
    /// an ancestor directory was flattened away.
    Plain { realpath: PathBuf },
    /// An entry inside a RAR archive, addressed by its in-archive name.
    Rar {
        archive_path: PathBuf,
        archive: Arc<Archive>,
        entry_name: String,
    },
}

/// Where [`crate::fs`] should read an open file's bytes from.
pub enum OpenTarget {
    Host(PathBuf),
    Store { archive: Arc<Archive>, entry_name: String },
    Compressed {
        archive: Arc<Archive>,
        archive_path: PathBuf,
        entry_name: String,
    },
}

/// Strip a leading `/` so a virtual path can be joined onto the source
/// root without `Path::join` discarding the root.
fn relativize(path: &Path) -> &Path {
    path.strip_prefix("/").unwrap_or(path)
}

fn join_vpath(base: &Path, name: &str) -> PathBuf {
    base.join(name)
}

/// The basename of a RAR-internal filename, which uses `\` as its path
/// separator.
fn interior_basename(name: &str) -> &str {
    name.rsplit('\\').next().unwrap_or(name)
}

pub struct Resolver {
    source_root: PathBuf,
    filter_patterns: Vec<Regex>,
    flatten_patterns: Vec<Regex>,
    only_first: OnlyFirst,
    enable_unrar: bool,
    registry: ArchiveRegistry,
    vfs: Mutex<HashMap<PathBuf, VfsEntry>>,
    could_exist_cache: Mutex<HashMap<PathBuf, bool>>,
}

impl Resolver {
    pub fn new(config: &Config) -> Self {
        Resolver {
            source_root: config.source_dir.clone(),
            filter_patterns: pattern::load(config.filter.as_deref()),
            flatten_patterns: pattern::load(config.flatten.as_deref()),
            only_first: config.only_first,
            enable_unrar: config.enable_unrar,
            registry: ArchiveRegistry::new(),
            vfs: Mutex::new(HashMap::new()),
            could_exist_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    fn host_path(&self, vpath: &Path) -> PathBuf {
        self.source_root.join(relativize(vpath))
    }

    fn should_be_filtered(&self, name: &str) -> bool {
        pattern::any_matches(&self.filter_patterns, name) || volname::is_rar_name(name)
    }

    fn should_be_flattened(&self, real_dir: &Path, name: &str) -> bool {
        let host = self.host_path(&join_vpath(real_dir, name));
        host.is_dir() && pattern::any_matches(&self.flatten_patterns, name)
    }

    fn is_first_rar_file(&self, name: &str) -> bool {
        volname::is_first_volume(name)
    }

    /// Does `vpath` plausibly exist, i.e. does no path component hide it
    /// through a filter or flatten pattern? Cached, since `getattr` and
    /// `readdir` both consult it on every call (§4.2).
    pub fn could_exist(&self, vpath: &Path) -> bool {
        if let Some(cached) = self.could_exist_cache.lock().unwrap().get(vpath) {
            return *cached;
        }

        let name = vpath
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();

        let result = if self.should_be_filtered(name) {
            false
        } else {
            let host = self.host_path(vpath);
            !(host.is_dir() && pattern::any_matches(&self.flatten_patterns, name))
        };

        self.could_exist_cache
            .lock()
            .unwrap()
            .insert(vpath.to_path_buf(), result);
        result
    }

    /// Recursively flatten `real_dir`, returning `(real_parent_dir, name)`
    /// pairs for everything that should appear directly inside it once
    /// flattened directories are skipped.
    fn readdir_flattened(&self, real_dir: &Path) -> RarResult<Vec<(PathBuf, String)>> {
        let mut out = Vec::new();
        let host_dir = self.host_path(real_dir);

        let mut names: Vec<String> = fs::read_dir(&host_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();

        for name in names {
            if self.should_be_filtered(&name) && !self.is_first_rar_file(&name) {
                continue;
            }
            if self.should_be_flattened(real_dir, &name) {
                let sub_dir = join_vpath(real_dir, &name);
                out.extend(self.readdir_flattened(&sub_dir)?);
            } else {
                out.push((real_dir.to_path_buf(), name));
            }
        }

        Ok(out)
    }

    /// Open the archive at `archive_vpath` (if not already cached) and
    /// register each of its visible entries under `vpath`, returning their
    /// names (§4.2).
    fn readdir_rar(&self, vpath: &Path, archive_vpath: &Path) -> RarResult<Vec<String>> {
        let archive_host_path = self.host_path(archive_vpath);
        let archive = self
            .registry
            .get_or_open(&archive_host_path, self.only_first)?;

        let mut names = Vec::new();
        let mut vfs = self.vfs.lock().unwrap();

        for entry in archive.entries() {
            if !entry.is_store() && !self.enable_unrar {
                continue;
            }

            let basename = interior_basename(&entry.filename);
            if self.should_be_filtered(basename) {
                continue;
            }

            let entry_vpath = join_vpath(vpath, basename);
            vfs.insert(
                entry_vpath,
                VfsEntry::Rar {
                    archive_path: archive_host_path.clone(),
                    archive: Arc::clone(&archive),
                    entry_name: entry.filename.clone(),
                },
            );
            names.push(basename.to_string());
        }

        Ok(names)
    }

    /// List the entries that should appear directly under `vpath`,
    /// registering flattened and archive-interior entries in the VFS table
    /// as a side effect (§4.2). Does not include `.`/`..`.
    pub fn readdir(&self, vpath: &Path) -> RarResult<Vec<String>> {
        let host = self.host_path(vpath);

        let realpath = if host.is_dir() {
            vpath.to_path_buf()
        } else {
            let vfs = self.vfs.lock().unwrap();
            match vfs.get(vpath) {
                Some(VfsEntry::Plain { realpath }) => realpath.clone(),
                Some(VfsEntry::Rar { archive_path, .. }) => archive_path.clone(),
                None => return Err(Error::NoSuchEntry(vpath.display().to_string())),
            }
        };

        let real_host_dir = self.host_path(&realpath);
        let mut entries: Vec<String> = fs::read_dir(&real_host_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        entries.sort();

        let mut names = Vec::new();
        for name in entries {
            if self.should_be_filtered(&name) && !self.is_first_rar_file(&name) {
                continue;
            }

            if self.should_be_flattened(&realpath, &name) {
                let sub_dir = join_vpath(&realpath, &name);
                for (path_sub, e_sub) in self.readdir_flattened(&sub_dir)? {
                    if self.is_first_rar_file(&e_sub) {
                        let archive_vpath = join_vpath(&path_sub, &e_sub);
                        names.extend(self.readdir_rar(vpath, &archive_vpath)?);
                    } else {
                        let realpath_sub = join_vpath(&path_sub, &e_sub);
                        self.vfs
                            .lock()
                            .unwrap()
                            .insert(join_vpath(vpath, &e_sub), VfsEntry::Plain { realpath: realpath_sub });
                        names.push(e_sub);
                    }
                }
            } else if self.is_first_rar_file(&name) {
                let archive_vpath = join_vpath(&realpath, &name);
                names.extend(self.readdir_rar(vpath, &archive_vpath)?);
            } else {
                names.push(name);
            }
        }

        Ok(names)
    }

    /// Compute the stat for `vpath` (§4.2). `Ok(None)` means the entry does
    /// not (or no longer) exists.
    pub fn getattr(&self, vpath: &Path) -> RarResult<Option<Stat>> {
        if !self.could_exist(vpath) {
            return Ok(None);
        }

        let host = self.host_path(vpath);
        if host.exists() {
            return Ok(Some(stat::host_stat(&host)?));
        }

        if !self.vfs.lock().unwrap().contains_key(vpath) {
            if let Some(parent) = vpath.parent() {
                // Populate the VFS table as a side effect, same as listing
                // the parent directory would.
                let _ = self.readdir(parent);
            }
        }

        let entry = self.vfs.lock().unwrap().get(vpath).cloned();
        let Some(entry) = entry else {
            return Ok(None);
        };

        let result = match &entry {
            VfsEntry::Plain { realpath } => {
                let host = self.host_path(realpath);
                if host.exists() {
                    Some(stat::host_stat(&host)?)
                } else {
                    None
                }
            }
            VfsEntry::Rar {
                archive_path,
                archive,
                entry_name,
            } => {
                if archive_path.exists() {
                    let rar_entry = archive
                        .entry(entry_name)
                        .ok_or_else(|| Error::NoSuchEntry(entry_name.clone()))?;
                    Some(stat::rar_stat(archive_path, rar_entry)?)
                } else {
                    None
                }
            }
        };

        if result.is_none() {
            self.vfs.lock().unwrap().remove(vpath);
        }

        Ok(result)
    }

    /// Resolve `vpath` to wherever [`crate::fs`] should actually read bytes
    /// from when it's opened.
    pub fn resolve_open(&self, vpath: &Path) -> RarResult<OpenTarget> {
        let host = self.host_path(vpath);
        if host.exists() {
            return Ok(OpenTarget::Host(host));
        }

        let vfs = self.vfs.lock().unwrap();
        match vfs.get(vpath) {
            Some(VfsEntry::Plain { realpath }) => Ok(OpenTarget::Host(self.host_path(realpath))),
            Some(VfsEntry::Rar {
                archive_path,
                archive,
                entry_name,
            }) => {
                let rar_entry = archive
                    .entry(entry_name)
                    .ok_or_else(|| Error::NoSuchEntry(entry_name.clone()))?;
                if rar_entry.is_store() {
                    Ok(OpenTarget::Store {
                        archive: Arc::clone(archive),
                        entry_name: entry_name.clone(),
                    })
                } else if self.enable_unrar {
                    Ok(OpenTarget::Compressed {
                        archive: Arc::clone(archive),
                        archive_path: archive_path.clone(),
                        entry_name: entry_name.clone(),
                    })
                } else {
                    Err(Error::NotSupported)
                }
            }
            None => Err(Error::NoSuchEntry(vpath.display().to_string())),
        }
    }

    pub fn readlink(&self, vpath: &Path) -> io::Result<PathBuf> {
        fs::read_link(self.host_path(vpath))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;

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

    #[test]
    fn passthrough_host_file_is_visible() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("plain.txt"), b"hi").unwrap();

        let resolver = Resolver::new(&make_config(dir.path().to_path_buf()));
        let names = resolver.readdir(Path::new("/")).unwrap();
        assert_eq!(names, vec!["plain.txt".to_string()]);

        let stat = resolver.getattr(Path::new("/plain.txt")).unwrap();
        assert!(stat.is_some());
    }

    #[test]
    fn filtered_name_is_hidden() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("secret.txt"), b"hi").unwrap();

        let mut filter_file = tempfile::NamedTempFile::new().unwrap();
        writeln!(filter_file, "^secret").unwrap();

        let mut config = make_config(dir.path().to_path_buf());
        config.filter = Some(filter_file.path().to_path_buf());
        let resolver = Resolver::new(&config);

        assert!(resolver.readdir(Path::new("/")).unwrap().is_empty());
        assert!(!resolver.could_exist(Path::new("/secret.txt")));
    }

    #[test]
    fn flattened_directory_promotes_children() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("Season 1");
        fs::create_dir(&sub).unwrap();
        fs::write(sub.join("episode.mkv"), b"hi").unwrap();

        let mut flatten_file = tempfile::NamedTempFile::new().unwrap();
        writeln!(flatten_file, "^Season").unwrap();

        let mut config = make_config(dir.path().to_path_buf());
        config.flatten = Some(flatten_file.path().to_path_buf());
        let resolver = Resolver::new(&config);

        let names = resolver.readdir(Path::new("/")).unwrap();
        assert_eq!(names, vec!["episode.mkv".to_string()]);

        let stat = resolver.getattr(Path::new("/episode.mkv")).unwrap();
        assert!(stat.is_some());
    }
}
