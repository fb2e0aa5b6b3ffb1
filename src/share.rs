//! The share index contract between the engine and its host.
//!
//! The engine never walks the disk itself: the host hands it an object that
//! can look up, search and enumerate the shared files, and the engine turns
//! the results into wire listings.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::peer::codec::{Directory, FileAttribute, FileEntry};

/// One shared file as the host indexes it.
#[derive(Clone, Debug)]
pub struct SharedFile {
    /// The path peers see, backslash separated (`folder\song.mp3`).
    pub shared_path: String,
    /// Where the bytes actually live.
    pub local_path: PathBuf,
    pub size: u64,
    pub extension: String,
    pub attributes: Vec<FileAttribute>,
}

impl SharedFile {
    /// The folder part of the shared path, up to the last backslash.
    pub fn folder(&self) -> &str {
        match self.shared_path.rfind('\\') {
            Some(pos) => &self.shared_path[..pos],
            None => "",
        }
    }

    pub(crate) fn to_entry(&self) -> FileEntry {
        FileEntry {
            name: self.shared_path.clone(),
            size: self.size,
            extension: self.extension.clone(),
            attributes: self.attributes.clone(),
        }
    }
}

/// Counts announced to the server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShareStats {
    pub folders: u32,
    pub files: u32,
}

/// The host-supplied share index.
pub trait ShareManager: Send + Sync + 'static {
    /// Resolves a shared path to its file, if shared.
    fn lookup(&self, shared_path: &str) -> Option<SharedFile>;

    /// All shared files matching the query.
    fn search(&self, query: &str) -> Vec<SharedFile>;

    /// The full listing, one entry per shared folder.
    fn browse(&self) -> Vec<(String, Vec<SharedFile>)>;

    fn stats(&self) -> ShareStats;
}

/// Groups shared files into the wire level listing.
pub(crate) fn to_directories(groups: Vec<(String, Vec<SharedFile>)>) -> Vec<Directory> {
    groups
        .into_iter()
        .map(|(name, files)| Directory {
            name,
            files: files.iter().map(SharedFile::to_entry).collect(),
        })
        .collect()
}

/// A static in-memory share index. Enough for hosts with a prebuilt index
/// and for tests.
#[derive(Default)]
pub struct InMemoryShares {
    files: Vec<SharedFile>,
}

impl InMemoryShares {
    pub fn new(files: Vec<SharedFile>) -> Self {
        Self { files }
    }
}

impl ShareManager for InMemoryShares {
    fn lookup(&self, shared_path: &str) -> Option<SharedFile> {
        self.files.iter().find(|f| f.shared_path == shared_path).cloned()
    }

    /// Every whitespace separated term must appear in the shared path,
    /// case-insensitively.
    fn search(&self, query: &str) -> Vec<SharedFile> {
        let terms: Vec<String> = query
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .collect();
        if terms.is_empty() {
            return Vec::new();
        }
        self.files
            .iter()
            .filter(|f| {
                let path = f.shared_path.to_lowercase();
                terms.iter().all(|t| path.contains(t.as_str()))
            })
            .cloned()
            .collect()
    }

    fn browse(&self) -> Vec<(String, Vec<SharedFile>)> {
        let mut groups: BTreeMap<String, Vec<SharedFile>> = BTreeMap::new();
        for file in &self.files {
            groups
                .entry(file.folder().to_owned())
                .or_default()
                .push(file.clone());
        }
        groups.into_iter().collect()
    }

    fn stats(&self) -> ShareStats {
        let folders = self
            .files
            .iter()
            .map(SharedFile::folder)
            .collect::<std::collections::BTreeSet<_>>()
            .len() as u32;
        ShareStats {
            folders,
            files: self.files.len() as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shares() -> InMemoryShares {
        InMemoryShares::new(vec![
            SharedFile {
                shared_path: "music\\jazz\\miles.mp3".to_owned(),
                local_path: "/srv/music/jazz/miles.mp3".into(),
                size: 1000,
                extension: "mp3".to_owned(),
                attributes: vec![],
            },
            SharedFile {
                shared_path: "music\\rock\\zeppelin.flac".to_owned(),
                local_path: "/srv/music/rock/zeppelin.flac".into(),
                size: 2000,
                extension: "flac".to_owned(),
                attributes: vec![],
            },
        ])
    }

    #[test]
    fn lookup_is_exact() {
        let s = shares();
        assert!(s.lookup("music\\jazz\\miles.mp3").is_some());
        assert!(s.lookup("music\\jazz\\MILES.mp3").is_none());
    }

    #[test]
    fn search_matches_all_terms_case_insensitively() {
        let s = shares();
        assert_eq!(s.search("MILES jazz").len(), 1);
        assert_eq!(s.search("music").len(), 2);
        assert_eq!(s.search("miles rock").len(), 0);
        assert_eq!(s.search("   ").len(), 0);
    }

    #[test]
    fn browse_groups_by_folder() {
        let s = shares();
        let groups = s.browse();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "music\\jazz");
        assert_eq!(s.stats(), ShareStats { folders: 2, files: 2 });
    }
}
