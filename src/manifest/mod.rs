use std::collections::BTreeMap;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{SyncError, SyncResult};

const ARCHIVES_KEY: &str = "__archives";

/// One file known to a manifest.
#[derive(Clone, Debug, PartialEq)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
    pub hash: String,
    pub archive_id: Option<u32>,
    pub is_code: bool,
    pub encryption: Option<Value>,
    /// Set from `arcForce` in the archive table.
    pub arc_force: bool,
}

impl FileEntry {
    pub fn new(path: impl Into<String>, size: u64, hash: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            size,
            hash: hash.into(),
            archive_id: None,
            is_code: false,
            encryption: None,
            arc_force: false,
        }
    }
}

/// A compressed bundle covering several manifest entries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArchiveDescriptor {
    pub id: u32,
    pub files: Vec<String>,
    pub exp_size: u64,
    pub arc_size: u64,
    pub forced: bool,
}

impl ArchiveDescriptor {
    /// Location of the archive relative to the content root.
    pub fn remote_path(&self) -> String {
        format!("{ARCHIVES_KEY}/{}.zip", self.id)
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct WireEntry {
    #[serde(default)]
    size: u64,
    hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    encryption: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    is_code: Option<bool>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct WireArchives {
    #[serde(default)]
    files: Vec<WireArchiveRow>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireArchiveRow {
    arcn: u32,
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    hash: String,
    #[serde(default)]
    exp_size: u64,
    #[serde(default)]
    arc_size: u64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    arc_force: bool,
}

/// Versioned map of relative path to file descriptor for one bundle.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Manifest {
    files: BTreeMap<String, FileEntry>,
    archives: BTreeMap<u32, ArchiveDescriptor>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the JSON wire format. The `__archives` table is lifted out of the file map.
    pub fn parse(text: &str) -> SyncResult<Self> {
        let mut root: Map<String, Value> =
            serde_json::from_str(text).map_err(|e| SyncError::parse("manifest", e))?;

        let archive_table = match root.remove(ARCHIVES_KEY) {
            Some(value) => serde_json::from_value::<WireArchives>(value)
                .map_err(|e| SyncError::parse("manifest archives", e))?,
            None => WireArchives::default(),
        };

        let mut manifest = Manifest::new();
        for (path, value) in root {
            let wire: WireEntry = serde_json::from_value(value)
                .map_err(|e| SyncError::parse(&format!("manifest entry {path}"), e))?;
            let entry = FileEntry {
                path: path.clone(),
                size: wire.size,
                hash: wire.hash,
                archive_id: None,
                is_code: wire.is_code.unwrap_or(false),
                encryption: wire.encryption,
                arc_force: false,
            };
            manifest.files.insert(path, entry);
        }

        for row in archive_table.files {
            let archive = manifest
                .archives
                .entry(row.arcn)
                .or_insert_with(|| ArchiveDescriptor {
                    id: row.arcn,
                    ..Default::default()
                });
            archive.exp_size = archive.exp_size.max(row.exp_size);
            archive.arc_size = archive.arc_size.max(row.arc_size);
            archive.forced |= row.arc_force;
            if !archive.files.contains(&row.name) {
                archive.files.push(row.name.clone());
            }
            match manifest.files.get_mut(&row.name) {
                Some(entry) => {
                    entry.archive_id = Some(row.arcn);
                    entry.arc_force = row.arc_force;
                }
                None => debug!(
                    "manifest: archive {} lists {} which has no file entry",
                    row.arcn, row.name
                ),
            }
        }

        Ok(manifest)
    }

    /// Best-effort parse for the locally cached copy: missing or corrupt text is an empty manifest.
    pub fn parse_or_empty(text: Option<&str>) -> Self {
        match text {
            Some(text) => Self::parse(text).unwrap_or_else(|err| {
                warn!("manifest: ignoring unreadable local manifest ({err})");
                Manifest::new()
            }),
            None => Manifest::new(),
        }
    }

    pub fn to_json(&self) -> SyncResult<String> {
        let mut root = Map::new();
        for (path, entry) in &self.files {
            let wire = WireEntry {
                size: entry.size,
                hash: entry.hash.clone(),
                encryption: entry.encryption.clone(),
                is_code: entry.is_code.then_some(true),
            };
            let value =
                serde_json::to_value(wire).map_err(|e| SyncError::parse("manifest entry", e))?;
            root.insert(path.clone(), value);
        }

        let mut rows = Vec::new();
        for archive in self.archives.values() {
            for name in &archive.files {
                let (size, hash, arc_force) = self
                    .files
                    .get(name)
                    .map(|e| (e.size, e.hash.clone(), e.arc_force))
                    .unwrap_or((0, String::new(), false));
                rows.push(WireArchiveRow {
                    arcn: archive.id,
                    name: name.clone(),
                    size,
                    hash,
                    exp_size: archive.exp_size,
                    arc_size: archive.arc_size,
                    arc_force,
                });
            }
        }
        if !rows.is_empty() {
            let table = serde_json::to_value(WireArchives { files: rows })
                .map_err(|e| SyncError::parse("manifest archives", e))?;
            root.insert(ARCHIVES_KEY.to_owned(), table);
        }

        serde_json::to_string_pretty(&Value::Object(root))
            .map_err(|e| SyncError::parse("manifest", e))
    }

    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.files.get(path)
    }

    pub fn insert(&mut self, entry: FileEntry) {
        self.files.insert(entry.path.clone(), entry);
    }

    pub fn remove(&mut self, path: &str) -> Option<FileEntry> {
        self.files.remove(path)
    }

    pub fn archive(&self, id: u32) -> Option<&ArchiveDescriptor> {
        self.archives.get(&id)
    }

    pub fn archives(&self) -> impl Iterator<Item = &ArchiveDescriptor> {
        self.archives.values()
    }

    pub fn set_archives(&mut self, archives: impl IntoIterator<Item = ArchiveDescriptor>) {
        self.archives = archives.into_iter().map(|a| (a.id, a)).collect();
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Compare this (local) manifest against `remote`.
    pub fn diff(&self, remote: &Manifest, filter: &DiffFilter) -> ChangeSet {
        let mut changes = ChangeSet::default();

        for (path, theirs) in &remote.files {
            match self.files.get(path) {
                Some(ours) if ours.hash == theirs.hash => changes.unchanged += 1,
                Some(_) if filter.skips(theirs) => {
                    debug!("diff: keeping local code file {path}, recording remote metadata");
                    changes.unchanged += 1;
                    changes.metadata_only.push(theirs.clone());
                }
                _ => {
                    changes.total_bytes += theirs.size;
                    changes.remote_file_count += 1;
                    changes.remote_byte_count += theirs.size;
                    changes.added.push(theirs.clone());
                }
            }
        }

        changes.removed = self
            .files
            .keys()
            .filter(|path| !remote.files.contains_key(*path))
            .cloned()
            .collect();

        changes
    }
}

/// Controls which hash mismatches are tolerated by [`Manifest::diff`].
#[derive(Clone, Debug)]
pub struct DiffFilter {
    pub omit_code_updates: bool,
    pub entry_document: String,
}

impl Default for DiffFilter {
    fn default() -> Self {
        Self {
            omit_code_updates: false,
            entry_document: "index.html".into(),
        }
    }
}

impl DiffFilter {
    fn skips(&self, entry: &FileEntry) -> bool {
        self.omit_code_updates
            && (entry.is_code || entry.path.ends_with(".js") || entry.path == self.entry_document)
    }
}

#[derive(Clone, Debug, Default)]
pub struct ChangeSet {
    pub added: Vec<FileEntry>,
    pub removed: Vec<String>,
    /// Code files whose update was skipped; only their metadata moves forward.
    pub metadata_only: Vec<FileEntry>,
    pub unchanged: usize,
    pub total_bytes: u64,
    pub remote_file_count: u64,
    pub remote_byte_count: u64,
}

impl ChangeSet {
    #[must_use]
    pub fn is_modified(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty() || !self.metadata_only.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn manifest(entries: &[(&str, &str)]) -> Manifest {
        let mut m = Manifest::new();
        for (path, hash) in entries {
            m.insert(FileEntry::new(*path, 10, *hash));
        }
        m
    }

    fn set(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn diff_detects_added_changed_and_unchanged() {
        let local = manifest(&[("a.js", "h1"), ("b.png", "h2")]);
        let remote = manifest(&[("a.js", "h1"), ("b.png", "h3"), ("c.png", "h4")]);

        let changes = local.diff(&remote, &DiffFilter::default());
        let added: Vec<_> = changes
            .added
            .iter()
            .map(|e| (e.path.as_str(), e.hash.as_str()))
            .collect();
        assert_eq!(added, vec![("b.png", "h3"), ("c.png", "h4")]);
        assert!(changes.removed.is_empty());
        assert_eq!(changes.unchanged, 1);
        assert_eq!(changes.total_bytes, 20);
        assert_eq!(changes.remote_file_count, 2);
        assert!(changes.is_modified());
    }

    #[test]
    fn diff_categories_are_complete_and_disjoint() {
        let local = manifest(&[("keep", "1"), ("gone", "2"), ("edit", "3"), ("old", "4")]);
        let remote = manifest(&[("keep", "1"), ("edit", "x"), ("new", "5"), ("new2", "6")]);

        let changes = local.diff(&remote, &DiffFilter::default());
        let added: HashSet<_> = changes.added.iter().map(|e| e.path.clone()).collect();
        let removed: HashSet<_> = changes.removed.iter().cloned().collect();

        assert_eq!(added.len(), changes.added.len());
        assert_eq!(added, set(&["edit", "new", "new2"]));
        assert_eq!(removed, set(&["gone", "old"]));
        assert!(added.is_disjoint(&removed));
        assert_eq!(changes.unchanged, 1);
    }

    #[test]
    fn diff_against_self_is_empty() {
        let m = manifest(&[("a", "1"), ("b/c.txt", "2")]);
        let changes = m.diff(&m.clone(), &DiffFilter::default());
        assert!(changes.added.is_empty());
        assert!(changes.removed.is_empty());
        assert!(!changes.is_modified());
    }

    #[test]
    fn omit_code_filter_keeps_metadata_only() {
        let local = manifest(&[("game.js", "1"), ("index.html", "1"), ("art.png", "1")]);
        let remote = manifest(&[("game.js", "2"), ("index.html", "2"), ("art.png", "2")]);
        let filter = DiffFilter {
            omit_code_updates: true,
            ..Default::default()
        };

        let changes = local.diff(&remote, &filter);
        assert_eq!(changes.added.len(), 1);
        assert_eq!(changes.added[0].path, "art.png");
        assert_eq!(changes.metadata_only.len(), 2);
        assert_eq!(changes.unchanged, 2);
        assert!(changes.is_modified());
    }

    #[test]
    fn parses_wire_format_with_archive_table() {
        let text = r#"{
            "index.html": { "size": 120, "hash": "aa", "is_code": true },
            "img/a.png": { "size": 300, "hash": "bb", "encryption": { "kind": "xor" } },
            "img/b.png": { "size": 400, "hash": "cc" },
            "__archives": { "files": [
                { "arcn": 1, "name": "img/a.png", "size": 300, "hash": "bb", "expSize": 700, "arcSize": 350, "arcForce": true },
                { "arcn": 1, "name": "img/b.png", "size": 400, "hash": "cc", "expSize": 700, "arcSize": 350 }
            ] }
        }"#;

        let m = Manifest::parse(text).unwrap();
        assert_eq!(m.len(), 3);
        assert!(m.get("__archives").is_none());
        assert!(m.get("index.html").unwrap().is_code);
        let a = m.get("img/a.png").unwrap();
        assert_eq!(a.archive_id, Some(1));
        assert!(a.arc_force);
        assert!(a.encryption.is_some());
        assert!(!m.get("img/b.png").unwrap().arc_force);

        let archive = m.archive(1).unwrap();
        assert_eq!(archive.files, vec!["img/a.png", "img/b.png"]);
        assert_eq!(archive.exp_size, 700);
        assert_eq!(archive.arc_size, 350);
        assert!(archive.forced);
        assert_eq!(archive.remote_path(), "__archives/1.zip");

        let reparsed = Manifest::parse(&m.to_json().unwrap()).unwrap();
        assert_eq!(reparsed, m);
    }

    #[test]
    fn corrupt_local_manifest_is_empty() {
        assert!(Manifest::parse("{not json").is_err());
        assert!(Manifest::parse(r#"{"a": {"size": 1}}"#).is_err());
        assert!(Manifest::parse_or_empty(Some("{not json")).is_empty());
        assert!(Manifest::parse_or_empty(None).is_empty());
    }
}
