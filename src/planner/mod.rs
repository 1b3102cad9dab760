use std::collections::{BTreeMap, HashSet};

use log::debug;

use crate::manifest::{ArchiveDescriptor, FileEntry};

/// How aggressively pending files are consolidated into archive downloads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ArchivePolicy {
    /// Never fetch archives; every file is downloaded on its own.
    Disabled,
    /// Fetch an archive only when a pending member carries the force flag.
    #[default]
    ForcedOnly,
    /// Fetch an archive whenever any pending file belongs to it.
    Always,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlannedArchive {
    pub descriptor: ArchiveDescriptor,
    /// Pending files this archive satisfies.
    pub pending: Vec<FileEntry>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PlannedItem {
    File(FileEntry),
    Archive(PlannedArchive),
}

impl PlannedItem {
    pub fn label(&self) -> String {
        match self {
            PlannedItem::File(entry) => entry.path.clone(),
            PlannedItem::Archive(archive) => archive.descriptor.remote_path(),
        }
    }

    /// Uncompressed bytes this item contributes once complete.
    pub fn content_bytes(&self) -> u64 {
        match self {
            PlannedItem::File(entry) => entry.size,
            PlannedItem::Archive(archive) => archive.descriptor.exp_size,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DownloadPlan {
    pub items: Vec<PlannedItem>,
    /// Uncompressed content bytes, used for progress.
    pub total_bytes: u64,
    /// Content plus compressed archive bytes, both of which live on disk during extraction.
    pub space_needed: u64,
}

impl DownloadPlan {
    /// Every pending path this plan delivers, directly or through an archive.
    pub fn covered_paths(&self) -> HashSet<String> {
        let mut covered = HashSet::new();
        for item in &self.items {
            match item {
                PlannedItem::File(entry) => {
                    covered.insert(entry.path.clone());
                }
                PlannedItem::Archive(archive) => {
                    covered.extend(archive.descriptor.files.iter().cloned());
                }
            }
        }
        covered
    }
}

/// Decide which archives to fetch whole and which files to fetch individually.
pub fn plan_downloads<'a>(
    pending: &[FileEntry],
    archives: impl IntoIterator<Item = &'a ArchiveDescriptor>,
    policy: ArchivePolicy,
) -> DownloadPlan {
    let known: BTreeMap<u32, &ArchiveDescriptor> = if policy == ArchivePolicy::Disabled {
        BTreeMap::new()
    } else {
        archives.into_iter().map(|a| (a.id, a)).collect()
    };
    let archive_of = |entry: &FileEntry| entry.archive_id.filter(|id| known.contains_key(id));

    let mut plan = DownloadPlan::default();
    let mut loose_bytes = 0u64;

    for entry in pending.iter().filter(|e| archive_of(e).is_none()) {
        loose_bytes += entry.size;
        plan.items.push(PlannedItem::File(entry.clone()));
    }

    let mut selected: Vec<u32> = Vec::new();
    let mut registered: BTreeMap<u32, Vec<FileEntry>> = BTreeMap::new();
    let mut deferred: Vec<&FileEntry> = Vec::new();
    let mut archive_exp = 0u64;
    let mut archive_arc = 0u64;

    for entry in pending {
        let Some(id) = archive_of(entry) else {
            continue;
        };
        registered.entry(id).or_default().push(entry.clone());
        if selected.contains(&id) {
            continue;
        }
        if policy == ArchivePolicy::ForcedOnly && !entry.arc_force {
            deferred.push(entry);
            continue;
        }
        let descriptor = known[&id];
        debug!(
            "planner: selecting archive {} ({} files) via {}",
            id,
            descriptor.files.len(),
            entry.path
        );
        archive_exp += descriptor.exp_size;
        archive_arc += descriptor.arc_size;
        selected.push(id);
    }

    for entry in deferred {
        let id = entry.archive_id.unwrap_or_default();
        if !selected.contains(&id) {
            loose_bytes += entry.size;
            plan.items.push(PlannedItem::File(entry.clone()));
        }
    }

    for id in selected {
        plan.items.push(PlannedItem::Archive(PlannedArchive {
            descriptor: known[&id].clone(),
            pending: registered.remove(&id).unwrap_or_default(),
        }));
    }

    plan.total_bytes = loose_bytes + archive_exp;
    plan.space_needed = plan.total_bytes + archive_arc;
    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, size: u64, archive: Option<u32>, force: bool) -> FileEntry {
        FileEntry {
            archive_id: archive,
            arc_force: force,
            ..FileEntry::new(path, size, "h")
        }
    }

    fn archive(id: u32, files: &[&str], exp: u64, arc: u64) -> ArchiveDescriptor {
        ArchiveDescriptor {
            id,
            files: files.iter().map(|f| f.to_string()).collect(),
            exp_size: exp,
            arc_size: arc,
            forced: false,
        }
    }

    fn archive_ids(plan: &DownloadPlan) -> Vec<u32> {
        plan.items
            .iter()
            .filter_map(|i| match i {
                PlannedItem::Archive(a) => Some(a.descriptor.id),
                _ => None,
            })
            .collect()
    }

    fn loose_paths(plan: &DownloadPlan) -> Vec<String> {
        plan.items
            .iter()
            .filter_map(|i| match i {
                PlannedItem::File(f) => Some(f.path.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn forced_member_pulls_whole_archive() {
        let archives = [archive(1, &["f", "g"], 300, 120)];
        let pending = [file("g", 200, Some(1), false), file("f", 100, Some(1), true)];

        let plan = plan_downloads(&pending, &archives, ArchivePolicy::ForcedOnly);
        assert_eq!(archive_ids(&plan), vec![1]);
        assert!(loose_paths(&plan).is_empty());
        assert_eq!(plan.total_bytes, 300);
        assert_eq!(plan.space_needed, 420);
        match &plan.items[0] {
            PlannedItem::Archive(a) => assert_eq!(a.pending.len(), 2),
            other => panic!("unexpected item {other:?}"),
        }
    }

    #[test]
    fn unforced_members_download_individually() {
        let archives = [archive(1, &["f", "g", "h"], 900, 400)];
        let pending = [file("f", 100, Some(1), false), file("g", 50, Some(1), false)];

        let plan = plan_downloads(&pending, &archives, ArchivePolicy::ForcedOnly);
        assert!(archive_ids(&plan).is_empty());
        assert_eq!(loose_paths(&plan), vec!["f", "g"]);
        assert_eq!(plan.total_bytes, 150);
        assert_eq!(plan.space_needed, 150);
    }

    #[test]
    fn always_policy_selects_each_archive_once() {
        let archives = [archive(1, &["a", "b"], 30, 10), archive(2, &["c"], 5, 2)];
        let pending = [
            file("a", 10, Some(1), false),
            file("b", 20, Some(1), false),
            file("c", 5, Some(2), false),
            file("d", 7, None, false),
        ];

        let plan = plan_downloads(&pending, &archives, ArchivePolicy::Always);
        assert_eq!(archive_ids(&plan), vec![1, 2]);
        assert_eq!(loose_paths(&plan), vec!["d"]);
        assert_eq!(plan.total_bytes, 7 + 30 + 5);
        assert_eq!(plan.space_needed, 7 + 30 + 5 + 10 + 2);
    }

    #[test]
    fn disabled_policy_and_unknown_archives_fall_back_to_files() {
        let archives = [archive(1, &["a"], 10, 5)];
        let pending = [file("a", 10, Some(1), true), file("z", 3, Some(9), true)];

        let plan = plan_downloads(&pending, &archives, ArchivePolicy::Disabled);
        assert_eq!(loose_paths(&plan), vec!["a", "z"]);

        let plan = plan_downloads(&pending, &archives, ArchivePolicy::ForcedOnly);
        assert_eq!(loose_paths(&plan), vec!["z"]);
        assert_eq!(archive_ids(&plan), vec![1]);
    }

    #[test]
    fn every_pending_file_is_covered() {
        let archives = [
            archive(1, &["a1", "a2", "a3"], 60, 20),
            archive(2, &["b1", "b2"], 40, 15),
        ];
        let candidates = [
            ("a1", Some(1)),
            ("a2", Some(1)),
            ("a3", Some(1)),
            ("b1", Some(2)),
            ("b2", Some(2)),
            ("loose", None),
        ];

        // Walk every subset of pending files and every force mask over them.
        for subset in 1u32..(1 << candidates.len()) {
            for force_mask in [0u32, subset, subset & 0b1010, subset & 0b0101] {
                let pending: Vec<FileEntry> = candidates
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| subset & (1 << i) != 0)
                    .map(|(i, (path, arc))| file(path, 10, *arc, force_mask & (1 << i) != 0))
                    .collect();
                for policy in [
                    ArchivePolicy::Disabled,
                    ArchivePolicy::ForcedOnly,
                    ArchivePolicy::Always,
                ] {
                    let plan = plan_downloads(&pending, &archives, policy);
                    let covered = plan.covered_paths();
                    for entry in &pending {
                        assert!(
                            covered.contains(&entry.path),
                            "{} dropped under {policy:?}",
                            entry.path
                        );
                    }
                    let ids = archive_ids(&plan);
                    for entry in &pending {
                        if let Some(id) = entry.archive_id {
                            let loose = loose_paths(&plan).contains(&entry.path);
                            assert!(!(loose && ids.contains(&id)), "{} fetched twice", entry.path);
                        }
                    }
                }
            }
        }
    }
}
