use std::fs as std_fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use log::{debug, info};
use sha2::{Digest, Sha256};
use tar::Archive;
use tokio::fs;
use walkdir::WalkDir;
use zip::read::ZipArchive;

use crate::error::{SyncError, SyncResult};

const TEMP_SUFFIX: &str = ".tmp";

/// File access rooted at one application's local directory.
#[derive(Clone, Debug)]
pub struct StorageManager {
    root: PathBuf,
}

impl StorageManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a manifest-relative path, refusing anything that escapes the root.
    pub fn path_for(&self, relative: &str) -> SyncResult<PathBuf> {
        let rel = Path::new(relative);
        let clean = !relative.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !clean {
            return Err(SyncError::InvalidArgument(format!(
                "path escapes content root: {relative}"
            )));
        }
        Ok(self.root.join(rel))
    }

    /// Sibling used for partial downloads and atomic writes.
    pub fn temp_path(&self, relative: &str) -> SyncResult<PathBuf> {
        Ok(temp_sibling(&self.path_for(relative)?))
    }

    /// Read a file, returning `None` when it does not exist.
    pub async fn read_text(&self, relative: &str) -> SyncResult<Option<String>> {
        let path = self.path_for(relative)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(SyncError::io(&format!("read {}", path.display()), err)),
        }
    }

    /// Write through a temp sibling and rename, so a crash never leaves a torn file.
    pub async fn write_atomic(&self, relative: &str, bytes: &[u8]) -> SyncResult<()> {
        let path = self.path_for(relative)?;
        let tmp = temp_sibling(&path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::io("create parent dir", e))?;
        }
        fs::write(&tmp, bytes)
            .await
            .map_err(|e| SyncError::io(&format!("write {}", tmp.display()), e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| SyncError::io(&format!("rename into {}", path.display()), e))
    }

    /// Move a completed download from its temp sibling into place.
    pub async fn commit_temp(&self, relative: &str) -> SyncResult<()> {
        let path = self.path_for(relative)?;
        fs::rename(temp_sibling(&path), &path)
            .await
            .map_err(|e| SyncError::io(&format!("commit {}", path.display()), e))
    }

    /// Delete a file and any partial-download sibling. Missing files are fine.
    pub async fn delete_file(&self, relative: &str) -> SyncResult<()> {
        let path = self.path_for(relative)?;
        for target in [temp_sibling(&path), path] {
            match fs::remove_file(&target).await {
                Ok(()) => debug!("storage: deleted {}", target.display()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(SyncError::io(&format!("delete {}", target.display()), err));
                }
            }
        }
        Ok(())
    }

    /// Extract `archive` into the root on the blocking pool; returns extracted relative paths.
    pub async fn decompress(&self, archive: PathBuf) -> SyncResult<Vec<String>> {
        let dest = self.root.clone();
        tokio::task::spawn_blocking(move || extract_archive(&archive, &dest))
            .await
            .map_err(|e| SyncError::Decompression(format!("extract task failed: {e}")))?
    }

    /// Remove everything under the root; returns the bytes released.
    pub async fn remove_all(&self) -> SyncResult<u64> {
        let root = self.root.clone();
        if fs::metadata(&root).await.is_err() {
            return Ok(0);
        }
        let freed = tokio::task::spawn_blocking(move || dir_size(&root))
            .await
            .unwrap_or(0);
        fs::remove_dir_all(&self.root)
            .await
            .map_err(|e| SyncError::io(&format!("remove {}", self.root.display()), e))?;
        info!(
            "storage: removed {} ({} bytes)",
            self.root.display(),
            freed
        );
        Ok(freed)
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

/// Lower-case hex SHA-256 of a file's contents.
pub fn content_hash(path: &Path) -> SyncResult<String> {
    let mut file =
        std_fs::File::open(path).map_err(|e| SyncError::io("checksum open", e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let read = file
            .read(&mut buf)
            .map_err(|e| SyncError::io("checksum read", e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Manifest hashes are opaque; only ones shaped like a SHA-256 digest can be checked locally.
pub fn is_verifiable_hash(hash: &str) -> bool {
    hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_hexdigit())
}

fn dir_size(root: &Path) -> u64 {
    WalkDir::new(root)
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ArchiveKind {
    TarGz,
    Zip,
}

fn sniff_archive_kind(path: &Path) -> SyncResult<ArchiveKind> {
    let mut magic = [0u8; 4];
    let mut file =
        std_fs::File::open(path).map_err(|e| SyncError::Decompression(format!("open: {e}")))?;
    file.read_exact(&mut magic)
        .map_err(|e| SyncError::Decompression(format!("archive too short: {e}")))?;
    match magic {
        [b'P', b'K', 3, 4] => Ok(ArchiveKind::Zip),
        [0x1f, 0x8b, _, _] => Ok(ArchiveKind::TarGz),
        _ => Err(SyncError::Decompression(format!(
            "unrecognised archive format in {}",
            path.display()
        ))),
    }
}

fn extract_archive(archive: &Path, dest: &Path) -> SyncResult<Vec<String>> {
    let kind = sniff_archive_kind(archive)?;
    debug!("storage: extracting {} as {:?}", archive.display(), kind);
    std_fs::create_dir_all(dest)
        .map_err(|e| SyncError::Decompression(format!("create dest: {e}")))?;
    match kind {
        ArchiveKind::Zip => extract_zip(archive, dest),
        ArchiveKind::TarGz => extract_targz(archive, dest),
    }
}

fn extract_zip(archive_path: &Path, dest: &Path) -> SyncResult<Vec<String>> {
    let fail = |what: &str, e: &dyn std::fmt::Display| SyncError::Decompression(format!("zip {what}: {e}"));
    let file = std_fs::File::open(archive_path).map_err(|e| fail("open", &e))?;
    let mut archive = ZipArchive::new(file).map_err(|e| fail("parse", &e))?;
    let mut extracted = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| fail("entry", &e))?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(SyncError::Decompression(format!(
                "zip entry escapes destination: {}",
                entry.name()
            )));
        };
        let out_path = dest.join(&relative);
        if entry.is_dir() {
            std_fs::create_dir_all(&out_path).map_err(|e| fail("dir create", &e))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std_fs::create_dir_all(parent).map_err(|e| fail("parent dir", &e))?;
        }
        let mut out_file = std_fs::File::create(&out_path).map_err(|e| fail("create file", &e))?;
        io::copy(&mut entry, &mut out_file).map_err(|e| fail("write", &e))?;
        extracted.push(relative_string(&relative));
    }
    Ok(extracted)
}

fn extract_targz(archive_path: &Path, dest: &Path) -> SyncResult<Vec<String>> {
    let fail = |what: &str, e: &dyn std::fmt::Display| SyncError::Decompression(format!("tar.gz {what}: {e}"));
    let file = std_fs::File::open(archive_path).map_err(|e| fail("open", &e))?;
    let mut archive = Archive::new(GzDecoder::new(file));
    let mut extracted = Vec::new();
    for entry in archive.entries().map_err(|e| fail("read", &e))? {
        let mut entry = entry.map_err(|e| fail("entry", &e))?;
        let relative = entry.path().map_err(|e| fail("entry path", &e))?.into_owned();
        let is_file = entry.header().entry_type().is_file();
        let unpacked = entry.unpack_in(dest).map_err(|e| fail("unpack", &e))?;
        if !unpacked {
            return Err(SyncError::Decompression(format!(
                "tar entry escapes destination: {}",
                relative.display()
            )));
        }
        if is_file {
            extracted.push(relative_string(&relative));
        }
    }
    Ok(extracted)
}

fn relative_string(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}


#[cfg(test)]
mod tests {
    use super::test_support::{sha256_hex, zip_bytes};
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    #[tokio::test]
    async fn atomic_write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(dir.path());

        assert_eq!(storage.read_text("manifest.json").await.unwrap(), None);
        storage
            .write_atomic("nested/manifest.json", b"{\"a\":1}")
            .await
            .unwrap();
        assert_eq!(
            storage.read_text("nested/manifest.json").await.unwrap(),
            Some("{\"a\":1}".to_owned())
        );
        assert!(!dir.path().join("nested/manifest.json.tmp").exists());
    }

    #[tokio::test]
    async fn delete_removes_partial_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(dir.path());
        std_fs::write(dir.path().join("a.png"), b"x").unwrap();
        std_fs::write(dir.path().join("a.png.tmp"), b"partial").unwrap();

        storage.delete_file("a.png").await.unwrap();
        assert!(!dir.path().join("a.png").exists());
        assert!(!dir.path().join("a.png.tmp").exists());
        storage.delete_file("never-existed.png").await.unwrap();
    }

    #[test]
    fn rejects_paths_outside_root() {
        let storage = StorageManager::new("/data/app");
        assert!(storage.path_for("../etc/passwd").is_err());
        assert!(storage.path_for("/etc/passwd").is_err());
        assert!(storage.path_for("").is_err());
        assert_eq!(
            storage.path_for("img/a.png").unwrap(),
            PathBuf::from("/data/app/img/a.png")
        );
    }

    #[tokio::test]
    async fn extracts_zip_and_targz_archives() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(dir.path().join("app"));

        let zip_path = dir.path().join("1.zip");
        std_fs::write(&zip_path, zip_bytes(&[("img/a.png", b"aaa"), ("b.txt", b"bb")])).unwrap();
        let mut files = storage.decompress(zip_path).await.unwrap();
        files.sort();
        assert_eq!(files, vec!["b.txt", "img/a.png"]);
        assert_eq!(std_fs::read(dir.path().join("app/img/a.png")).unwrap(), b"aaa");

        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let mut header = tar::Header::new_gnu();
        header.set_size(3);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "sound/c.ogg", &b"ccc"[..])
            .unwrap();
        let gz = builder.into_inner().unwrap().finish().unwrap();
        let tgz_path = dir.path().join("2.zip");
        std_fs::write(&tgz_path, gz).unwrap();
        let files = storage.decompress(tgz_path).await.unwrap();
        assert_eq!(files, vec!["sound/c.ogg"]);
        assert_eq!(std_fs::read(dir.path().join("app/sound/c.ogg")).unwrap(), b"ccc");
    }

    #[tokio::test]
    async fn corrupt_archive_is_a_decompression_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(dir.path());
        let path = dir.path().join("bad.zip");
        std_fs::write(&path, b"PK\x03\x04garbage").unwrap();
        assert!(matches!(
            storage.decompress(path).await,
            Err(SyncError::Decompression(_))
        ));
    }

    #[test]
    fn hashes_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std_fs::write(&path, b"hello").unwrap();
        let hash = content_hash(&path).unwrap();
        assert_eq!(hash, sha256_hex(b"hello"));
        assert!(is_verifiable_hash(&hash));
        assert!(!is_verifiable_hash("h1"));
    }

    #[tokio::test]
    async fn remove_all_reports_freed_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(dir.path().join("app"));
        storage.write_atomic("a/b.bin", &[0u8; 100]).await.unwrap();
        storage.write_atomic("c.bin", &[0u8; 20]).await.unwrap();
        assert_eq!(storage.remove_all().await.unwrap(), 120);
        assert!(!dir.path().join("app").exists());
        assert_eq!(storage.remove_all().await.unwrap(), 0);
    }
}
