use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::{
    ffi::CString,
    io,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    time::SystemTime,
};
use tokio::fs;

use crate::{config::AppConfig, round_to};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
const MIB: f64 = 1024.0 * 1024.0;

/// Extensions always listed as recordings, in addition to the configured recording extension.
pub const VIDEO_EXTENSIONS: &[&str] = &["avi", "mp4", "mkv"];

/// Capacity of the recording volume in GB.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StorageSnapshot {
    pub total: f64,
    pub used: f64,
    pub free: f64,
    pub percent: f64,
    pub mounted: bool,
}

impl StorageSnapshot {
    pub fn unmounted() -> Self {
        Self {
            total: 0.0,
            used: 0.0,
            free: 0.0,
            percent: 0.0,
            mounted: false,
        }
    }

    pub fn from_bytes(total_bytes: u64, free_bytes: u64) -> Self {
        let total = total_bytes as f64 / GIB;
        let free = free_bytes as f64 / GIB;
        let used = total - free;
        let percent = if total > 0.0 { used / total * 100.0 } else { 0.0 };
        Self {
            total: round_to(total, 2),
            used: round_to(used, 2),
            free: round_to(free, 2),
            percent: round_to(percent, 2),
            mounted: true,
        }
    }
}

/// Recomputed on every call; any stat failure is reported as an unmounted volume.
pub fn capacity(path: &Path) -> StorageSnapshot {
    match statvfs(path) {
        Ok((total, free)) => StorageSnapshot::from_bytes(total, free),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "storage stat failed");
            StorageSnapshot::unmounted()
        }
    }
}

/// Returns (total, available-to-unprivileged) bytes of the filesystem holding `path`.
fn statvfs(path: &Path) -> io::Result<(u64, u64)> {
    let c_path = CString::new(path.as_os_str().as_bytes())?;
    // SAFETY: zeroed statvfs is a valid out-parameter; c_path is NUL terminated and outlives the call.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    let fragment = stat.f_frsize as u64;
    Ok((
        stat.f_blocks as u64 * fragment,
        stat.f_bavail as u64 * fragment,
    ))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordingFile {
    pub name: String,
    /// Megabytes, two decimals.
    pub size: f64,
    /// Local modification time, `%Y-%m-%d %H:%M:%S`.
    pub date: String,
}

pub fn is_video(name: &str, extra_extension: &str) -> bool {
    let Some((_, extension)) = name.rsplit_once('.') else {
        return false;
    };
    VIDEO_EXTENSIONS
        .iter()
        .chain(std::iter::once(&extra_extension))
        .any(|known| extension.eq_ignore_ascii_case(known))
}

/// Scans the storage root on every call, newest first. Errors yield an empty listing.
pub async fn list_recordings(root: &Path, extra_extension: &str) -> Vec<RecordingFile> {
    match scan(root, extra_extension).await {
        Ok(files) => files,
        Err(err) => {
            tracing::warn!(path = %root.display(), error = %err, "listing recordings failed");
            Vec::new()
        }
    }
}

async fn scan(root: &Path, extra_extension: &str) -> io::Result<Vec<RecordingFile>> {
    let mut entries = fs::read_dir(root).await?;
    let mut found: Vec<(SystemTime, RecordingFile)> = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if !is_video(&name, extra_extension) {
            continue;
        }
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata.modified()?;
        found.push((
            modified,
            RecordingFile {
                name,
                size: round_to(metadata.len() as f64 / MIB, 2),
                date: DateTime::<Local>::from(modified)
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string(),
            },
        ));
    }
    found.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.name.cmp(&a.1.name)));
    Ok(found.into_iter().map(|(_, file)| file).collect())
}

/// Creates the storage and backup directories.
pub fn initialize(config: &AppConfig) -> Result<()> {
    std::fs::create_dir_all(&config.storage_path)
        .with_context(|| format!("failed to create storage directory {}", config.storage_path))?;
    tracing::info!(path = %config.storage_path, "storage initialized");
    if let Some(backup) = &config.backup_path {
        std::fs::create_dir_all(backup)
            .with_context(|| format!("failed to create backup directory {backup}"))?;
        tracing::info!(path = %backup, "local backup initialized");
    }
    Ok(())
}

/// Copies a finished recording into the backup directory, keeping its file name.
pub fn copy_to_backup(source: &Path, backup_dir: &Path) -> io::Result<PathBuf> {
    let name = source
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "recording has no file name"))?;
    let target = backup_dir.join(name);
    std::fs::copy(source, &target)?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn write_file(dir: &Path, name: &str, bytes: usize, age_secs: u64) {
        let path = dir.join(name);
        std::fs::write(&path, vec![0u8; bytes]).expect("write file");
        let file = std::fs::File::options()
            .write(true)
            .open(&path)
            .expect("reopen");
        file.set_modified(SystemTime::now() - Duration::from_secs(age_secs))
            .expect("set mtime");
    }

    #[test]
    fn invalid_path_reports_unmounted() {
        let snapshot = capacity(Path::new("/definitely/not/a/mount/point"));
        assert_eq!(snapshot, StorageSnapshot::unmounted());
        assert!(!snapshot.mounted);
    }

    #[test]
    fn real_directory_reports_capacity() {
        let tmp = tempdir().expect("tempdir");
        let snapshot = capacity(tmp.path());
        assert!(snapshot.mounted);
        assert!(snapshot.total > 0.0);
        assert!((0.0..=100.0).contains(&snapshot.percent));
    }

    #[test]
    fn snapshot_math_is_rounded() {
        let gib = 1024u64 * 1024 * 1024;
        let snapshot = StorageSnapshot::from_bytes(100 * gib, 25 * gib);
        assert_eq!(snapshot.total, 100.0);
        assert_eq!(snapshot.free, 25.0);
        assert_eq!(snapshot.used, 75.0);
        assert_eq!(snapshot.percent, 75.0);

        let odd = StorageSnapshot::from_bytes(3 * gib, gib);
        assert_eq!(odd.percent, 66.67);
        assert_eq!(StorageSnapshot::from_bytes(0, 0).percent, 0.0);
    }

    #[test]
    fn video_extensions_are_case_insensitive() {
        assert!(is_video("20250101_120000.avi", "avi"));
        assert!(is_video("clip.MP4", "avi"));
        assert!(is_video("clip.webm", "webm"));
        assert!(!is_video("notes.txt", "avi"));
        assert!(!is_video("avi", "avi"));
    }

    #[tokio::test]
    async fn listing_filters_and_sorts_newest_first() {
        let tmp = tempdir().expect("tempdir");
        write_file(tmp.path(), "old.avi", 1_234_567, 300);
        write_file(tmp.path(), "newest.mp4", 2 * 1024 * 1024, 10);
        write_file(tmp.path(), "middle.MKV", 512 * 1024, 100);
        write_file(tmp.path(), "readme.txt", 10, 5);
        std::fs::create_dir(tmp.path().join("folder.avi")).expect("dir");

        let files = list_recordings(tmp.path(), "avi").await;
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["newest.mp4", "middle.MKV", "old.avi"]);
        assert_eq!(files[0].size, 2.0);
        assert_eq!(files[1].size, 0.5);
        assert_eq!(files[2].size, 1.18);
        assert_eq!(files[0].date.len(), "2025-01-01 00:00:00".len());
    }

    #[tokio::test]
    async fn listing_missing_directory_is_empty() {
        let files = list_recordings(Path::new("/definitely/not/here"), "avi").await;
        assert!(files.is_empty());
    }

    #[test]
    fn initialize_creates_directories_and_backup_copies() {
        let tmp = tempdir().expect("tempdir");
        let config = AppConfig {
            storage_path: tmp.path().join("ssd").display().to_string(),
            backup_path: Some(tmp.path().join("sd").display().to_string()),
            ..AppConfig::default()
        };
        initialize(&config).expect("initialize");

        let recording = Path::new(&config.storage_path).join("20250101_120000.avi");
        std::fs::write(&recording, b"video").expect("write");
        let copied = copy_to_backup(&recording, &tmp.path().join("sd")).expect("backup");
        assert_eq!(std::fs::read(copied).expect("read"), b"video");
    }
}
