use std::io::ErrorKind;
use std::path::Path;

use anyhow::{bail, Context};
use backup_cloud_core::LocalFileEntry;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Every regular file under `root`, keyed by its `/`-separated path relative
/// to `root`, sorted by that path.
///
/// Symlinks are followed. Symlink loops and dangling links are skipped with
/// a warning, other special files with a debug line.
pub async fn collect_files(root: &Path) -> anyhow::Result<Vec<LocalFileEntry>> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || walk(&root)).await?
}

fn walk(root: &Path) -> anyhow::Result<Vec<LocalFileEntry>> {
    let meta = std::fs::metadata(root)
        .with_context(|| format!("Cannot read local directory {}", root.display()))?;
    if !meta.is_dir() {
        bail!("{} is not a directory", root.display());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let at = e.path().map(Path::to_path_buf).unwrap_or_default();
                if let Some(ancestor) = e.loop_ancestor() {
                    warn!(
                        "Skipping symlink loop at {} (points back to {})",
                        at.display(),
                        ancestor.display()
                    );
                    continue;
                }
                if e.io_error().map(|io| io.kind()) == Some(ErrorKind::NotFound) {
                    warn!("Skipping dangling entry {}", at.display());
                    continue;
                }
                return Err(e).with_context(|| format!("Cannot walk {}", at.display()));
            }
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }
        if !file_type.is_file() {
            debug!("Skipping special file {}", entry.path().display());
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("{} is outside {}", entry.path().display(), root.display()))?;
        files.push(LocalFileEntry {
            relative_path: slash_path(relative),
            absolute_path: entry.into_path(),
        });
    }

    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(files)
}

fn slash_path(relative: &Path) -> String {
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_collects_nested_files_sorted() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        std::fs::create_dir_all(root.join("db/2024")).unwrap();
        std::fs::create_dir_all(root.join("empty")).unwrap();
        std::fs::write(root.join("z.tar"), b"z").unwrap();
        std::fs::write(root.join("db/2024/dump.sql"), b"sql").unwrap();
        std::fs::write(root.join("a.tar"), b"a").unwrap();

        let files = collect_files(root).await.unwrap();
        let relative: Vec<&str> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(relative, vec!["a.tar", "db/2024/dump.sql", "z.tar"]);
        assert_eq!(files[1].absolute_path, root.join("db/2024/dump.sql"));
    }

    #[tokio::test]
    async fn test_empty_directory() {
        let temp_dir = TempDir::new().unwrap();
        assert!(collect_files(temp_dir.path()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_directory_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        assert!(collect_files(&temp_dir.path().join("missing")).await.is_err());
    }

    #[tokio::test]
    async fn test_file_root_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        assert!(collect_files(&file).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_loop_and_dangling_link_are_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        std::fs::create_dir_all(root.join("data")).unwrap();
        std::fs::write(root.join("top.tar"), b"t").unwrap();
        std::fs::write(root.join("data/pkg.tar"), b"p").unwrap();
        std::os::unix::fs::symlink(root, root.join("data/loop")).unwrap();
        std::os::unix::fs::symlink(root.join("missing"), root.join("dangling")).unwrap();

        let files = collect_files(root).await.unwrap();
        let relative: Vec<&str> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(relative, vec!["data/pkg.tar", "top.tar"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinked_file_is_followed() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("root");
        std::fs::create_dir_all(&root).unwrap();
        let outside = temp_dir.path().join("outside.tar");
        std::fs::write(&outside, b"o").unwrap();
        std::os::unix::fs::symlink(&outside, root.join("linked.tar")).unwrap();

        let files = collect_files(&root).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path, "linked.tar");
        assert_eq!(files[0].absolute_path, root.join("linked.tar"));
    }
}
