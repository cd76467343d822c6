//! ビルドコンテキスト (tar) の組み立てと展開
//!
//! アップロードされたアーカイブは信頼できない入力として扱う。
//! `Dockerfile` という名前のエントリは予約されており、常にパイプラインが上書きする。

use crate::error::{BuildError, Result};
use flate2::read::GzDecoder;
use std::borrow::Cow;
use std::ffi::OsStr;
use std::fs;
use std::io::{self, Cursor, Read};
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tar::{Archive, Builder, EntryType, Header};

/// 予約済みのエントリ名
pub const DOCKERFILE_ENTRY: &str = "Dockerfile";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// 正規化済みのビルドコンテキスト (非圧縮 tar)
///
/// 最後のエントリが常に `Dockerfile` であり、同名のエントリは他に存在しない。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildContext(Vec<u8>);

impl BuildContext {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for BuildContext {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// 展開結果の集計
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExtractSummary {
    pub files: usize,
    pub directories: usize,
    /// シンボリックリンク等、展開対象外のエントリ数
    pub skipped: usize,
}

pub struct ContextBuilder;

impl ContextBuilder {
    /// 既存アーカイブと Dockerfile をマージしてビルドコンテキストを作成
    ///
    /// 既存アーカイブの通常ファイル・ディレクトリはヘッダ (mode, mtime, size) ごと
    /// そのままコピーし、最後に `Dockerfile` エントリ (mode 0644) を追加する。
    /// gzip 圧縮されたアーカイブも受け付ける。
    pub fn merge(existing: Option<&[u8]>, dockerfile: &str) -> Result<BuildContext> {
        let mut tar = Builder::new(Vec::new());

        if let Some(bytes) = existing.filter(|b| !b.is_empty()) {
            let raw = decompress(bytes)?;
            let mut archive = Archive::new(Cursor::new(raw.as_ref()));

            for entry in archive.entries().map_err(archive_error)? {
                let mut entry = entry.map_err(archive_error)?;
                let raw_path = entry.path().map_err(archive_error)?.into_owned();
                let entry_type = entry.header().entry_type();

                if !entry_type.is_file() && !entry_type.is_dir() {
                    tracing::warn!(
                        "Skipping unsupported entry type {:?}: {}",
                        entry_type,
                        raw_path.display()
                    );
                    continue;
                }

                let Some(path) = clean_entry_path(&raw_path)? else {
                    continue;
                };

                if is_reserved(&path) {
                    tracing::debug!("Dropping uploaded {} entry", DOCKERFILE_ENTRY);
                    continue;
                }

                tracing::debug!("Build context entry: {}", path.display());
                let mut header = entry.header().clone();
                tar.append_data(&mut header, &path, &mut entry)
                    .map_err(archive_error)?;
            }
        }

        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(dockerfile.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(unix_now());
        tar.append_data(&mut header, DOCKERFILE_ENTRY, dockerfile.as_bytes())?;

        let data = tar.into_inner()?;
        tracing::debug!("Build context created: {} bytes", data.len());

        Self::check_context_size(data.len());

        Ok(BuildContext(data))
    }

    /// アーカイブを `dest` に展開
    ///
    /// 全エントリのパスを先に検証し、ひとつでも外に出るパスがあれば
    /// 何も書き込まずに `PathTraversal` で失敗する。
    /// `dest` の作成・削除は呼び出し側の責任。
    pub fn extract(archive: &[u8], dest: &Path) -> Result<ExtractSummary> {
        let raw = decompress(archive)?;

        // 1回目: パスの検証のみ
        {
            let mut archive = Archive::new(Cursor::new(raw.as_ref()));
            for entry in archive.entries().map_err(archive_error)? {
                let entry = entry.map_err(archive_error)?;
                let entry_type = entry.header().entry_type();
                if entry_type.is_file() || entry_type.is_dir() {
                    clean_entry_path(&entry.path().map_err(archive_error)?)?;
                }
            }
        }

        // 2回目: 書き込み
        fs::create_dir_all(dest)?;
        let mut summary = ExtractSummary::default();
        let mut dir_modes = Vec::new();
        let mut archive = Archive::new(Cursor::new(raw.as_ref()));

        for entry in archive.entries().map_err(archive_error)? {
            let mut entry = entry.map_err(archive_error)?;
            let entry_type = entry.header().entry_type();

            if !entry_type.is_file() && !entry_type.is_dir() {
                summary.skipped += 1;
                continue;
            }

            let Some(relative) = clean_entry_path(&entry.path().map_err(archive_error)?)? else {
                continue;
            };
            let target = dest.join(&relative);

            if entry_type.is_dir() {
                fs::create_dir_all(&target)?;
                let mode = entry.header().mode().map_err(archive_error)?;
                dir_modes.push((target, mode));
                summary.directories += 1;
            } else {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut file = fs::File::create(&target)?;
                io::copy(&mut entry, &mut file)?;
                summary.files += 1;
            }
        }

        // 子エントリを書き終えてからディレクトリのパーミッションを適用する
        for (dir, mode) in dir_modes.into_iter().rev() {
            set_dir_mode(&dir, mode)?;
        }

        tracing::debug!(
            "Extracted build context to {}: {} files, {} directories, {} skipped",
            dest.display(),
            summary.files,
            summary.directories,
            summary.skipped
        );

        Ok(summary)
    }

    /// コンテキストサイズのチェックと警告
    fn check_context_size(size: usize) {
        const MAX_CONTEXT_SIZE: usize = 500 * 1024 * 1024; // 500MB

        if size > MAX_CONTEXT_SIZE {
            tracing::warn!(
                "Build context is very large ({}MB); consider trimming the uploaded archive",
                size / 1024 / 1024
            );
        }
    }
}

/// エントリパスを正規化する
///
/// `.` を除去し `..` を解決した相対パスを返す。空になるパス (`./` など) は `None`。
/// 絶対パス、またはルートより上に出るパスは `PathTraversal`。
pub fn clean_entry_path(raw: &Path) -> Result<Option<PathBuf>> {
    let mut parts: Vec<&OsStr> = Vec::new();

    for component in raw.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => {
                return Err(BuildError::PathTraversal(raw.display().to_string()));
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(BuildError::PathTraversal(raw.display().to_string()));
                }
            }
            Component::Normal(part) => parts.push(part),
        }
    }

    if parts.is_empty() {
        return Ok(None);
    }

    Ok(Some(parts.into_iter().collect()))
}

fn is_reserved(path: &Path) -> bool {
    path == Path::new(DOCKERFILE_ENTRY)
}

fn decompress(bytes: &[u8]) -> Result<Cow<'_, [u8]>> {
    if bytes.starts_with(&GZIP_MAGIC) {
        let mut out = Vec::new();
        GzDecoder::new(bytes)
            .read_to_end(&mut out)
            .map_err(archive_error)?;
        Ok(Cow::Owned(out))
    } else {
        Ok(Cow::Borrowed(bytes))
    }
}

fn archive_error(err: io::Error) -> BuildError {
    BuildError::ArchiveFormat(err.to_string())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// 所有者の rwx は常に残す (スクラッチ領域を確実に削除できるように)
#[cfg(unix)]
fn set_dir_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode((mode & 0o7777) | 0o700))
}

#[cfg(not(unix))]
fn set_dir_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::collections::BTreeMap;
    use std::io::Write;
    use tempfile::tempdir;

    fn file_entry(tar: &mut Builder<Vec<u8>>, path: &str, content: &[u8], mode: u32, mtime: u64) {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(content.len() as u64);
        header.set_mode(mode);
        header.set_mtime(mtime);
        tar.append_data(&mut header, path, content).unwrap();
    }

    fn dir_entry(tar: &mut Builder<Vec<u8>>, path: &str, mode: u32) {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
        header.set_mode(mode);
        tar.append_data(&mut header, path, io::empty()).unwrap();
    }

    // tar::Builder はパスを検証するため、危険なパスはヘッダに直接書き込む
    fn raw_entry(tar: &mut Builder<Vec<u8>>, name: &[u8], content: &[u8]) {
        let mut header = Header::new_gnu();
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_entry_type(EntryType::Regular);
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar.append(&header, content).unwrap();
    }

    /// (パス, 内容, mode, mtime) の一覧を返す
    fn list_entries(bytes: &[u8]) -> Vec<(String, Vec<u8>, u32, u64)> {
        let mut archive = Archive::new(Cursor::new(bytes));
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let path = entry.path().unwrap().display().to_string();
                let mode = entry.header().mode().unwrap();
                let mtime = entry.header().mtime().unwrap();
                let mut content = Vec::new();
                entry.read_to_end(&mut content).unwrap();
                (path, content, mode, mtime)
            })
            .collect()
    }

    /// ディレクトリを相対パスの tar に詰め直す
    fn pack_dir(tar: &mut Builder<Vec<u8>>, root: &Path, dir: &Path) {
        let mut children: Vec<PathBuf> =
            fs::read_dir(dir).unwrap().map(|e| e.unwrap().path()).collect();
        children.sort();
        for full in children {
            let rel = full.strip_prefix(root).unwrap().to_path_buf();
            if full.is_dir() {
                tar.append_dir(&rel, &full).unwrap();
                pack_dir(tar, root, &full);
            } else {
                tar.append_path_with_name(&full, &rel).unwrap();
            }
        }
    }

    /// 相対パス -> 内容 (ディレクトリは空) の一覧
    fn collect_tree(root: &Path, dir: &Path, tree: &mut BTreeMap<PathBuf, Option<Vec<u8>>>) {
        for entry in fs::read_dir(dir).unwrap() {
            let full = entry.unwrap().path();
            let rel = full.strip_prefix(root).unwrap().to_path_buf();
            if full.is_dir() {
                tree.insert(rel, None);
                collect_tree(root, &full, tree);
            } else {
                tree.insert(rel, Some(fs::read(&full).unwrap()));
            }
        }
    }

    #[test]
    fn test_merge_without_archive() {
        let context = ContextBuilder::merge(None, "FROM scratch").unwrap();
        let entries = list_entries(context.as_bytes());

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "Dockerfile");
        assert_eq!(entries[0].1, b"FROM scratch");
        assert_eq!(entries[0].2, 0o644);
    }

    #[test]
    fn test_merge_empty_archive_is_valid() {
        let context = ContextBuilder::merge(Some(&[]), "FROM alpine").unwrap();
        let entries = list_entries(context.as_bytes());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "Dockerfile");
    }

    #[test]
    fn test_merge_replaces_uploaded_dockerfile() {
        let mut tar = Builder::new(Vec::new());
        dir_entry(&mut tar, "app", 0o755);
        file_entry(&mut tar, "app/main.py", b"print('hi')", 0o600, 1_700_000_000);
        file_entry(&mut tar, "Dockerfile", b"FROM evil", 0o644, 1_700_000_000);
        file_entry(&mut tar, "requirements.txt", b"flask", 0o644, 1_700_000_001);
        let upload = tar.into_inner().unwrap();

        let context = ContextBuilder::merge(Some(&upload), "FROM python:3.12").unwrap();
        let entries = list_entries(context.as_bytes());
        let names: Vec<&str> = entries.iter().map(|e| e.0.as_str()).collect();

        assert_eq!(
            names,
            vec!["app", "app/main.py", "requirements.txt", "Dockerfile"]
        );
        let dockerfiles: Vec<_> = entries.iter().filter(|e| e.0 == "Dockerfile").collect();
        assert_eq!(dockerfiles.len(), 1);
        assert_eq!(dockerfiles[0].1, b"FROM python:3.12");
    }

    #[test]
    fn test_merge_preserves_headers() {
        let mut tar = Builder::new(Vec::new());
        file_entry(&mut tar, "run.sh", b"#!/bin/sh\necho ok\n", 0o755, 1_650_000_000);
        let upload = tar.into_inner().unwrap();

        let context = ContextBuilder::merge(Some(&upload), "FROM alpine").unwrap();
        let entries = list_entries(context.as_bytes());

        assert_eq!(entries[0].0, "run.sh");
        assert_eq!(entries[0].1, b"#!/bin/sh\necho ok\n");
        assert_eq!(entries[0].2, 0o755);
        assert_eq!(entries[0].3, 1_650_000_000);
    }

    #[test]
    fn test_merge_accepts_gzip_archive() {
        let mut tar = Builder::new(Vec::new());
        file_entry(&mut tar, "index.js", b"console.log(1)", 0o644, 0);
        let plain = tar.into_inner().unwrap();

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&plain).unwrap();
        let gz = encoder.finish().unwrap();

        let context = ContextBuilder::merge(Some(&gz), "FROM node:20").unwrap();
        let names: Vec<String> = list_entries(context.as_bytes())
            .into_iter()
            .map(|e| e.0)
            .collect();
        assert_eq!(names, vec!["index.js", "Dockerfile"]);
    }

    #[test]
    fn test_merge_rejects_malformed_archive() {
        let result =
            ContextBuilder::merge(Some(b"this is definitely not a tar archive"), "FROM alpine");
        assert!(matches!(result, Err(BuildError::ArchiveFormat(_))));
    }

    #[test]
    fn test_merge_rejects_traversal() {
        let mut tar = Builder::new(Vec::new());
        raw_entry(&mut tar, b"../outside.txt", b"x");
        let upload = tar.into_inner().unwrap();

        let result = ContextBuilder::merge(Some(&upload), "FROM alpine");
        assert!(matches!(result, Err(BuildError::PathTraversal(_))));
    }

    #[test]
    fn test_extract_writes_files_and_directories() {
        let mut tar = Builder::new(Vec::new());
        dir_entry(&mut tar, "src", 0o755);
        file_entry(&mut tar, "src/lib.rs", b"pub fn f() {}", 0o644, 0);
        file_entry(&mut tar, "nested/deeper/data.txt", b"data", 0o644, 0);
        let context = ContextBuilder::merge(Some(&tar.into_inner().unwrap()), "FROM rust").unwrap();

        let dest = tempdir().unwrap();
        let summary = ContextBuilder::extract(context.as_bytes(), dest.path()).unwrap();

        assert_eq!(summary.files, 3);
        assert_eq!(summary.directories, 1);
        assert_eq!(
            fs::read(dest.path().join("src/lib.rs")).unwrap(),
            b"pub fn f() {}"
        );
        assert_eq!(
            fs::read(dest.path().join("nested/deeper/data.txt")).unwrap(),
            b"data"
        );
        assert_eq!(
            fs::read_to_string(dest.path().join("Dockerfile")).unwrap(),
            "FROM rust"
        );
    }

    #[test]
    fn test_extract_truncates_existing_file() {
        let dest = tempdir().unwrap();
        fs::write(dest.path().join("Dockerfile"), "a much longer previous content").unwrap();

        let context = ContextBuilder::merge(None, "FROM x").unwrap();
        ContextBuilder::extract(context.as_bytes(), dest.path()).unwrap();

        assert_eq!(
            fs::read_to_string(dest.path().join("Dockerfile")).unwrap(),
            "FROM x"
        );
    }

    #[test]
    fn test_extract_rejects_parent_traversal_without_writing() {
        let mut tar = Builder::new(Vec::new());
        file_entry(&mut tar, "ok.txt", b"fine", 0o644, 0);
        raw_entry(&mut tar, b"../../etc/passwd", b"root::0:0");
        let archive = tar.into_inner().unwrap();

        let dest = tempdir().unwrap();
        let result = ContextBuilder::extract(&archive, dest.path());

        assert!(matches!(result, Err(BuildError::PathTraversal(_))));
        assert_eq!(fs::read_dir(dest.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_extract_rejects_absolute_path() {
        let mut tar = Builder::new(Vec::new());
        raw_entry(&mut tar, b"/etc/passwd", b"root::0:0");
        let archive = tar.into_inner().unwrap();

        let dest = tempdir().unwrap();
        let result = ContextBuilder::extract(&archive, dest.path());

        assert!(matches!(result, Err(BuildError::PathTraversal(_))));
        assert_eq!(fs::read_dir(dest.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_extract_skips_symlinks() {
        let mut tar = Builder::new(Vec::new());
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        tar.append_link(&mut header, "link", "/etc/shadow").unwrap();
        file_entry(&mut tar, "real.txt", b"real", 0o644, 0);
        let archive = tar.into_inner().unwrap();

        let dest = tempdir().unwrap();
        let summary = ContextBuilder::extract(&archive, dest.path()).unwrap();

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.files, 1);
        assert!(!dest.path().join("link").exists());
    }

    #[test]
    fn test_extracted_tree_survives_merge() {
        let mut tar = Builder::new(Vec::new());
        dir_entry(&mut tar, "src", 0o755);
        dir_entry(&mut tar, "src/bin", 0o755);
        dir_entry(&mut tar, "empty", 0o755);
        file_entry(&mut tar, "README.md", b"# judge", 0o644, 1_700_000_000);
        file_entry(&mut tar, "src/lib.rs", b"pub fn f() {}", 0o644, 0);
        file_entry(&mut tar, "src/bin/main.rs", b"fn main() {}", 0o755, 0);
        file_entry(&mut tar, "data/input.txt", b"1 2 3\n", 0o600, 0);
        let upload = tar.into_inner().unwrap();

        let first = tempdir().unwrap();
        ContextBuilder::extract(&upload, first.path()).unwrap();

        let mut repacked = Builder::new(Vec::new());
        pack_dir(&mut repacked, first.path(), first.path());
        let repacked = repacked.into_inner().unwrap();

        let context = ContextBuilder::merge(Some(&repacked), "FROM x").unwrap();
        let second = tempdir().unwrap();
        ContextBuilder::extract(context.as_bytes(), second.path()).unwrap();

        let mut before = BTreeMap::new();
        collect_tree(first.path(), first.path(), &mut before);
        let mut after = BTreeMap::new();
        collect_tree(second.path(), second.path(), &mut after);

        assert_eq!(
            after.remove(Path::new(DOCKERFILE_ENTRY)),
            Some(Some(b"FROM x".to_vec()))
        );
        assert_eq!(before, after);
        assert_eq!(
            before.get(Path::new("src/bin/main.rs")),
            Some(&Some(b"fn main() {}".to_vec()))
        );
        assert_eq!(before.get(Path::new("empty")), Some(&None));
    }

    #[test]
    fn test_clean_entry_path() {
        assert_eq!(
            clean_entry_path(Path::new("./a/b.txt")).unwrap(),
            Some(PathBuf::from("a/b.txt"))
        );
        assert_eq!(
            clean_entry_path(Path::new("a/../b.txt")).unwrap(),
            Some(PathBuf::from("b.txt"))
        );
        assert_eq!(clean_entry_path(Path::new("./")).unwrap(), None);
        assert!(clean_entry_path(Path::new("a/../../b")).is_err());
        assert!(clean_entry_path(Path::new("../../etc/passwd")).is_err());
        assert!(clean_entry_path(Path::new("/abs")).is_err());
    }

    #[test]
    fn test_dot_slash_dockerfile_is_reserved() {
        let mut tar = Builder::new(Vec::new());
        raw_entry(&mut tar, b"./Dockerfile", b"FROM old");
        let upload = tar.into_inner().unwrap();

        let context = ContextBuilder::merge(Some(&upload), "FROM new").unwrap();
        let entries = list_entries(context.as_bytes());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1, b"FROM new");
    }
}
