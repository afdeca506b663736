//! Lesson file lookup.
//!
//! Lessons live either as loose directory trees or as packaged
//! `<activity>.tar.zst` archives. Both layouts are the same:
//!
//! ```text
//! <activity>/validate.json
//! <activity>/chapters/<chapter>/validate.json
//! ```

use crate::error::{Error, Result};
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

/// Resolves `(activity, chapter?, file)` to file contents.
pub trait LessonArchive: Send + Sync {
    /// Read a lesson file. Missing files are `Ok(None)`.
    fn read(&self, activity: &str, chapter: Option<&str>, file: &str) -> Result<Option<Vec<u8>>>;

    /// Where the archive reads from, for log and error messages.
    fn describe(&self) -> String;
}

/// Identifiers come from clients; anything that is not a plain path segment
/// is treated as missing.
fn is_plain_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn relative_path(activity: &str, chapter: Option<&str>, file: &str) -> Option<PathBuf> {
    if !is_plain_segment(activity) || !is_plain_segment(file) {
        return None;
    }
    let mut path = PathBuf::from(activity);
    if let Some(chapter) = chapter {
        if !is_plain_segment(chapter) {
            return None;
        }
        path.push("chapters");
        path.push(chapter);
    }
    path.push(file);
    Some(path)
}

/// Lessons as a directory tree.
#[derive(Debug, Clone)]
pub struct DirectoryArchive {
    root: PathBuf,
}

impl DirectoryArchive {
    /// Archive rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl LessonArchive for DirectoryArchive {
    fn read(&self, activity: &str, chapter: Option<&str>, file: &str) -> Result<Option<Vec<u8>>> {
        let Some(relative) = relative_path(activity, chapter, file) else {
            return Ok(None);
        };
        let path = self.root.join(relative);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::validator(
                path.display().to_string(),
                e.to_string(),
            )),
        }
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

/// Lessons packaged as `<root>/<activity>.tar.zst`.
///
/// Entries may sit under a top-level directory; the lookup matches the
/// trailing `chapters/<chapter>/<file>` or a `<file>` outside `chapters/`.
#[derive(Debug, Clone)]
pub struct PackagedArchive {
    root: PathBuf,
}

impl PackagedArchive {
    /// Archive directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn matches(entry: &Path, chapter: Option<&str>, file: &str) -> bool {
        let parts: Vec<&str> = entry
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => s.to_str(),
                _ => None,
            })
            .collect();
        match (chapter, parts.as_slice()) {
            (Some(chapter), [.., "chapters", ch, name]) => *ch == chapter && *name == file,
            (None, [.., name]) => *name == file && !parts.contains(&"chapters"),
            _ => false,
        }
    }
}

impl LessonArchive for PackagedArchive {
    fn read(&self, activity: &str, chapter: Option<&str>, file: &str) -> Result<Option<Vec<u8>>> {
        if relative_path(activity, chapter, file).is_none() {
            return Ok(None);
        }
        let path = self.root.join(format!("{}.tar.zst", activity));
        let fault = |reason: String| Error::validator(path.display().to_string(), reason);

        let archive_file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(fault(e.to_string())),
        };
        let decoder = zstd::stream::Decoder::new(archive_file).map_err(|e| fault(e.to_string()))?;
        let mut archive = tar::Archive::new(decoder);

        for entry in archive.entries().map_err(|e| fault(e.to_string()))? {
            let mut entry = entry.map_err(|e| fault(e.to_string()))?;
            let entry_path = entry.path().map_err(|e| fault(e.to_string()))?.into_owned();
            if Self::matches(&entry_path, chapter, file) {
                let mut contents = Vec::new();
                entry
                    .read_to_end(&mut contents)
                    .map_err(|e| fault(e.to_string()))?;
                return Ok(Some(contents));
            }
        }
        Ok(None)
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Write `<dir>/<activity>.tar.zst` holding `files` (path, contents).
    pub(crate) fn write_package(dir: &Path, activity: &str, files: &[(&str, &str)]) {
        let out = File::create(dir.join(format!("{}.tar.zst", activity))).unwrap();
        let encoder = zstd::stream::Encoder::new(out, 3).unwrap();
        let mut builder = tar::Builder::new(encoder);
        for (path, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, path, contents.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_directory_archive_layout() {
        let dir = tempfile::tempdir().unwrap();
        let chapter = dir.path().join("mira/chapters/intro");
        std::fs::create_dir_all(&chapter).unwrap();
        std::fs::write(dir.path().join("mira/validate.json"), "activity").unwrap();
        std::fs::write(chapter.join("validate.json"), "chapter").unwrap();

        let archive = DirectoryArchive::new(dir.path());
        assert_eq!(
            archive.read("mira", None, "validate.json").unwrap().unwrap(),
            b"activity"
        );
        assert_eq!(
            archive
                .read("mira", Some("intro"), "validate.json")
                .unwrap()
                .unwrap(),
            b"chapter"
        );
        assert!(archive.read("mira", Some("other"), "validate.json").unwrap().is_none());
        assert!(archive.read("nope", None, "validate.json").unwrap().is_none());
    }

    #[test]
    fn test_traversal_is_treated_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("secret.json"), "x").unwrap();
        let archive = DirectoryArchive::new(dir.path().join("lessons"));

        assert!(archive.read("..", None, "secret.json").unwrap().is_none());
        assert!(archive.read("a/../..", None, "secret.json").unwrap().is_none());
        assert!(archive.read("mira", Some(".."), "validate.json").unwrap().is_none());
    }

    #[test]
    fn test_packaged_archive_lookup() {
        let dir = tempfile::tempdir().unwrap();
        write_package(
            dir.path(),
            "rpg",
            &[
                ("rpg/validate.json", "activity"),
                ("rpg/chapters/one/validate.json", "chapter one"),
            ],
        );

        let archive = PackagedArchive::new(dir.path());
        assert_eq!(
            archive.read("rpg", None, "validate.json").unwrap().unwrap(),
            b"activity"
        );
        assert_eq!(
            archive
                .read("rpg", Some("one"), "validate.json")
                .unwrap()
                .unwrap(),
            b"chapter one"
        );
        assert!(archive.read("rpg", Some("two"), "validate.json").unwrap().is_none());
        assert!(archive.read("missing", None, "validate.json").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_package_is_a_fault() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.tar.zst"), b"not zstd at all").unwrap();
        let archive = PackagedArchive::new(dir.path());
        assert!(matches!(
            archive.read("bad", None, "validate.json"),
            Err(Error::ValidatorFault { .. })
        ));
    }
}
