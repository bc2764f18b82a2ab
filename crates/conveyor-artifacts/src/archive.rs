//! tar+zstd packing of workspace paths.

use conveyor_core::{Error, Result};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

pub const ARCHIVE_EXTENSION: &str = "tar.zst";

const ZSTD_LEVEL: i32 = 3;

/// Normalize a declared artifact path relative to the workspace.
///
/// Absolute paths and `..` components are rejected so an archive never
/// reaches outside the job workspace.
fn relative_path(declared: &str) -> Result<PathBuf> {
    let mut path = PathBuf::new();
    for component in Path::new(declared).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            _ => {
                return Err(Error::Artifact(format!(
                    "artifact path {declared} leaves the workspace"
                )));
            }
        }
    }
    Ok(path)
}

/// Pack `paths` (relative to `base_dir`) into a zstd-compressed tarball.
///
/// Missing paths are skipped. Returns the number of paths packed; zero
/// packed paths is an error.
pub fn create_archive<W: Write>(writer: W, paths: &[String], base_dir: &Path) -> Result<usize> {
    let mut encoder = zstd::stream::write::Encoder::new(writer, ZSTD_LEVEL)
        .map_err(|e| Error::Artifact(format!("zstd init failed: {e}")))?;
    let mut packed = 0;
    {
        let mut builder = tar::Builder::new(&mut encoder);
        for declared in paths {
            let name = relative_path(declared)?;
            let source = base_dir.join(&name);
            if !source.exists() {
                debug!(path = %declared, "Artifact path does not exist, skipping");
                continue;
            }
            if source.is_dir() {
                builder
                    .append_dir_all(&name, &source)
                    .map_err(|e| Error::Artifact(format!("failed to pack {declared}: {e}")))?;
            } else {
                builder
                    .append_path_with_name(&source, &name)
                    .map_err(|e| Error::Artifact(format!("failed to pack {declared}: {e}")))?;
            }
            packed += 1;
        }
        builder
            .finish()
            .map_err(|e| Error::Artifact(format!("failed to finish tar: {e}")))?;
    }
    encoder
        .finish()
        .map_err(|e| Error::Artifact(format!("zstd finish failed: {e}")))?;

    if packed == 0 {
        return Err(Error::Artifact(format!(
            "none of the artifact paths exist: {}",
            paths.join(", ")
        )));
    }
    Ok(packed)
}

/// Unpack an archive into `dest`, returning the extracted files.
pub fn extract_archive<R: Read>(reader: R, dest: &Path) -> Result<Vec<PathBuf>> {
    let decoder = zstd::stream::read::Decoder::new(reader)
        .map_err(|e| Error::Artifact(format!("zstd init failed: {e}")))?;
    let mut archive = tar::Archive::new(decoder);
    let entries = archive
        .entries()
        .map_err(|e| Error::Artifact(format!("failed to read archive: {e}")))?;

    let mut files = Vec::new();
    for entry in entries {
        let mut entry = entry.map_err(|e| Error::Artifact(format!("corrupt archive entry: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| Error::Artifact(format!("invalid entry path: {e}")))?
            .into_owned();
        let is_file = entry.header().entry_type().is_file();
        let unpacked = entry
            .unpack_in(dest)
            .map_err(|e| Error::Artifact(format!("failed to unpack {}: {e}", path.display())))?;
        if unpacked && is_file {
            files.push(dest.join(path));
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn workspace() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("dist/assets")).unwrap();
        std::fs::write(dir.path().join("dist/index.html"), "<html/>").unwrap();
        std::fs::write(dir.path().join("dist/assets/app.js"), "main()").unwrap();
        std::fs::write(dir.path().join("report.xml"), "<ok/>").unwrap();
        dir
    }

    #[test]
    fn test_pack_and_extract_tree() {
        let src = workspace();
        let mut buffer = Vec::new();
        let packed = create_archive(
            &mut buffer,
            &["dist/".to_string(), "report.xml".to_string(), "missing.txt".to_string()],
            src.path(),
        )
        .unwrap();
        assert_eq!(packed, 2);

        let dest = tempfile::tempdir().unwrap();
        let files = extract_archive(buffer.as_slice(), dest.path()).unwrap();
        assert_eq!(
            files,
            vec![
                dest.path().join("dist/assets/app.js"),
                dest.path().join("dist/index.html"),
                dest.path().join("report.xml"),
            ]
        );
        assert_eq!(std::fs::read_to_string(dest.path().join("dist/assets/app.js")).unwrap(), "main()");
    }

    #[test]
    fn test_nothing_to_pack() {
        let src = workspace();
        let err = create_archive(Vec::new(), &["build/".to_string()], src.path()).unwrap_err();
        assert!(matches!(err, Error::Artifact(_)));
    }

    #[test]
    fn test_rejects_paths_outside_workspace() {
        let src = workspace();
        for path in ["../secrets", "/etc/passwd"] {
            let err = create_archive(Vec::new(), &[path.to_string()], src.path()).unwrap_err();
            assert!(err.to_string().contains("leaves the workspace"), "{path}");
        }
        assert_eq!(relative_path("./dist/").unwrap(), PathBuf::from("dist"));
    }
}
