// Copyright 2016 Mozilla Foundation
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::errors::*;

pub fn is_directory(path: &str) -> bool {
    std::fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false)
}

pub fn is_regular_file(path: &str) -> bool {
    std::fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

pub fn is_symlink(path: &str) -> bool {
    std::fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

pub fn is_executable(metadata: &std::fs::Metadata) -> bool {
    metadata.permissions().mode() & 0o100 != 0
}

pub fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// `<hostname>:<parent-pid>`, identifying all recc processes spawned by
/// the same build tool.
pub fn tool_invocation_id() -> String {
    format!("{}:{}", hostname(), nix::unistd::getppid())
}

/// Write a file so that concurrent readers see either nothing or the
/// complete contents: write to a temporary in the same directory, then
/// rename into place.
pub fn write_file_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;

    let dir = path
        .parent()
        .ok_or_else(|| anyhow!("path \"{}\" has no parent directory", path.display()))?;
    let mut temp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temporary file in {}", dir.display()))?;
    temp.write_all(contents)
        .with_context(|| format!("failed to write temporary file for {}", path.display()))?;
    temp.persist(path)
        .with_context(|| format!("failed to rename temporary file to {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_file_predicates() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, "x").unwrap();

        assert!(is_directory(dir.path().to_str().unwrap()));
        assert!(!is_directory(file.to_str().unwrap()));
        assert!(is_regular_file(file.to_str().unwrap()));
        assert!(!is_regular_file("/nonexistent/recc"));
    }

    #[test]
    fn test_write_file_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        write_file_atomically(&path, b"contents").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "contents");
    }
}
