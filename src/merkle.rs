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

//! The content-addressed input root.
//!
//! A [`NestedDirectory`] is an append-only tree keyed by component name;
//! insertions may arrive from several worker threads in any order, and
//! determinism is restored at serialization time where children are
//! emitted sorted by name. Serialization walks depth-first post-order,
//! hashing each canonical `Directory` message once; the root digest is
//! the Action's `input_root_digest`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::config::Config;
use crate::digest::DigestFunction;
use crate::errors::*;
use crate::paths;
use crate::protos::re::{Digest, Directory, DirectoryNode, FileNode, SymlinkNode};
use crate::util;

/// Work items below this size aren't worth spinning workers up for.
const PARALLEL_THRESHOLD: usize = 50;

#[derive(Debug, Default)]
pub struct NestedDirectory {
    files: BTreeMap<String, (Digest, bool)>,
    symlinks: BTreeMap<String, String>,
    subdirs: BTreeMap<String, NestedDirectory>,
}

impl NestedDirectory {
    fn subdir_for_components(&mut self, components: &[&str]) -> &mut NestedDirectory {
        let mut current = self;
        for component in components {
            current = current
                .subdirs
                .entry((*component).to_owned())
                .or_default();
        }
        current
    }

    pub fn add_file(&mut self, path: &str, digest: Digest, is_executable: bool) {
        let components = paths::parse_directories(path);
        let Some((name, dirs)) = components.split_last() else {
            return;
        };
        self.subdir_for_components(dirs)
            .files
            .insert((*name).to_owned(), (digest, is_executable));
    }

    pub fn add_directory(&mut self, path: &str) {
        let components = paths::parse_directories(path);
        self.subdir_for_components(&components);
    }

    pub fn add_symlink(&mut self, path: &str, target: &str) {
        let components = paths::parse_directories(path);
        let Some((name, dirs)) = components.split_last() else {
            return;
        };
        self.subdir_for_components(dirs)
            .symlinks
            .insert((*name).to_owned(), target.to_owned());
    }

    /// Re-root this tree under `path`, adding one wrapping directory per
    /// component.
    pub fn wrapped_under(self, path: &str) -> NestedDirectory {
        let mut directory = self;
        for component in paths::parse_directories(path).iter().rev() {
            let mut parent = NestedDirectory::default();
            parent.subdirs.insert((*component).to_owned(), directory);
            directory = parent;
        }
        directory
    }

    /// Serialize bottom-up into `blobs` and return the root digest.
    pub fn to_digest(
        &self,
        digest_function: DigestFunction,
        blobs: &mut HashMap<Digest, Vec<u8>>,
    ) -> Digest {
        let mut directory = Directory::default();

        for (name, (digest, is_executable)) in &self.files {
            directory.files.push(FileNode {
                name: name.clone(),
                digest: Some(digest.clone()),
                is_executable: *is_executable,
            });
        }
        for (name, subdir) in &self.subdirs {
            let subdir_digest = subdir.to_digest(digest_function, blobs);
            directory.directories.push(DirectoryNode {
                name: name.clone(),
                digest: Some(subdir_digest),
            });
        }
        for (name, target) in &self.symlinks {
            directory.symlinks.push(SymlinkNode {
                name: name.clone(),
                target: target.clone(),
            });
        }

        let (digest, encoded) = digest_function.digest_of_message(&directory);
        blobs.insert(digest.clone(), encoded);
        digest
    }
}

/// Digest and mode of a file on the local filesystem, following
/// symlinks.
pub struct FileEntry {
    pub digest: Digest,
    pub executable: bool,
}

pub fn file_entry(path: &str, digest_function: DigestFunction) -> Result<FileEntry> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("failed to stat \"{}\"", path))?;
    if !metadata.is_file() {
        bail!("\"{}\" is not a regular file", path);
    }
    Ok(FileEntry {
        digest: digest_function.digest_of_file(path)?,
        executable: util::is_executable(&metadata),
    })
}

/// Compute the in-tree path for a dependency, creating intermediate
/// directories for embedded `..` segments.
///
/// A path like `foo/../bar.h` must keep resolving on the remote side, so
/// every non-`..` segment preceding a `..` gets its directory added to
/// the tree (empty if nothing else lands there) before normalization
/// collapses the path.
pub fn resolve_merkle_path(
    path: &str,
    cwd: &str,
    config: &Config,
    mut add_directory: impl FnMut(&str),
) -> Option<String> {
    let mut merkle_path = path.to_owned();
    if !merkle_path.starts_with('/') && !cwd.is_empty() {
        merkle_path = format!("{}/{}", cwd, merkle_path);
    }

    let mut pos = 0;
    while let Some(offset) = merkle_path[pos..].find("/../") {
        let dotdot = pos + offset;
        if dotdot != pos {
            // A `..` segment follows a segment that isn't `..`.
            add_directory(&paths::normalize_path(&merkle_path[..dotdot]));
        }
        pos = dotdot + "/..".len();
    }

    let merkle_path = paths::normalize_path(&merkle_path);

    // Skip absolute paths unless global paths were requested, and
    // anything under a configured exclude prefix.
    if (merkle_path.starts_with('/') && !config.deps_global_paths)
        || paths::has_path_prefixes(&merkle_path, &config.deps_exclude_paths)
    {
        debug!("skipping \"{}\"", merkle_path);
        return None;
    }

    Some(merkle_path)
}

struct SharedTree {
    tree: NestedDirectory,
    file_paths: HashMap<Digest, String>,
}

/// Insert every `(local_path, remote_path)` dependency pair into the
/// tree, hashing file contents in parallel. All workers write through a
/// single coarse mutex; child ordering is fixed later at serialization.
pub fn build_merkle_tree(
    dependency_pairs: &[(String, String)],
    cwd: &str,
    config: &Config,
    tree: &mut NestedDirectory,
    file_paths: &mut HashMap<Digest, String>,
) -> Result<()> {
    debug!("building Merkle tree");

    let shared = Mutex::new(SharedTree {
        tree: std::mem::take(tree),
        file_paths: std::mem::take(file_paths),
    });

    let result = parallelize(dependency_pairs, config.max_threads, |chunk| {
        for (local_path, remote_path) in chunk {
            add_file_to_merkle_tree(local_path, remote_path, cwd, config, &shared)?;
        }
        Ok(())
    });

    let shared = shared.into_inner().unwrap();
    *tree = shared.tree;
    *file_paths = shared.file_paths;

    result
}

fn add_file_to_merkle_tree(
    local_path: &str,
    remote_path: &str,
    cwd: &str,
    config: &Config,
    shared: &Mutex<SharedTree>,
) -> Result<()> {
    let merkle_path = resolve_merkle_path(remote_path, cwd, config, |dir| {
        shared.lock().unwrap().tree.add_directory(dir);
    });
    let Some(merkle_path) = merkle_path else {
        // Path is excluded.
        return Ok(());
    };

    let entry = file_entry(local_path, config.cas_digest_function)?;

    let mut shared = shared.lock().unwrap();
    shared
        .tree
        .add_file(&merkle_path, entry.digest.clone(), entry.executable);
    shared.file_paths.insert(entry.digest, local_path.to_owned());
    Ok(())
}

/// Partition `items` across up to `max_threads` workers. The calling
/// thread processes the final partition; small inputs stay inline.
fn parallelize<T: Sync>(
    items: &[T],
    max_threads: i32,
    work: impl Fn(&[T]) -> Result<()> + Sync,
) -> Result<()> {
    if items.len() < PARALLEL_THRESHOLD || max_threads == 0 {
        return work(items);
    }

    let mut workers = max_threads;
    if workers < 0 {
        workers = num_cpus::get() as i32;
    }
    if workers <= 0 {
        workers = 1;
    }
    let workers = (workers as usize).min(items.len());
    let chunk_size = items.len() / workers;

    let work = &work;
    let mut results: Vec<Result<()>> = Vec::with_capacity(workers);
    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(workers - 1);
        let mut start = 0;
        for partition in 0..workers {
            if partition == workers - 1 {
                // The unevenly-divisible remainder goes to the calling
                // thread's partition.
                results.push(work(&items[start..]));
            } else {
                let chunk = &items[start..start + chunk_size];
                handles.push(scope.spawn(move || work(chunk)));
                start += chunk_size;
            }
        }
        for handle in handles {
            results.push(handle.join().expect("merkle worker panicked"));
        }
    });

    results.into_iter().collect()
}

/// Import a directory tree from disk, e.g. for a configured dependency
/// directory override. Symlinks are recorded as symlink nodes, never
/// followed, to keep import loops impossible.
pub fn make_nested_directory(
    root: &std::path::Path,
    digest_function: DigestFunction,
    file_paths: &mut HashMap<Digest, String>,
) -> Result<NestedDirectory> {
    let mut directory = NestedDirectory::default();

    let entries = std::fs::read_dir(root)
        .with_context(|| format!("failed to read directory {}", root.display()))?;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();
        let metadata = std::fs::symlink_metadata(&path)?;

        if metadata.file_type().is_symlink() {
            let target = std::fs::read_link(&path)?;
            directory
                .symlinks
                .insert(name, target.to_string_lossy().into_owned());
        } else if metadata.is_dir() {
            let subdir = make_nested_directory(&path, digest_function, file_paths)?;
            directory.subdirs.insert(name, subdir);
        } else {
            let path_str = path.to_string_lossy().into_owned();
            let entry = file_entry(&path_str, digest_function)?;
            file_paths.insert(entry.digest.clone(), path_str);
            directory.files.insert(name, (entry.digest, entry.executable));
        }
    }

    Ok(directory)
}

#[cfg(test)]
mod test {
    use super::*;

    fn sha256(data: &[u8]) -> Digest {
        DigestFunction::Sha256.digest_of_bytes(data)
    }

    #[test]
    fn test_empty_tree_digest() {
        let mut blobs = HashMap::new();
        let digest = NestedDirectory::default().to_digest(DigestFunction::Sha256, &mut blobs);
        // The empty Directory message serializes to zero bytes.
        assert_eq!(
            digest.hash,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(digest.size_bytes, 0);
        assert_eq!(blobs.len(), 1);
    }

    #[test]
    fn test_insertion_order_does_not_change_digest() {
        let mut first = NestedDirectory::default();
        first.add_file("a/x.o", sha256(b"x"), false);
        first.add_file("a/y.o", sha256(b"y"), false);
        first.add_directory("b");

        let mut second = NestedDirectory::default();
        second.add_directory("b");
        second.add_file("a/y.o", sha256(b"y"), false);
        second.add_file("a/x.o", sha256(b"x"), false);

        let mut blobs_first = HashMap::new();
        let mut blobs_second = HashMap::new();
        assert_eq!(
            first.to_digest(DigestFunction::Sha256, &mut blobs_first),
            second.to_digest(DigestFunction::Sha256, &mut blobs_second)
        );
    }

    #[test]
    fn test_nested_file_creates_parent_chain() {
        let mut tree = NestedDirectory::default();
        tree.add_file("a/b/c.o", sha256(b"c"), true);
        let a = tree.subdirs.get("a").unwrap();
        let b = a.subdirs.get("b").unwrap();
        let (_, executable) = b.files.get("c.o").unwrap();
        assert!(*executable);
    }

    #[test]
    fn test_wrapped_under() {
        let mut tree = NestedDirectory::default();
        tree.add_file("x.o", sha256(b"x"), false);
        let wrapped = tree.wrapped_under("build/sub");
        let build = wrapped.subdirs.get("build").unwrap();
        let sub = build.subdirs.get("sub").unwrap();
        assert!(sub.files.contains_key("x.o"));
    }

    #[test]
    fn test_resolve_merkle_path_keeps_dotdot_parents() {
        let config = Config::default();
        let mut dirs = Vec::new();
        let path = resolve_merkle_path("foo/../hello.cpp", "", &config, |d| dirs.push(d.to_owned()));
        assert_eq!(path.as_deref(), Some("hello.cpp"));
        assert_eq!(dirs, vec!["foo".to_owned()]);

        let mut dirs = Vec::new();
        let path =
            resolve_merkle_path("foo/../bar/../hello.cpp", "", &config, |d| dirs.push(d.to_owned()));
        assert_eq!(path.as_deref(), Some("hello.cpp"));
        assert_eq!(dirs, vec!["foo".to_owned(), "bar".to_owned()]);
    }

    #[test]
    fn test_resolve_merkle_path_prepends_cwd() {
        let config = Config::default();
        let path = resolve_merkle_path("hello.cpp", "recc-build", &config, |_| {});
        assert_eq!(path.as_deref(), Some("recc-build/hello.cpp"));
    }

    #[test]
    fn test_resolve_merkle_path_excludes_absolute_and_prefixed() {
        let mut config = Config::default();
        assert_eq!(resolve_merkle_path("/usr/include/x.h", "", &config, |_| {}), None);

        config.deps_global_paths = true;
        assert_eq!(
            resolve_merkle_path("/usr/include/x.h", "", &config, |_| {}).as_deref(),
            Some("/usr/include/x.h")
        );

        config.deps_exclude_paths.insert("/usr".to_owned());
        assert_eq!(resolve_merkle_path("/usr/include/x.h", "", &config, |_| {}), None);
    }

    #[test]
    fn test_build_merkle_tree_from_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.cpp"), "int main() {}\n").unwrap();

        let config = Config::default();
        let pairs = vec![(
            dir.path().join("hello.cpp").to_string_lossy().into_owned(),
            "hello.cpp".to_owned(),
        )];
        let mut tree = NestedDirectory::default();
        let mut file_paths = HashMap::new();
        build_merkle_tree(&pairs, "", &config, &mut tree, &mut file_paths).unwrap();

        assert!(tree.files.contains_key("hello.cpp"));
        assert_eq!(file_paths.len(), 1);
    }

    #[test]
    fn test_build_merkle_tree_missing_file_is_an_error() {
        let config = Config::default();
        let pairs = vec![("/definitely/not/there.cpp".to_owned(), "there.cpp".to_owned())];
        let mut tree = NestedDirectory::default();
        let mut file_paths = HashMap::new();
        assert!(build_merkle_tree(&pairs, "", &config, &mut tree, &mut file_paths).is_err());
    }

    #[test]
    fn test_parallelize_covers_every_item() {
        let items: Vec<usize> = (0..500).collect();
        let seen = Mutex::new(Vec::new());
        parallelize(&items, 4, |chunk| {
            seen.lock().unwrap().extend_from_slice(chunk);
            Ok(())
        })
        .unwrap();
        let mut seen = seen.into_inner().unwrap();
        seen.sort();
        assert_eq!(seen, items);
    }

    #[test]
    fn test_make_nested_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/file.h"), "#pragma once\n").unwrap();
        std::os::unix::fs::symlink("sub/file.h", dir.path().join("link.h")).unwrap();

        let mut file_paths = HashMap::new();
        let tree =
            make_nested_directory(dir.path(), DigestFunction::Sha256, &mut file_paths).unwrap();

        assert!(tree.subdirs.get("sub").unwrap().files.contains_key("file.h"));
        assert_eq!(tree.symlinks.get("link.h").unwrap(), "sub/file.h");
        assert_eq!(file_paths.len(), 1);
    }
}
