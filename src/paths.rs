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

//! Purely lexical path manipulation.
//!
//! Everything in here works on `str` paths without touching the filesystem
//! (the one exception is [`resolve_symlink`], which reads a link target).
//! Remote paths are plain `/`-separated strings, so these helpers
//! deliberately avoid `std::path::Path`, whose platform semantics we don't
//! want applied to paths that will be resolved on a remote worker.

use std::collections::BTreeSet;

use crate::config::Config;
use crate::errors::*;

/// Collapse `.`, `..` and repeated-slash segments without consulting the
/// filesystem. A `..` at the start of a relative path is preserved; a `..`
/// at the root of an absolute path is dropped.
pub fn normalize_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.last().is_some_and(|s| *s != "..") {
                    segments.pop();
                } else if !absolute {
                    segments.push("..");
                }
            }
            s => segments.push(s),
        }
    }

    if absolute {
        format!("/{}", segments.join("/"))
    } else if segments.is_empty() {
        ".".to_owned()
    } else {
        segments.join("/")
    }
}

pub fn is_absolute_path(path: &str) -> bool {
    path.starts_with('/')
}

/// True iff `path == prefix` or `path` starts with `prefix/`. The empty
/// prefix never matches, and `/foo` is not a prefix of `/foobar`.
pub fn has_path_prefix(path: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return false;
    }
    if path == prefix {
        return true;
    }
    let mut prefix = prefix.to_owned();
    if !prefix.ends_with('/') {
        prefix.push('/');
    }
    path.starts_with(&prefix)
}

pub fn has_path_prefixes(path: &str, prefixes: &BTreeSet<String>) -> bool {
    prefixes.iter().any(|prefix| has_path_prefix(path, prefix))
}

/// Maximum number of levels a path escapes above its starting directory.
/// Returns 0 if the path never reaches above itself.
pub fn parent_directory_levels(path: &str) -> i32 {
    let mut current = 0i32;
    let mut lowest = 0i32;
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                current -= 1;
                lowest = lowest.min(current);
            }
            _ => current += 1,
        }
    }
    -lowest
}

/// The last `n` segments of `path` joined by `/`, without a trailing slash.
/// A relative single-segment path satisfies `n == 1`; otherwise the path
/// must contain at least `n` slashes.
pub fn last_n_segments(path: &str, n: usize) -> Result<String> {
    if n == 0 {
        return Ok(String::new());
    }

    let trimmed = path.strip_suffix('/').unwrap_or(path);
    let slashes: Vec<usize> = trimmed.match_indices('/').map(|(i, _)| i).collect();
    if slashes.len() >= n {
        let start = slashes[slashes.len() - n] + 1;
        return Ok(trimmed[start..].to_owned());
    }
    if slashes.is_empty() && n == 1 && !trimmed.is_empty() {
        return Ok(trimmed.to_owned());
    }
    Err(PathError::NotEnoughSegments {
        path: path.to_owned(),
        n,
    }
    .into())
}

/// Apply the first matching entry of the configured prefix-replacement
/// list, then normalize. Paths that match no entry pass through unchanged.
pub fn resolve_path_from_prefix_map(path: &str, config: &Config) -> String {
    if config.prefix_map.is_empty() {
        return path.to_owned();
    }

    for (from, to) in &config.prefix_map {
        if has_path_prefix(path, from) {
            // The replacement is terminated with a slash so that mapping
            // onto `/` works; double slashes disappear in normalization.
            let replaced = format!("{}/{}", to, &path[from.len()..]);
            return normalize_path(&replaced);
        }
    }
    path.to_owned()
}

/// Rewrite an absolute `path` to one relative to `cwd`. Returns the input
/// unchanged unless both are absolute.
pub fn make_path_relative(path: &str, cwd: &str) -> String {
    if !path.starts_with('/') || !cwd.starts_with('/') {
        return path.to_owned();
    }

    let norm_path = normalize_path(path);
    let norm_cwd = normalize_path(cwd);
    let path_segments: Vec<&str> = norm_path.split('/').filter(|s| !s.is_empty()).collect();
    let cwd_segments: Vec<&str> = norm_cwd.split('/').filter(|s| !s.is_empty()).collect();

    let common = path_segments
        .iter()
        .zip(cwd_segments.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut result: Vec<&str> = Vec::new();
    for _ in common..cwd_segments.len() {
        result.push("..");
    }
    result.extend(&path_segments[common..]);

    if result.is_empty() {
        ".".to_owned()
    } else {
        result.join("/")
    }
}

/// Rewrite `path` to be relative to `cwd` iff it lies under the configured
/// project root and rewriting hasn't been disabled.
pub fn rewrite_path_to_relative(path: &str, cwd: &str, config: &Config) -> String {
    if !config.no_path_rewrite && has_path_prefix(path, &config.project_root) {
        make_path_relative(path, cwd)
    } else {
        path.to_owned()
    }
}

/// The canonical transformation of a local path into its remote spelling:
/// prefix replacement, then project-root-relative rewriting, then (when
/// requested) normalization.
///
/// Callers that must preserve degenerate spellings like `./gcc` pass
/// `normalize = false`; normalization would strip the path down to a bare
/// basename, which the Remote Execution API rejects for `argv[0]`.
pub fn modify_path_for_remote(path: &str, cwd: &str, normalize: bool, config: &Config) -> String {
    let replaced = resolve_path_from_prefix_map(path, config);
    let replaced = rewrite_path_to_relative(&replaced, cwd, config);
    if normalize && !config.no_path_rewrite {
        normalize_path(&replaced)
    } else {
        replaced
    }
}

/// Read one level of symlink indirection, resolving a relative target
/// against the link's own directory.
pub fn resolve_symlink(path: &str) -> Result<String> {
    let target = std::fs::read_link(path)
        .with_context(|| format!("failed to read symlink \"{}\"", path))?;
    let target = target
        .to_str()
        .ok_or_else(|| anyhow!("symlink target of \"{}\" is not valid UTF-8", path))?
        .to_owned();

    if is_absolute_path(&target) {
        return Ok(target);
    }
    match path.rfind('/') {
        Some(slash) => Ok(format!("{}{}", &path[..slash + 1], target)),
        None => Ok(target),
    }
}

pub fn strip_directory(path: &str) -> &str {
    match path.rfind('/') {
        Some(slash) => &path[slash + 1..],
        None => path,
    }
}

/// Replace everything from the last `.` onwards with `suffix` (which
/// includes its own dot). A path without a dot gets the suffix appended.
pub fn replace_suffix(path: &str, suffix: &str) -> String {
    let base = match path.rfind('.') {
        Some(dot) => &path[..dot],
        None => path,
    };
    format!("{}{}", base, suffix)
}

/// Split a path into its non-empty components.
pub fn parse_directories(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

pub fn current_working_directory() -> String {
    match std::env::current_dir() {
        Ok(cwd) => cwd.to_string_lossy().into_owned(),
        Err(e) => {
            error!("could not get current working directory: {}", e);
            String::new()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("a/b/c"), "a/b/c");
        assert_eq!(normalize_path("a//b///c"), "a/b/c");
        assert_eq!(normalize_path("a/./b/."), "a/b");
        assert_eq!(normalize_path("a/b/../c"), "a/c");
        assert_eq!(normalize_path("a/b/../../c"), "c");
        assert_eq!(normalize_path("../a"), "../a");
        assert_eq!(normalize_path("a/../../b"), "../b");
        assert_eq!(normalize_path("/a/../../b"), "/b");
        assert_eq!(normalize_path("/.."), "/");
        assert_eq!(normalize_path("recc-build/"), "recc-build");
        assert_eq!(normalize_path("foo/.."), ".");
        assert_eq!(normalize_path("./gcc"), "gcc");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for path in ["a/b/../c", "/usr//include/./x.h", "../..", "foo/../bar"] {
            let once = normalize_path(path);
            assert_eq!(normalize_path(&once), once);
        }
    }

    #[test]
    fn test_has_path_prefix() {
        assert!(has_path_prefix("/a/b/c", "/a/b"));
        assert!(has_path_prefix("/a/b", "/a/b"));
        assert!(has_path_prefix("/a/b/c", "/a/b/"));
        assert!(!has_path_prefix("/a/bc", "/a/b"));
        assert!(!has_path_prefix("/foobar", "/foo"));
        assert!(!has_path_prefix("/a/b", ""));
    }

    #[test]
    fn test_parent_directory_levels() {
        assert_eq!(parent_directory_levels(""), 0);
        assert_eq!(parent_directory_levels("b.c"), 0);
        assert_eq!(parent_directory_levels("a/b.c"), 0);
        assert_eq!(parent_directory_levels(".."), 1);
        assert_eq!(parent_directory_levels("../.."), 2);
        assert_eq!(parent_directory_levels("a/../.."), 1);
        assert_eq!(parent_directory_levels("a/../../b/c/../../.."), 2);
    }

    #[test]
    fn test_last_n_segments() {
        assert_eq!(last_n_segments("/a/b/c", 0).unwrap(), "");
        assert_eq!(last_n_segments("/a/b/c", 1).unwrap(), "c");
        assert_eq!(last_n_segments("/a/b/c", 2).unwrap(), "b/c");
        assert_eq!(last_n_segments("/a/b/c", 3).unwrap(), "a/b/c");
        assert_eq!(last_n_segments("/a/b/c/", 2).unwrap(), "b/c");
        assert_eq!(last_n_segments("segment", 1).unwrap(), "segment");
        assert!(last_n_segments("/a/b/c", 4).is_err());
        assert!(last_n_segments("a/b", 2).is_err());
    }

    #[test]
    fn test_make_path_relative() {
        assert_eq!(make_path_relative("/a/b/c", "/a/b"), "c");
        assert_eq!(make_path_relative("/a/b/c", "/a"), "b/c");
        assert_eq!(make_path_relative("/a/d", "/a/b"), "../d");
        assert_eq!(make_path_relative("/x/y", "/a/b"), "../../x/y");
        assert_eq!(make_path_relative("/a/b", "/a/b"), ".");
        assert_eq!(make_path_relative("relative/path", "/a/b"), "relative/path");
    }

    #[test]
    fn test_resolve_path_from_prefix_map() {
        let mut config = Config::default();
        config.prefix_map = vec![("/usr/bin".to_owned(), "/usr/local/bin".to_owned())];
        assert_eq!(
            resolve_path_from_prefix_map("/usr/bin/gcc", &config),
            "/usr/local/bin/gcc"
        );
        assert_eq!(
            resolve_path_from_prefix_map("/usr/bin", &config),
            "/usr/local/bin"
        );
        assert_eq!(
            resolve_path_from_prefix_map("/usr/binx/gcc", &config),
            "/usr/binx/gcc"
        );

        // First match wins.
        config.prefix_map = vec![
            ("/usr".to_owned(), "/one".to_owned()),
            ("/usr/bin".to_owned(), "/two".to_owned()),
        ];
        assert_eq!(
            resolve_path_from_prefix_map("/usr/bin/gcc", &config),
            "/one/bin/gcc"
        );
    }

    #[test]
    fn test_modify_path_for_remote() {
        let mut config = Config::default();
        config.project_root = "/home/user/project".to_owned();
        let cwd = "/home/user/project/build";

        assert_eq!(
            modify_path_for_remote("/home/user/project/src/a.cpp", cwd, true, &config),
            "../src/a.cpp"
        );
        // Paths outside the project root pass through verbatim.
        assert_eq!(
            modify_path_for_remote("/usr/include/stdio.h", cwd, true, &config),
            "/usr/include/stdio.h"
        );
        // Relative paths are left alone (no prefix map, already relative).
        assert_eq!(modify_path_for_remote("hello.cpp", cwd, true, &config), "hello.cpp");
        // No normalization keeps `./gcc` remote-executable.
        assert_eq!(modify_path_for_remote("./gcc", cwd, false, &config), "./gcc");
    }

    #[test]
    fn test_modify_path_for_remote_is_idempotent_without_config() {
        let config = Config::default();
        for path in ["hello.cpp", "sub/dir/x.o", "/abs/file.h"] {
            let once = modify_path_for_remote(path, "/cwd", true, &config);
            assert_eq!(modify_path_for_remote(&once, "/cwd", true, &config), once);
        }
    }

    #[test]
    fn test_replace_suffix() {
        assert_eq!(replace_suffix("hello.cpp", ".o"), "hello.o");
        assert_eq!(replace_suffix("a/b/hello.cpp", ".d"), "a/b/hello.d");
        assert_eq!(replace_suffix("noext", ".o"), "noext.o");
    }

    #[test]
    fn test_strip_directory() {
        assert_eq!(strip_directory("a/b/hello.cpp"), "hello.cpp");
        assert_eq!(strip_directory("hello.cpp"), "hello.cpp");
    }
}
