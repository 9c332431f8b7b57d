//! Path filtering
//!
//! Decides whether a path takes part in the mirror. The decision depends only
//! on the segments of the path relative to its root, so it can be evaluated for
//! source paths, destination paths and event paths alike.

use crate::roots::SyncRoots;
use std::ffi::OsString;
use std::path::{Component, Path};

/// Pure predicate over paths, shared by the bulk walk and the event syncer.
#[derive(Debug, Clone)]
pub struct PathFilter {
    roots: SyncRoots,
    ignored_segments: Vec<OsString>,
}

impl PathFilter {
    pub fn new(roots: SyncRoots, ignored_segments: &[String]) -> Self {
        Self {
            roots,
            ignored_segments: ignored_segments.iter().map(OsString::from).collect(),
        }
    }

    /// True when any segment of the path equals an ignored name.
    ///
    /// Paths under neither root are judged on their raw segments.
    pub fn should_ignore(&self, path: &Path) -> bool {
        let relative = self.roots.relative(path).unwrap_or(path);

        relative.components().any(|component| match component {
            Component::Normal(segment) => self.ignored_segments.iter().any(|s| s == segment),
            _ => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::path::PathBuf;

    fn filter() -> PathFilter {
        let roots = SyncRoots::new("/srv/share/src", "/home/me/mirror").unwrap();
        PathFilter::new(roots, &["build".to_string()])
    }

    #[test]
    fn test_build_segment_anywhere() {
        let filter = filter();

        assert!(filter.should_ignore(Path::new("/srv/share/src/build")));
        assert!(filter.should_ignore(Path::new("/srv/share/src/build/output.o")));
        assert!(filter.should_ignore(Path::new("/srv/share/src/a/b/build/c.txt")));
        assert!(filter.should_ignore(Path::new("/home/me/mirror/x/build")));
    }

    #[test]
    fn test_similar_names_are_kept() {
        let filter = filter();

        assert!(!filter.should_ignore(Path::new("/srv/share/src/builder/a.txt")));
        assert!(!filter.should_ignore(Path::new("/srv/share/src/build.rs")));
        assert!(!filter.should_ignore(Path::new("/srv/share/src/rebuild/x")));
        assert!(!filter.should_ignore(Path::new("/srv/share/src/Build/x")));
    }

    #[test]
    fn test_root_segments_do_not_count() {
        let roots = SyncRoots::new("/build/src", "/home/me/mirror").unwrap();
        let filter = PathFilter::new(roots, &["build".to_string()]);

        assert!(!filter.should_ignore(Path::new("/build/src/main.c")));
        assert!(!filter.should_ignore(Path::new("/build/src")));
    }

    #[test]
    fn test_outside_roots_uses_raw_path() {
        let filter = filter();

        assert!(filter.should_ignore(Path::new("/tmp/build/x")));
        assert!(!filter.should_ignore(Path::new("/tmp/other/x")));
        assert!(filter.should_ignore(Path::new("build")));
    }

    #[quickcheck]
    fn prop_ignored_iff_a_segment_is_build(segments: Vec<u8>) -> bool {
        let names = ["a", "build", "src", "builds", "b-uild", "x"];
        let rel: PathBuf = segments
            .iter()
            .map(|i| names[*i as usize % names.len()])
            .collect();
        let expected = rel.components().any(|c| c.as_os_str() == "build");

        filter().should_ignore(&Path::new("/srv/share/src").join(&rel)) == expected
    }
}
