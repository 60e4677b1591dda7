use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use glob::Pattern;
use std::path::{Component, Path};

/// Compiled exclude patterns for one watch.
///
/// A relative path is excluded when a pattern matches the whole path or one
/// of its ancestors. Patterns without a `/` also match any single component,
/// so `*.tmp` excludes `run/a.tmp` and `cache` excludes `a/cache/b`.
///
/// ```
/// use ferry_watch::ExcludeSet;
/// use std::path::Path;
///
/// let excludes = ExcludeSet::new(["*.tmp", "scratch/**", ".git"]).unwrap();
/// assert!(excludes.is_excluded(Path::new("runs/a.tmp")));
/// assert!(excludes.is_excluded(Path::new("scratch/deep/file")));
/// assert!(excludes.is_excluded(Path::new("sub/.git/HEAD")));
/// assert!(!excludes.is_excluded(Path::new("runs/a.h5")));
/// ```
#[derive(Clone, Debug, Default)]
pub struct ExcludeSet {
    patterns: Vec<(Pattern, bool)>,
}

impl ExcludeSet {
    pub fn new(patterns: impl IntoIterator<Item = impl AsRef<str>>) -> Result<Self> {
        let patterns = patterns
            .into_iter()
            .map(|raw| {
                let raw = raw.as_ref();
                let pattern = Pattern::new(raw)
                    .or_raise(|| ErrorKind::InvalidDefinition(format!("invalid exclude pattern `{raw}`")))?;
                Ok((pattern, !raw.contains('/')))
            })
            .collect::<Result<_>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn is_excluded(&self, relative: &Path) -> bool {
        self.patterns.iter().any(|(pattern, any_component)| {
            relative.ancestors().filter(|a| !a.as_os_str().is_empty()).any(|a| pattern.matches_path(a))
                || (*any_component
                    && relative.components().any(|c| match c {
                        Component::Normal(name) => name.to_str().is_some_and(|name| pattern.matches(name)),
                        _ => false,
                    }))
        })
    }
}
