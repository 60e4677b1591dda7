//! Deciding what a sync has to do, without doing any of it.
//!
//! Everything in here is pure: records in, [`Plan`] out. Record paths must
//! already be relative to their prefix, so the same key means the same file
//! on both sides.

use crate::error::Result;
use crate::options::{SyncOptions, in_scope};
use ferry_storage::FileRecord;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// What to do with one source record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Skip,
    Transfer,
    /// A file on one side and a directory on the other.
    Conflict,
}

/// Compare a source record against its destination counterpart (if any).
///
/// Identities are trusted when both sides computed them the same way. When
/// they can't be compared (a BLAKE3 digest against an S3 ETag, or one side
/// without an identity) equal size and a destination that isn't older than
/// the source are taken to mean "already there". That fallback is a
/// heuristic, not proof of byte equality.
pub fn decide(source: &FileRecord, destination: Option<&FileRecord>) -> Decision {
    let Some(destination) = destination else {
        return match source.is_directory {
            // Directories come into existence with the files inside them.
            true => Decision::Skip,
            false => Decision::Transfer,
        };
    };
    match (source.is_directory, destination.is_directory) {
        (true, true) => return Decision::Skip,
        (true, false) | (false, true) => return Decision::Conflict,
        (false, false) => {},
    }
    if let (Some(a), Some(b)) = (&source.identity, &destination.identity)
        && let Some(equal) = a.matches(b)
    {
        return match equal {
            true => Decision::Skip,
            false => Decision::Transfer,
        };
    }
    match source.size == destination.size && source.modified <= destination.modified {
        true => Decision::Skip,
        false => Decision::Transfer,
    }
}

/// Everything a sync intends to do.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Plan {
    /// Source records to copy, sorted by path.
    pub transfers: Vec<FileRecord>,
    /// Destination records to remove: files first, then directories with the
    /// deepest first, so a directory is always empty by the time its turn
    /// comes.
    pub deletes: Vec<FileRecord>,
    /// Source files already present at the destination.
    pub skipped: usize,
    /// Paths that are a file on one side and a directory on the other.
    pub conflicts: Vec<PathBuf>,
}

impl Plan {
    /// Total bytes the transfers will move.
    pub fn bytes(&self) -> u64 {
        self.transfers.iter().map(|r| r.size).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty() && self.deletes.is_empty() && self.conflicts.is_empty()
    }
}

/// Build the plan for syncing `source` onto `destination`.
///
/// Both listings must be complete; `options.scope` and `options.exclude`
/// narrow what gets transferred or deleted, never what gets compared.
pub fn plan(source: &[FileRecord], destination: &[FileRecord], options: &SyncOptions) -> Result<Plan> {
    let scope = options.validated()?;
    let scope = scope.as_ref();
    // Read-only from here on.
    let lookup: HashMap<&Path, &FileRecord> = destination.iter().map(|r| (r.path.as_path(), r)).collect();

    let mut plan = Plan::default();
    for record in source {
        if !in_scope(scope, &record.path) || options.is_excluded(&record.path) {
            continue;
        }
        let decision = decide(record, lookup.get(record.path.as_path()).copied());
        match decision {
            Decision::Transfer => plan.transfers.push(record.clone()),
            Decision::Conflict => plan.conflicts.push(record.path.clone()),
            Decision::Skip if !record.is_directory => plan.skipped += 1,
            Decision::Skip => {},
        }
    }
    plan.transfers.sort_by(|a, b| a.path.cmp(&b.path));
    plan.conflicts.sort();

    if options.delete_extraneous {
        let present: HashSet<&Path> = source.iter().map(|r| r.path.as_path()).collect();
        // A destination directory that contains anything the source has is
        // needed, even if the source never listed the directory itself.
        let needed: HashSet<&Path> = source.iter().flat_map(|r| r.path.ancestors().skip(1)).collect();
        plan.deletes = destination
            .iter()
            .filter(|r| !present.contains(r.path.as_path()))
            .filter(|r| !(r.is_directory && needed.contains(r.path.as_path())))
            .filter(|r| in_scope(scope, &r.path) && !options.is_excluded(&r.path))
            .cloned()
            .collect();
        plan.deletes.sort_by_key(|r| (r.is_directory, Reverse(r.path.components().count()), r.path.clone()));
    }
    Ok(plan)
}
