//! Downgrading class files on disk.

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::class_reader::read_class_file;
use crate::class_writer::write_class_file;
use crate::downgrader::{Downgrader, Status};
use crate::error::Error;

/// What to do after a unit fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BatchPolicy {
    /// Stop at the first failed unit. Units after it are not visited.
    #[default]
    AbortOnError,
    /// Record the failure and carry on with the next unit.
    Continue,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOptions {
    pub policy: BatchPolicy,
    /// Run the engine but write nothing back.
    pub dry_run: bool,
}

#[derive(Debug)]
pub enum UnitStatus {
    Downgraded,
    Unchanged,
    Failed(Error),
}

#[derive(Debug)]
pub struct UnitReport {
    pub path: PathBuf,
    pub status: UnitStatus,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub units: Vec<UnitReport>,
}

impl BatchReport {
    pub fn has_failures(&self) -> bool {
        self.failures().next().is_some()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&Path, &Error)> + '_ {
        self.units.iter().filter_map(|unit| match &unit.status {
            UnitStatus::Failed(err) => Some((unit.path.as_path(), err)),
            _ => None,
        })
    }

    pub fn count(&self, wanted: fn(&UnitStatus) -> bool) -> usize {
        self.units.iter().filter(|unit| wanted(&unit.status)).count()
    }
}

/// Every `.class` file under `roots`, in sorted order. A root that names a file is
/// taken as is, whatever its extension.
pub fn collect_class_files<P: AsRef<Path>>(roots: &[P]) -> Result<Vec<PathBuf>, Error> {
    let mut files = Vec::new();
    for root in roots {
        let root = root.as_ref();
        if root.is_file() {
            files.push(root.to_path_buf());
            continue;
        }
        for entry in WalkDir::new(root).follow_links(true) {
            let entry = entry.map_err(|err| Error::Io {
                path: err.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf()),
                source: err.into(),
            })?;
            let path = entry.path();
            if entry.file_type().is_file()
                && path.extension().is_some_and(|ext| ext == "class")
            {
                files.push(path.to_path_buf());
            }
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

/// Decodes, downgrades and (unless dry-running) rewrites one class file in place.
/// Unchanged files are never written.
pub fn downgrade_file(
    path: &Path,
    downgrader: &Downgrader,
    dry_run: bool,
) -> Result<UnitStatus, Error> {
    let bytes = fs::read(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut class = read_class_file(&bytes)?;
    let outcome = downgrader.downgrade(&mut class)?;
    for failure in &outcome.failures {
        log::warn!("{}: {failure}", path.display());
    }
    if outcome.status == Status::Unchanged {
        return Ok(UnitStatus::Unchanged);
    }

    let encoded = write_class_file(&class)?;
    if dry_run {
        log::info!("{}: would write {} bytes", path.display(), encoded.len());
    } else {
        fs::write(path, &encoded).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
    }
    Ok(UnitStatus::Downgraded)
}

pub fn run<P: AsRef<Path>>(
    roots: &[P],
    downgrader: &Downgrader,
    options: BatchOptions,
) -> Result<BatchReport, Error> {
    let files = collect_class_files(roots)?;
    log::debug!("found {} class file(s)", files.len());

    let mut report = BatchReport::default();
    for path in files {
        let status = match downgrade_file(&path, downgrader, options.dry_run) {
            Ok(status) => status,
            Err(err) => {
                log::error!("{}: {err}", path.display());
                UnitStatus::Failed(err)
            }
        };
        let failed = matches!(status, UnitStatus::Failed(_));
        report.units.push(UnitReport { path, status });
        if failed && options.policy == BatchPolicy::AbortOnError {
            break;
        }
    }
    Ok(report)
}
