use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::UploadError;

pub const COMPLETED_DIR_NAME: &str = "uploaded";

/// The completed directory doubles as the record of what has been uploaded:
/// a job is done exactly when its descriptor lives here instead of in the
/// pending directory.
///
/// Archival happens only after the platform confirmed the upload. A crash
/// between that confirmation and the move leaves the job pending, so the
/// next run uploads it again. That window is accepted.
#[derive(Debug, Clone)]
pub struct CompletionLedger {
    completed_dir: PathBuf,
}

impl CompletionLedger {
    pub fn for_pending_dir(pending_dir: &Path) -> Self {
        Self {
            completed_dir: pending_dir.join(COMPLETED_DIR_NAME),
        }
    }

    pub fn completed_dir(&self) -> &Path {
        &self.completed_dir
    }

    /// Move the descriptor, then the payload, then the raw source file (if
    /// any) into the completed directory. The descriptor goes first so an
    /// interrupted archive never leaves a descriptor pointing at a payload
    /// that has already moved.
    pub fn archive(
        &self,
        descriptor: &Path,
        payload: &Path,
        raw_source: Option<&Path>,
    ) -> Result<Vec<PathBuf>, UploadError> {
        fs::create_dir_all(&self.completed_dir)
            .map_err(|err| UploadError::io(&self.completed_dir, err))?;

        let mut moved = Vec::with_capacity(3);
        moved.push(self.move_file(descriptor)?);
        moved.push(self.move_file(payload)?);
        if let Some(raw) = raw_source {
            moved.push(self.move_file(raw)?);
        }
        Ok(moved)
    }

    fn move_file(&self, source: &Path) -> Result<PathBuf, UploadError> {
        let file_name = source.file_name().ok_or_else(|| {
            UploadError::io(
                source,
                io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"),
            )
        })?;
        let target = self.completed_dir.join(file_name);
        match fs::rename(source, &target) {
            Ok(()) => Ok(target),
            Err(err) if err.kind() == io::ErrorKind::CrossesDevices => {
                fs::copy(source, &target).map_err(|err| UploadError::io(&target, err))?;
                fs::remove_file(source).map_err(|err| UploadError::io(source, err))?;
                Ok(target)
            }
            Err(err) => Err(UploadError::io(source, err)),
        }
    }
}

/// The unconverted file a payload was produced from: the payload name minus
/// its last extension (`run.gpx` for `run.gpx.gz`), if such a file exists.
pub fn raw_source_for(payload: &Path) -> Option<PathBuf> {
    let stem = payload.file_stem()?;
    let candidate = payload.with_file_name(stem);
    if candidate != payload && candidate.is_file() {
        Some(candidate)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_moves_files_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = dir.path().join("run.gpx.meta");
        let payload = dir.path().join("run.gpx.gz");
        fs::write(&descriptor, r#"{"file_name":"run.gpx.gz"}"#).unwrap();
        fs::write(&payload, b"\x1f\x8bgzip-bytes").unwrap();

        let ledger = CompletionLedger::for_pending_dir(dir.path());
        let moved = ledger.archive(&descriptor, &payload, None).unwrap();

        assert_eq!(moved.len(), 2);
        assert!(!descriptor.exists());
        assert!(!payload.exists());
        let archived = dir.path().join(COMPLETED_DIR_NAME);
        assert_eq!(
            fs::read_to_string(archived.join("run.gpx.meta")).unwrap(),
            r#"{"file_name":"run.gpx.gz"}"#
        );
        assert_eq!(
            fs::read(archived.join("run.gpx.gz")).unwrap(),
            b"\x1f\x8bgzip-bytes"
        );
    }

    #[test]
    fn archive_includes_raw_source_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = dir.path().join("run.gpx.meta");
        let payload = dir.path().join("run.gpx.gz");
        let raw = dir.path().join("run.gpx");
        fs::write(&descriptor, "{}").unwrap();
        fs::write(&payload, "gz").unwrap();
        fs::write(&raw, "<gpx/>").unwrap();

        let raw_source = raw_source_for(&payload);
        assert_eq!(raw_source.as_deref(), Some(raw.as_path()));

        let ledger = CompletionLedger::for_pending_dir(dir.path());
        ledger
            .archive(&descriptor, &payload, raw_source.as_deref())
            .unwrap();
        assert!(!raw.exists());
        assert!(ledger.completed_dir().join("run.gpx").is_file());
    }

    #[test]
    fn raw_source_absent_when_no_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let payload = dir.path().join("run.gpx.gz");
        fs::write(&payload, "gz").unwrap();
        assert_eq!(raw_source_for(&payload), None);

        let plain = dir.path().join("payload");
        fs::write(&plain, "x").unwrap();
        assert_eq!(raw_source_for(&plain), None);
    }

    #[test]
    fn archive_of_missing_payload_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = dir.path().join("run.gpx.meta");
        fs::write(&descriptor, "{}").unwrap();

        let ledger = CompletionLedger::for_pending_dir(dir.path());
        let err = ledger
            .archive(&descriptor, &dir.path().join("missing.gz"), None)
            .unwrap_err();
        assert!(err.to_string().contains("missing.gz"));
    }
}
