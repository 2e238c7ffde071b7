use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::UploadError;

pub const DESCRIPTOR_EXTENSION: &str = "meta";

/// Metadata the conversion stage writes next to each payload file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobDescriptor {
    pub name: String,
    pub description: String,
    pub commute: bool,
    pub trainer: bool,
    pub data_type: String,
    pub sport_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gear_id: Option<String>,
    pub external_id: String,
    pub file_name: String,
    /// Vendor shoe id the gear mapping was derived from. Never uploaded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shoe: Option<String>,
}

/// A descriptor found by the scanner. The descriptor body is only read by
/// the worker that claims the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingJob {
    pub descriptor_path: PathBuf,
}

impl PendingJob {
    pub fn load(&self) -> Result<JobDescriptor, UploadError> {
        let bytes = fs::read(&self.descriptor_path)
            .map_err(|err| UploadError::io(&self.descriptor_path, err))?;
        let descriptor: JobDescriptor = serde_json::from_slice(&bytes)
            .map_err(|err| UploadError::json(&self.descriptor_path, err))?;
        if descriptor.file_name.trim().is_empty() {
            return Err(UploadError::json(
                &self.descriptor_path,
                serde::de::Error::missing_field("file_name"),
            ));
        }
        Ok(descriptor)
    }

    /// Payload files live beside their descriptor.
    pub fn payload_path(&self, descriptor: &JobDescriptor) -> PathBuf {
        self.descriptor_path.with_file_name(&descriptor.file_name)
    }

    pub fn label(&self) -> String {
        self.descriptor_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.descriptor_path.display().to_string())
    }
}

/// List every descriptor directly inside `dir`, sorted by path. Nested
/// directories, including the completed directory, are never descended into.
pub fn scan_pending(dir: &Path) -> Result<Vec<PendingJob>, UploadError> {
    let mut jobs = Vec::new();
    for entry in fs::read_dir(dir).map_err(|err| UploadError::io(dir, err))? {
        let entry = entry.map_err(|err| UploadError::io(dir, err))?;
        let file_type = entry
            .file_type()
            .map_err(|err| UploadError::io(entry.path(), err))?;
        if !file_type.is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some(DESCRIPTOR_EXTENSION) {
            jobs.push(PendingJob {
                descriptor_path: path,
            });
        }
    }
    jobs.sort_by(|a, b| a.descriptor_path.cmp(&b.descriptor_path));
    Ok(jobs)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn write_job(dir: &Path, stem: &str, with_payload: bool) -> PathBuf {
        let file_name = format!("{stem}.gpx.gz");
        let descriptor = JobDescriptor {
            name: format!("Run {stem}"),
            description: "Imported activity".to_string(),
            data_type: "gpx.gz".to_string(),
            sport_type: "Run".to_string(),
            external_id: stem.to_string(),
            file_name: file_name.clone(),
            ..JobDescriptor::default()
        };
        let descriptor_path = dir.join(format!("{stem}.gpx.{DESCRIPTOR_EXTENSION}"));
        fs::write(
            &descriptor_path,
            serde_json::to_vec_pretty(&descriptor).unwrap(),
        )
        .unwrap();
        if with_payload {
            fs::write(dir.join(&file_name), format!("payload {stem}")).unwrap();
        }
        descriptor_path
    }

    #[test]
    fn scan_finds_only_top_level_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        write_job(dir.path(), "b", true);
        write_job(dir.path(), "a", true);
        fs::write(dir.path().join("access.token"), "{}").unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();
        let nested = dir.path().join("uploaded");
        fs::create_dir_all(&nested).unwrap();
        write_job(&nested, "c", true);

        let jobs = scan_pending(dir.path()).unwrap();
        let labels: Vec<String> = jobs.iter().map(PendingJob::label).collect();
        assert_eq!(labels, vec!["a.gpx.meta", "b.gpx.meta"]);
    }

    #[test]
    fn scan_of_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = scan_pending(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, UploadError::Io { .. }));
    }

    #[test]
    fn descriptor_uses_snake_case_keys_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.gpx.meta");
        fs::write(
            &path,
            r#"{"name":"Evening Ride","description":"d","data_type":"tcx.gz","sport_type":"Ride",
               "external_id":"99","file_name":"x.tcx.gz","gear_id":"b123","shoe":"s1","unknown":1}"#,
        )
        .unwrap();

        let job = PendingJob {
            descriptor_path: path,
        };
        let descriptor = job.load().unwrap();
        assert_eq!(descriptor.name, "Evening Ride");
        assert_eq!(descriptor.gear_id.as_deref(), Some("b123"));
        assert!(!descriptor.commute);
        assert_eq!(job.payload_path(&descriptor), dir.path().join("x.tcx.gz"));
    }

    #[test]
    fn descriptor_without_file_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.meta");
        fs::write(&path, r#"{"name":"No payload"}"#).unwrap();

        let err = PendingJob {
            descriptor_path: path,
        }
        .load()
        .unwrap_err();
        assert!(matches!(err, UploadError::Json { .. }));
    }
}
