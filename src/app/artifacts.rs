use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use mime_guess::MimeGuess;
use tracing::{info, warn};

use crate::app::adb::paths::sanitize_filename_component;
use crate::app::error::AppError;
use crate::app::models::{Artifact, ArtifactKind};

pub const UPLOADS_DIR: &str = "uploads";

/// Directory-backed record of produced files. Files are only ever added;
/// removal is left to whoever cleans the artifact root.
pub struct ArtifactStore {
    root: PathBuf,
    recorded: RwLock<HashMap<PathBuf, Artifact>>,
}

impl ArtifactStore {
    pub fn open(root: impl Into<PathBuf>, trace_id: &str) -> Result<Self, AppError> {
        let root = root.into();
        for dir in ["captures", "logs", UPLOADS_DIR] {
            fs::create_dir_all(root.join(dir)).map_err(|err| {
                AppError::system(format!("Failed to create artifact dir {dir}: {err}"), trace_id)
            })?;
        }
        Ok(Self {
            root,
            recorded: RwLock::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir_for(&self, kind: ArtifactKind) -> PathBuf {
        self.root.join(kind.dir_name())
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.root.join(UPLOADS_DIR)
    }

    /// Fresh, not yet existing path such as
    /// `captures/record_R5CT123_20260101_120000_123.mp4`. The name is not
    /// reserved; use `create_unique` when this process writes the file.
    pub fn allocate_path(&self, kind: ArtifactKind, serial: &str, label: &str) -> PathBuf {
        let (dir, stem) = self.name_parts(kind, serial, label);
        let mut suffix = 0;
        loop {
            let candidate = candidate_path(&dir, &stem, suffix, kind);
            if !candidate.exists() {
                return candidate;
            }
            suffix += 1;
        }
    }

    /// Like `allocate_path`, but claims the name by creating the file, so
    /// concurrent callers never share a path.
    pub fn create_unique(
        &self,
        kind: ArtifactKind,
        serial: &str,
        label: &str,
        trace_id: &str,
    ) -> Result<(PathBuf, fs::File), AppError> {
        let (dir, stem) = self.name_parts(kind, serial, label);
        let mut suffix = 0;
        loop {
            let candidate = candidate_path(&dir, &stem, suffix, kind);
            match fs::OpenOptions::new().write(true).create_new(true).open(&candidate) {
                Ok(file) => return Ok((candidate, file)),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => suffix += 1,
                Err(err) => {
                    return Err(AppError::system(
                        format!("Failed to create artifact file: {err}"),
                        trace_id,
                    ))
                }
            }
        }
    }

    fn name_parts(&self, kind: ArtifactKind, serial: &str, label: &str) -> (PathBuf, String) {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S_%3f");
        let stem = format!(
            "{}_{}_{}",
            sanitize_filename_component(label),
            sanitize_filename_component(serial),
            stamp
        );
        (self.dir_for(kind), stem)
    }

    /// Records a produced file. Missing or empty files are not artifacts and
    /// yield `Ok(None)`.
    pub fn record(
        &self,
        path: &Path,
        kind: ArtifactKind,
        session_id: Option<&str>,
        serial: Option<&str>,
        trace_id: &str,
    ) -> Result<Option<Artifact>, AppError> {
        let metadata = match fs::metadata(path) {
            Ok(metadata) if metadata.is_file() && metadata.len() > 0 => metadata,
            Ok(_) => return Ok(None),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(AppError::system(
                    format!("Failed to stat artifact: {err}"),
                    trace_id,
                ))
            }
        };

        let mut artifact = describe(path, kind, &metadata);
        artifact.session_id = session_id.map(str::to_string);
        artifact.serial = serial.map(str::to_string);

        self.write_lock().insert(path.to_path_buf(), artifact.clone());
        info!(
            trace_id = %trace_id,
            path = %artifact.path,
            kind = ?kind,
            size_bytes = artifact.size_bytes,
            "artifact recorded"
        );
        Ok(Some(artifact))
    }

    /// Every artifact currently on disk, newest first. Files dropped into the
    /// directories by other tools are listed without session metadata.
    pub fn list(&self, kind: Option<ArtifactKind>, trace_id: &str) -> Result<Vec<Artifact>, AppError> {
        let recorded = self.read_lock().clone();
        let mut dirs: Vec<PathBuf> = ArtifactKind::ALL
            .iter()
            .filter(|candidate| kind.map(|kind| kind == **candidate).unwrap_or(true))
            .map(|candidate| self.dir_for(*candidate))
            .collect();
        dirs.sort();
        dirs.dedup();

        let mut artifacts = Vec::new();
        for dir in dirs {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(AppError::system(
                        format!("Failed to read artifact dir: {err}"),
                        trace_id,
                    ))
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let Ok(metadata) = entry.metadata() else {
                    continue;
                };
                if !metadata.is_file() {
                    continue;
                }
                let artifact = match recorded.get(&path) {
                    Some(known) => Artifact {
                        size_bytes: metadata.len(),
                        ..known.clone()
                    },
                    None => {
                        let Some(found) = path
                            .extension()
                            .and_then(|ext| ext.to_str())
                            .and_then(ArtifactKind::from_extension)
                        else {
                            continue;
                        };
                        describe(&path, found, &metadata)
                    }
                };
                if kind.map(|kind| kind == artifact.kind).unwrap_or(true) {
                    artifacts.push(artifact);
                }
            }
        }
        artifacts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.file_name.cmp(&b.file_name)));
        Ok(artifacts)
    }

    pub fn find_by_session(&self, session_id: &str) -> Vec<Artifact> {
        let mut found: Vec<Artifact> = self
            .read_lock()
            .values()
            .filter(|artifact| artifact.session_id.as_deref() == Some(session_id))
            .filter(|artifact| Path::new(&artifact.path).is_file())
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        found
    }

    /// Maps a bare file name from a download request to its path under the
    /// artifact directories.
    pub fn resolve_download(&self, file_name: &str, trace_id: &str) -> Result<PathBuf, AppError> {
        let trimmed = file_name.trim();
        if trimmed.is_empty()
            || trimmed.contains('/')
            || trimmed.contains('\\')
            || trimmed.contains("..")
        {
            return Err(AppError::validation("Invalid artifact file name", trace_id));
        }
        ["captures", "logs"]
            .iter()
            .map(|dir| self.root.join(dir).join(trimmed))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| AppError::not_found(format!("Artifact not found: {trimmed}"), trace_id))
    }

    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, HashMap<PathBuf, Artifact>> {
        match self.recorded.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("artifact index lock poisoned; continuing with inner state");
                poisoned.into_inner()
            }
        }
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<PathBuf, Artifact>> {
        match self.recorded.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn candidate_path(dir: &Path, stem: &str, suffix: u32, kind: ArtifactKind) -> PathBuf {
    if suffix == 0 {
        dir.join(format!("{stem}.{}", kind.extension()))
    } else {
        dir.join(format!("{stem}_{suffix}.{}", kind.extension()))
    }
}

fn describe(path: &Path, kind: ArtifactKind, metadata: &fs::Metadata) -> Artifact {
    let created_at: DateTime<Utc> = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    Artifact {
        path: path.to_string_lossy().to_string(),
        file_name: path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default(),
        kind,
        session_id: None,
        serial: None,
        size_bytes: metadata.len(),
        created_at,
        mime_type: MimeGuess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string(),
    }
}
