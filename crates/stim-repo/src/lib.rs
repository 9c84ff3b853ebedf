use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use stim_core::{
    atomic_write_bytes, ensure_dir, move_dir, sha256_file, DisplayConfig, Error, ExperimentConfig,
    ExperimentMeta, Result,
};
use tracing::{info, warn};

pub const INDEX_FILE: &str = "index.yml";

/// Directories every experiment skeleton carries.
pub const REQUIRED_DIRS: [&str; 5] = ["config", "data", "logs", "scripts", "OBJECTS"];

/// Lifecycle location of an experiment. The directory tree is authoritative;
/// the per-location index is advisory metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Active,
    Archived,
    Exported,
}

impl Location {
    pub fn dir_name(&self) -> &'static str {
        match self {
            Location::Active => "active",
            Location::Archived => "archive",
            Location::Exported => "exports",
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.dir_name()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveEntry {
    pub name: String,
    pub created: String,
    pub template: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub archived: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub name: String,
    pub archived_at: String,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportEntry {
    pub name: String,
    pub path: String,
    pub timestamp: String,
    pub source: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Default)]
pub struct NewExperiment {
    pub author: String,
    pub description: String,
}

#[derive(Debug)]
pub struct ExportReport {
    pub zip_path: PathBuf,
    pub timestamp: String,
    pub source: Location,
    pub sha256: String,
}

#[derive(Debug)]
pub struct ExperimentInfo {
    pub name: String,
    pub location: Location,
    pub path: PathBuf,
    pub config: Option<ExperimentConfig>,
    pub display: Option<DisplayConfig>,
    pub exports: Vec<String>,
}

/// Experiment store rooted at an explicit directory; nothing is resolved
/// relative to the executable.
#[derive(Debug, Clone)]
pub struct Repository {
    root: PathBuf,
}

impl Repository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn location_dir(&self, location: Location) -> PathBuf {
        self.root.join(location.dir_name())
    }

    pub fn index_path(&self, location: Location) -> PathBuf {
        self.location_dir(location).join(INDEX_FILE)
    }

    pub fn experiment_dir(&self, location: Location, name: &str) -> PathBuf {
        self.location_dir(location).join(name)
    }

    /// Search active, then archived, then exported. Performs no mutation.
    pub fn resolve(&self, name: &str) -> Result<(PathBuf, Location)> {
        for location in [Location::Active, Location::Archived, Location::Exported] {
            let candidate = self.experiment_dir(location, name);
            if candidate.is_dir() {
                return Ok((candidate, location));
            }
        }
        Err(Error::NotFound(format!(
            "experiment '{}' not found in active, archive or exports",
            name
        )))
    }

    /// Instantiate the default experiment skeleton under the active location
    /// and register it in the active index.
    pub fn create(&self, name: &str, options: &NewExperiment) -> Result<PathBuf> {
        validate_name(name)?;
        let target = self.experiment_dir(Location::Active, name);
        if target.exists() {
            return Err(Error::Validation(format!(
                "experiment '{}' already exists in {}",
                name,
                target.display()
            )));
        }

        for dir in REQUIRED_DIRS {
            ensure_dir(&target.join(dir))?;
        }

        let created = Utc::now().to_rfc3339();
        let uuid = uuid::Uuid::new_v4().to_string();
        let mut config = ExperimentConfig::default();
        config.experiment = ExperimentMeta {
            name: name.to_string(),
            uuid: uuid.clone(),
            created: created.clone(),
            author: options.author.clone(),
            email: String::new(),
            description: options.description.clone(),
            version: "0.1.0".to_string(),
        };
        stim_core::save_yaml(&ExperimentConfig::path_in(&target), &config)?;
        stim_core::save_yaml(&DisplayConfig::path_in(&target), &DisplayConfig::default())?;

        let readme = format!(
            "# {}\n\n{}\n\nCreated on: {}\nUUID: {}\n",
            name, options.description, created, uuid
        );
        atomic_write_bytes(&target.join("README.md"), readme.as_bytes())?;

        let mut index: Vec<ActiveEntry> = load_index(&self.index_path(Location::Active))?;
        index.push(ActiveEntry {
            name: name.to_string(),
            created,
            template: "default".to_string(),
            author: options.author.clone(),
            description: options.description.clone(),
            version: "0.1.0".to_string(),
            archived: false,
        });
        save_index(&self.index_path(Location::Active), &index)?;

        info!(experiment = name, path = %target.display(), "experiment created");
        Ok(target)
    }

    /// Move active -> archive, flag the active-index entry as archived
    /// (history is preserved, never deleted) and append an archive-index
    /// snapshot. A failed move leaves the indexes untouched; an index failure
    /// after a successful move is reported but the move is not rolled back.
    pub fn archive(&self, name: &str) -> Result<PathBuf> {
        let source = self.experiment_dir(Location::Active, name);
        if !source.is_dir() {
            if self.experiment_dir(Location::Archived, name).is_dir() {
                return Err(Error::Validation(format!(
                    "experiment '{}' is already archived",
                    name
                )));
            }
            return Err(Error::NotFound(format!(
                "experiment '{}' not found in active location",
                name
            )));
        }
        let target = self.experiment_dir(Location::Archived, name);
        if target.exists() {
            return Err(Error::Operational(format!(
                "archive target already exists: {}",
                target.display()
            )));
        }

        move_dir(&source, &target)
            .map_err(|e| Error::Operational(format!("failed to move '{}': {}", name, e)))?;
        info!(experiment = name, to = %target.display(), "experiment archived");

        let active_index_path = self.index_path(Location::Active);
        let mut active_index: Vec<ActiveEntry> = load_index(&active_index_path)?;
        let mut flagged = false;
        for entry in &mut active_index {
            if entry.name == name {
                entry.archived = true;
                flagged = true;
            }
        }
        if flagged {
            save_index(&active_index_path, &active_index)?;
        } else {
            warn!(experiment = name, "no active index entry to flag as archived");
        }

        let archive_index_path = self.index_path(Location::Archived);
        let mut archive_index: Vec<ArchiveEntry> = load_index(&archive_index_path)?;
        archive_index.push(extract_metadata(&target, name));
        save_index(&archive_index_path, &archive_index)?;

        Ok(target)
    }

    /// Irreversibly remove the experiment directory and its active-index
    /// entry. Both removals are idempotent: a missing directory or a missing
    /// index entry is a warning, not an error.
    pub fn delete(&self, name: &str) -> Result<()> {
        let dir = self.experiment_dir(Location::Active, name);
        if dir.is_dir() {
            fs::remove_dir_all(&dir)
                .map_err(|e| Error::Operational(format!("failed to delete '{}': {}", name, e)))?;
            info!(experiment = name, path = %dir.display(), "experiment deleted");
        } else {
            warn!(experiment = name, "experiment not present in active location; nothing to delete");
        }

        let index_path = self.index_path(Location::Active);
        let mut index: Vec<ActiveEntry> = load_index(&index_path)?;
        let before = index.len();
        index.retain(|entry| entry.name != name);
        if index.len() < before {
            save_index(&index_path, &index)?;
            info!(experiment = name, "active index entry removed");
        } else {
            warn!(experiment = name, "no active index entry found for deletion");
        }
        Ok(())
    }

    /// Compressed, timestamped snapshot of the experiment tree. The source
    /// location is left untouched; repeated exports accumulate distinct
    /// archives plus one export-index entry each.
    pub fn export(&self, name: &str) -> Result<ExportReport> {
        let (source, location) = self.resolve(name)?;
        if location == Location::Exported {
            return Err(Error::Validation(format!(
                "experiment '{}' exists only as exports; nothing to snapshot",
                name
            )));
        }

        let export_dir = self.experiment_dir(Location::Exported, name);
        ensure_dir(&export_dir)?;
        let timestamp = Utc::now().format("%Y%m%dT%H%M%S").to_string();
        let mut zip_path = export_dir.join(format!("{}_{}.zip", name, timestamp));
        let mut attempt = 1;
        while zip_path.exists() {
            attempt += 1;
            zip_path = export_dir.join(format!("{}_{}_{}.zip", name, timestamp, attempt));
        }

        zip_dir(&source, name, &zip_path)
            .map_err(|e| Error::Operational(format!("failed to compress '{}': {}", name, e)))?;
        let sha256 = sha256_file(&zip_path)?;
        info!(experiment = name, zip = %zip_path.display(), sha256 = %sha256, "experiment exported");

        let index_path = self.index_path(Location::Exported);
        let mut index: Vec<ExportEntry> = load_index(&index_path)?;
        index.push(ExportEntry {
            name: name.to_string(),
            path: format!(
                "{}/{}",
                name,
                zip_path.file_name().and_then(|s| s.to_str()).unwrap_or("")
            ),
            timestamp: timestamp.clone(),
            source: location.as_str().to_string(),
            sha256: sha256.clone(),
        });
        save_index(&index_path, &index)?;

        Ok(ExportReport {
            zip_path,
            timestamp,
            source: location,
            sha256,
        })
    }

    /// Existing export archives for an experiment, sorted by name (and so by
    /// timestamp).
    pub fn existing_exports(&self, name: &str) -> Result<Vec<String>> {
        let dir = self.experiment_dir(Location::Exported, name);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut zips = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type()?.is_file() && file_name.ends_with(".zip") {
                zips.push(file_name);
            }
        }
        zips.sort();
        Ok(zips)
    }

    /// Collect every structural and config violation before returning so the
    /// operator sees the full list at once.
    pub fn validate_dir(&self, experiment_dir: &Path) -> Result<Vec<String>> {
        if !experiment_dir.is_dir() {
            return Err(Error::NotFound(format!(
                "experiment directory not found: {}",
                experiment_dir.display()
            )));
        }
        let mut violations = Vec::new();

        let config_path = ExperimentConfig::path_in(experiment_dir);
        if !config_path.exists() {
            violations.push("config/experiment.yml: missing".to_string());
        } else {
            match ExperimentConfig::load_from(experiment_dir) {
                Ok(config) => {
                    check_field(&mut violations, "experiment.name", &config.experiment.name);
                    check_field(&mut violations, "experiment.uuid", &config.experiment.uuid);
                    check_field(&mut violations, "experiment.created", &config.experiment.created);
                    check_field(&mut violations, "experiment.version", &config.experiment.version);
                    if config.recording.sampling_rate_hz == 0 {
                        violations.push("recording.sampling_rate_hz: must be > 0".to_string());
                    }
                    if config.session.n_repeats == 0 {
                        violations.push("session.n_repeats: must be >= 1".to_string());
                    }
                    if config.session.stim_time_s <= 0.0 {
                        violations.push("session.stim_time_s: must be > 0".to_string());
                    }
                    if config.session.blank_time_s < 0.0 {
                        violations.push("session.blank_time_s: must be >= 0".to_string());
                    }
                }
                Err(e) => violations.push(format!("config/experiment.yml: {}", e)),
            }
        }

        let display_path = DisplayConfig::path_in(experiment_dir);
        if display_path.exists() {
            if let Err(e) = DisplayConfig::load_from(experiment_dir) {
                violations.push(format!("config/display-conf.yml: {}", e));
            }
        }

        for dir in REQUIRED_DIRS {
            if !experiment_dir.join(dir).is_dir() {
                violations.push(format!("{}/: missing", dir));
            }
        }
        Ok(violations)
    }

    pub fn info(&self, name: &str) -> Result<ExperimentInfo> {
        let (path, location) = self.resolve(name)?;
        let (config, display) = if location == Location::Exported {
            (None, None)
        } else {
            (
                ExperimentConfig::load_from(&path).ok(),
                DisplayConfig::load_from(&path).ok(),
            )
        };
        Ok(ExperimentInfo {
            name: name.to_string(),
            location,
            path,
            config,
            display,
            exports: self.existing_exports(name)?,
        })
    }

    /// Directory-authoritative listing of a location, sorted by name.
    pub fn list(&self, location: Location) -> Result<Vec<String>> {
        let dir = self.location_dir(location);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

fn check_field(violations: &mut Vec<String>, field: &str, value: &str) {
    if value.trim().is_empty() {
        violations.push(format!("{}: missing or empty", field));
    }
}

/// Experiment names become directory names, so they must stay path-safe.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Validation("experiment name cannot be empty".to_string()));
    }
    if name.starts_with('.') {
        return Err(Error::Validation(format!(
            "experiment name cannot start with '.': {}",
            name
        )));
    }
    let ok = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if !ok {
        return Err(Error::Validation(format!(
            "experiment name must use only letters, digits, '-', '_' and '.': {}",
            name
        )));
    }
    Ok(())
}

/// Best-effort metadata snapshot for the archive index. Extraction failures
/// degrade to the minimal entry instead of blocking the archive operation.
fn extract_metadata(experiment_dir: &Path, name: &str) -> ArchiveEntry {
    let mut entry = ArchiveEntry {
        name: name.to_string(),
        archived_at: Utc::now().to_rfc3339(),
        from: Location::Active.as_str().to_string(),
        uuid: None,
        created: None,
        author: None,
        description: None,
    };
    match ExperimentConfig::load_from(experiment_dir) {
        Ok(config) => {
            entry.uuid = non_empty(config.experiment.uuid);
            entry.created = non_empty(config.experiment.created);
            entry.author = non_empty(config.experiment.author);
            entry.description = non_empty(config.experiment.description);
        }
        Err(e) => {
            warn!(experiment = name, error = %e, "metadata extraction failed; archiving with minimal entry");
        }
    }
    entry
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

fn load_index<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(path)?;
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_yaml::from_str(&raw)
        .map_err(|e| Error::Operational(format!("corrupt index {}: {}", path.display(), e)))
}

fn save_index<T: Serialize>(path: &Path, index: &[T]) -> Result<()> {
    let raw = serde_yaml::to_string(index)
        .map_err(|e| Error::Operational(format!("failed to serialize index: {}", e)))?;
    atomic_write_bytes(path, raw.as_bytes())
}

fn zip_dir(source: &Path, prefix: &str, zip_path: &Path) -> Result<()> {
    let file = fs::File::create(zip_path)?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);

    for entry in walkdir::WalkDir::new(source) {
        let entry =
            entry.map_err(|e| Error::Operational(format!("walk {}: {}", source.display(), e)))?;
        let rel = entry.path().strip_prefix(source).unwrap_or(entry.path());
        if rel.as_os_str().is_empty() {
            continue;
        }
        let archived_name = format!("{}/{}", prefix, rel.to_string_lossy().replace('\\', "/"));
        if entry.file_type().is_dir() {
            writer
                .add_directory(format!("{}/", archived_name), options)
                .map_err(|e| Error::Operational(format!("zip dir entry: {}", e)))?;
        } else if entry.file_type().is_file() {
            writer
                .start_file(archived_name, options)
                .map_err(|e| Error::Operational(format!("zip file entry: {}", e)))?;
            let mut input = fs::File::open(entry.path())?;
            io::copy(&mut input, &mut writer)?;
        }
    }
    writer
        .finish()
        .map_err(|e| Error::Operational(format!("zip finish: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_repo(tag: &str) -> Repository {
        let root = std::env::temp_dir().join(format!(
            "stimlab_repo_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("repo root");
        Repository::new(root)
    }

    fn teardown(repo: Repository) {
        let _ = fs::remove_dir_all(repo.root());
    }

    fn new_options() -> NewExperiment {
        NewExperiment {
            author: "j.doe".to_string(),
            description: "probe battery".to_string(),
        }
    }

    #[test]
    fn create_builds_skeleton_and_index_entry() {
        let repo = scratch_repo("create");
        let path = repo.create("faces-01", &new_options()).expect("create");

        for dir in REQUIRED_DIRS {
            assert!(path.join(dir).is_dir(), "missing {}", dir);
        }
        let config = ExperimentConfig::load_from(&path).expect("config");
        assert_eq!(config.experiment.name, "faces-01");
        assert!(!config.experiment.uuid.is_empty());
        assert!(!config.experiment.created.is_empty());

        let index: Vec<ActiveEntry> =
            load_index(&repo.index_path(Location::Active)).expect("index");
        assert_eq!(index.len(), 1);
        assert_eq!(index[0].name, "faces-01");
        assert!(!index[0].archived);
        teardown(repo);
    }

    #[test]
    fn create_rejects_duplicates_and_unsafe_names() {
        let repo = scratch_repo("dupe");
        repo.create("faces-01", &new_options()).expect("create");
        let err = repo.create("faces-01", &new_options()).expect_err("dupe");
        assert!(matches!(err, Error::Validation(_)), "got: {}", err);

        let err = repo.create("a/b", &new_options()).expect_err("slash");
        assert!(matches!(err, Error::Validation(_)), "got: {}", err);
        teardown(repo);
    }

    #[test]
    fn resolve_finds_nothing_without_mutating() {
        let repo = scratch_repo("resolve");
        let err = repo.resolve("ghost").expect_err("must fail");
        assert!(matches!(err, Error::NotFound(_)));
        assert!(!repo.location_dir(Location::Active).exists());
        assert!(!repo.location_dir(Location::Archived).exists());
        assert!(!repo.location_dir(Location::Exported).exists());
        teardown(repo);
    }

    #[test]
    fn archive_moves_directory_and_updates_both_indexes() {
        let repo = scratch_repo("archive");
        repo.create("faces-01", &new_options()).expect("create");
        let target = repo.archive("faces-01").expect("archive");

        assert!(!repo.experiment_dir(Location::Active, "faces-01").exists());
        assert!(target.is_dir());
        assert_eq!(target, repo.experiment_dir(Location::Archived, "faces-01"));

        let active: Vec<ActiveEntry> =
            load_index(&repo.index_path(Location::Active)).expect("active index");
        assert_eq!(active.len(), 1, "active entry must be kept for history");
        assert!(active[0].archived);

        let archived: Vec<ArchiveEntry> =
            load_index(&repo.index_path(Location::Archived)).expect("archive index");
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].name, "faces-01");
        assert_eq!(archived[0].author.as_deref(), Some("j.doe"));

        let (_, location) = repo.resolve("faces-01").expect("resolve");
        assert_eq!(location, Location::Archived);
        teardown(repo);
    }

    #[test]
    fn archive_degrades_to_minimal_metadata_without_config() {
        let repo = scratch_repo("minimal");
        let dir = repo.experiment_dir(Location::Active, "bare");
        ensure_dir(&dir).expect("bare dir");
        repo.archive("bare").expect("archive");

        let archived: Vec<ArchiveEntry> =
            load_index(&repo.index_path(Location::Archived)).expect("archive index");
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].name, "bare");
        assert!(archived[0].uuid.is_none());
        teardown(repo);
    }

    #[test]
    fn archive_of_missing_experiment_touches_no_index() {
        let repo = scratch_repo("archmiss");
        let err = repo.archive("ghost").expect_err("must fail");
        assert!(matches!(err, Error::NotFound(_)));
        assert!(!repo.index_path(Location::Active).exists());
        assert!(!repo.index_path(Location::Archived).exists());
        teardown(repo);
    }

    #[test]
    fn delete_removes_directory_and_index_entry() {
        let repo = scratch_repo("delete");
        repo.create("faces-01", &new_options()).expect("create");
        repo.delete("faces-01").expect("delete");

        assert!(!repo.experiment_dir(Location::Active, "faces-01").exists());
        let index: Vec<ActiveEntry> =
            load_index(&repo.index_path(Location::Active)).expect("index");
        assert!(index.is_empty());
        teardown(repo);
    }

    #[test]
    fn delete_of_unknown_experiment_is_a_warning_not_an_error() {
        let repo = scratch_repo("delmiss");
        repo.create("other", &new_options()).expect("create");
        repo.delete("ghost").expect("idempotent delete");

        let index: Vec<ActiveEntry> =
            load_index(&repo.index_path(Location::Active)).expect("index");
        assert_eq!(index.len(), 1, "unrelated entries must be untouched");
        assert_eq!(index[0].name, "other");
        teardown(repo);
    }

    #[test]
    fn export_twice_accumulates_distinct_archives_and_entries() {
        let repo = scratch_repo("export");
        repo.create("faces-01", &new_options()).expect("create");

        let first = repo.export("faces-01").expect("first export");
        let second = repo.export("faces-01").expect("second export");
        assert_ne!(first.zip_path, second.zip_path);
        assert!(first.zip_path.exists());
        assert!(second.zip_path.exists());
        assert!(
            repo.experiment_dir(Location::Active, "faces-01").is_dir(),
            "export must not mutate the source"
        );

        let index: Vec<ExportEntry> =
            load_index(&repo.index_path(Location::Exported)).expect("export index");
        assert_eq!(index.len(), 2);
        assert_eq!(index[0].source, "active");
        assert!(!index[0].sha256.is_empty());

        let zips = repo.existing_exports("faces-01").expect("listing");
        assert_eq!(zips.len(), 2);
        teardown(repo);
    }

    #[test]
    fn export_snapshot_contains_the_experiment_tree() {
        let repo = scratch_repo("zipread");
        let path = repo.create("faces-01", &new_options()).expect("create");
        fs::write(path.join("OBJECTS").join("a.png"), b"img").expect("asset");

        let report = repo.export("faces-01").expect("export");
        let file = fs::File::open(&report.zip_path).expect("open zip");
        let mut archive = zip::ZipArchive::new(file).expect("read zip");
        archive
            .by_name("faces-01/config/experiment.yml")
            .expect("config inside snapshot");
        drop(archive);
        let file = fs::File::open(&report.zip_path).expect("open zip");
        let mut archive = zip::ZipArchive::new(file).expect("read zip");
        archive
            .by_name("faces-01/OBJECTS/a.png")
            .expect("asset inside snapshot");
        teardown(repo);
    }

    #[test]
    fn export_of_archived_experiment_records_its_source() {
        let repo = scratch_repo("exparch");
        repo.create("faces-01", &new_options()).expect("create");
        repo.archive("faces-01").expect("archive");
        let report = repo.export("faces-01").expect("export");
        assert_eq!(report.source, Location::Archived);
        teardown(repo);
    }

    #[test]
    fn validate_passes_on_a_fresh_skeleton() {
        let repo = scratch_repo("valok");
        let path = repo.create("faces-01", &new_options()).expect("create");
        let violations = repo.validate_dir(&path).expect("validate");
        assert!(violations.is_empty(), "unexpected: {:?}", violations);
        teardown(repo);
    }

    #[test]
    fn validate_collects_every_violation() {
        let repo = scratch_repo("valbad");
        let path = repo.create("faces-01", &new_options()).expect("create");

        let mut config = ExperimentConfig::load_from(&path).expect("config");
        config.experiment.uuid = String::new();
        config.experiment.version = String::new();
        config.recording.sampling_rate_hz = 0;
        stim_core::save_yaml(&ExperimentConfig::path_in(&path), &config).expect("rewrite");
        fs::remove_dir_all(path.join("data")).expect("drop data dir");

        let violations = repo.validate_dir(&path).expect("validate");
        assert!(violations.iter().any(|v| v.contains("experiment.uuid")));
        assert!(violations.iter().any(|v| v.contains("experiment.version")));
        assert!(violations.iter().any(|v| v.contains("sampling_rate_hz")));
        assert!(violations.iter().any(|v| v.contains("data/")));
        assert_eq!(violations.len(), 4, "all violations reported: {:?}", violations);
        teardown(repo);
    }

    #[test]
    fn info_reports_location_and_exports() {
        let repo = scratch_repo("info");
        repo.create("faces-01", &new_options()).expect("create");
        repo.export("faces-01").expect("export");

        let info = repo.info("faces-01").expect("info");
        assert_eq!(info.location, Location::Active);
        assert_eq!(info.exports.len(), 1);
        let config = info.config.expect("config present");
        assert_eq!(config.experiment.name, "faces-01");
        teardown(repo);
    }

    #[test]
    fn list_is_directory_authoritative() {
        let repo = scratch_repo("list");
        repo.create("b-exp", &new_options()).expect("create b");
        repo.create("a-exp", &new_options()).expect("create a");
        // Directory placed by hand, never registered in any index.
        ensure_dir(&repo.experiment_dir(Location::Active, "m-manual")).expect("manual");

        let names = repo.list(Location::Active).expect("list");
        assert_eq!(names, vec!["a-exp", "b-exp", "m-manual"]);
        teardown(repo);
    }
}
