use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy shared by every stimlab crate. Exit codes: user-correctable
/// errors map to 1, operational and device failures to 2.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("empty_source: no accepted image files in {0}")]
    EmptySource(String),
    #[error("empty_list: cannot shuffle an empty asset list")]
    EmptyList,
    #[error("validation: {0}")]
    Validation(String),
    #[error("device: {0}")]
    Device(String),
    #[error("device_not_found: {0}")]
    DeviceNotFound(String),
    #[error("operational: {0}")]
    Operational(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::NotFound(_)
            | Error::EmptySource(_)
            | Error::EmptyList
            | Error::Validation(_)
            | Error::Yaml(_) => 1,
            Error::Device(_) | Error::DeviceNotFound(_) | Error::Operational(_) | Error::Io(_) => 2,
        }
    }
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Write via a unique temp file in the same directory, then rename over the
/// destination, so index and order files are never observed half-written.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        name,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Err(Error::NotFound(format!("file not found: {}", path.display())));
    }
    let raw = fs::read_to_string(path)?;
    let value = serde_yaml::from_str(&raw)
        .map_err(|e| Error::Validation(format!("malformed YAML in {}: {}", path.display(), e)))?;
    Ok(value)
}

pub fn save_yaml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let raw = serde_yaml::to_string(value)?;
    atomic_write_bytes(path, raw.as_bytes())
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 65536];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(|e| Error::Operational(format!("walk {}: {}", src.display(), e)))?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            ensure_dir(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Rename where possible, copy-then-remove across filesystems.
pub fn move_dir(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        ensure_dir(parent)?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            copy_dir_recursive(src, dst)?;
            fs::remove_dir_all(src)?;
            Ok(())
        }
    }
}

/// Explicit timer handle: `start` returns the handle, `stop` consumes it.
/// There is no shared registry of named timers.
#[derive(Debug)]
pub struct Stopwatch {
    label: String,
    started: Instant,
}

impl Stopwatch {
    pub fn start(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn stop(self) -> Duration {
        let elapsed = self.started.elapsed();
        tracing::debug!(timer = %self.label, elapsed_s = elapsed.as_secs_f64(), "stopwatch stopped");
        elapsed
    }
}

// ---------------------------------------------------------------------------
// Config bundle
// ---------------------------------------------------------------------------

pub const EXPERIMENT_CONFIG_FILE: &str = "experiment.yml";
pub const DISPLAY_CONFIG_FILE: &str = "display-conf.yml";
pub const CONFIG_DIR: &str = "config";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default)]
    pub experiment: ExperimentMeta,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub session: SessionParams,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub participant: Participant,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl ExperimentConfig {
    pub fn path_in(experiment_dir: &Path) -> PathBuf {
        experiment_dir.join(CONFIG_DIR).join(EXPERIMENT_CONFIG_FILE)
    }

    pub fn load_from(experiment_dir: &Path) -> Result<Self> {
        load_yaml(&Self::path_in(experiment_dir))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
}

/// Which tracking-hardware family a run talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrackerFamily {
    /// Request/response protocol device reached over a durable socket.
    Socket,
    /// Managed-recording device located by network discovery.
    Managed,
    /// No tracker attached; markers are logged only.
    None,
}

impl TrackerFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerFamily::Socket => "socket",
            TrackerFamily::Managed => "managed",
            TrackerFamily::None => "none",
        }
    }
}

impl Default for TrackerFamily {
    fn default() -> Self {
        TrackerFamily::Socket
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareConfig {
    #[serde(default)]
    pub tracker: TrackerFamily,
    #[serde(default = "default_socket_address")]
    pub socket_address: String,
    #[serde(default = "default_discovery_address")]
    pub discovery_address: String,
    #[serde(default = "default_discovery_timeout")]
    pub discovery_timeout_s: f64,
}

fn default_socket_address() -> String {
    "127.0.0.1:50020".to_string()
}

fn default_discovery_address() -> String {
    "255.255.255.255:8559".to_string()
}

fn default_discovery_timeout() -> f64 {
    5.0
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            tracker: TrackerFamily::default(),
            socket_address: default_socket_address(),
            discovery_address: default_discovery_address(),
            discovery_timeout_s: default_discovery_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate_hz: u32,
    #[serde(default = "default_marker_stream")]
    pub marker_stream: String,
    #[serde(default = "default_marker_target")]
    pub marker_target: String,
}

fn default_sampling_rate() -> u32 {
    200
}

fn default_marker_stream() -> String {
    "StimMarkers".to_string()
}

fn default_marker_target() -> String {
    "255.255.255.255:16571".to_string()
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            sampling_rate_hz: default_sampling_rate(),
            marker_stream: default_marker_stream(),
            marker_target: default_marker_target(),
        }
    }
}

/// Where the presentation sequence comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StimulusSource {
    /// Live non-recursive scan of the OBJECTS folder.
    Screen,
    /// Persisted, pre-shuffled assets.txt identifier list.
    AssetList,
}

impl Default for StimulusSource {
    fn default() -> Self {
        StimulusSource::Screen
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionParams {
    #[serde(default = "default_n_repeats")]
    pub n_repeats: u32,
    #[serde(default = "default_true")]
    pub shuffle: bool,
    #[serde(default = "default_stim_time")]
    pub stim_time_s: f64,
    #[serde(default = "default_blank_time")]
    pub blank_time_s: f64,
    #[serde(default = "default_drift_time")]
    pub drift_time_s: f64,
    #[serde(default = "default_greeting_time")]
    pub welcome_time_s: f64,
    #[serde(default = "default_greeting_time")]
    pub goodbye_time_s: f64,
    #[serde(default = "default_text_size")]
    pub text_size: u32,
    #[serde(default)]
    pub capture_frames: bool,
    #[serde(default)]
    pub source: StimulusSource,
}

fn default_n_repeats() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

fn default_stim_time() -> f64 {
    1.0
}

fn default_blank_time() -> f64 {
    0.4
}

fn default_drift_time() -> f64 {
    1.0
}

fn default_greeting_time() -> f64 {
    3.0
}

fn default_text_size() -> u32 {
    40
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            n_repeats: default_n_repeats(),
            shuffle: true,
            stim_time_s: default_stim_time(),
            blank_time_s: default_blank_time(),
            drift_time_s: default_drift_time(),
            welcome_time_s: default_greeting_time(),
            goodbye_time_s: default_greeting_time(),
            text_size: default_text_size(),
            capture_frames: false,
            source: StimulusSource::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_objects_dir")]
    pub objects: String,
    #[serde(default = "default_output_dir")]
    pub output: String,
    #[serde(default = "default_script_images_dir")]
    pub script_images: String,
}

fn default_objects_dir() -> String {
    "OBJECTS".to_string()
}

fn default_output_dir() -> String {
    "output".to_string()
}

fn default_script_images_dir() -> String {
    "script-images".to_string()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            objects: default_objects_dir(),
            output: default_output_dir(),
            script_images: default_script_images_dir(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Participant {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DisplayConfig {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub display: DisplaySettings,
}

impl DisplayConfig {
    pub fn path_in(experiment_dir: &Path) -> PathBuf {
        experiment_dir.join(CONFIG_DIR).join(DISPLAY_CONFIG_FILE)
    }

    /// Missing display configuration falls back to defaults; a present but
    /// malformed file is still a validation error.
    pub fn load_from(experiment_dir: &Path) -> Result<Self> {
        let path = Self::path_in(experiment_dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        load_yaml(&path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_width_px")]
    pub width_px: u32,
    #[serde(default = "default_height_px")]
    pub height_px: u32,
    #[serde(default = "default_refresh_rate")]
    pub refresh_rate_hz: f64,
    #[serde(default = "default_width_cm")]
    pub width_cm: f64,
    #[serde(default = "default_distance_cm")]
    pub distance_cm: f64,
}

fn default_width_px() -> u32 {
    1920
}

fn default_height_px() -> u32 {
    1080
}

fn default_refresh_rate() -> f64 {
    60.0
}

fn default_width_cm() -> f64 {
    53.0
}

fn default_distance_cm() -> f64 {
    60.0
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            width_px: default_width_px(),
            height_px: default_height_px(),
            refresh_rate_hz: default_refresh_rate(),
            width_cm: default_width_cm(),
            distance_cm: default_distance_cm(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplaySettings {
    #[serde(default = "default_screen_index")]
    pub screen_index: u32,
    #[serde(default = "default_true")]
    pub fullscreen: bool,
    #[serde(default = "default_background_color")]
    pub background_color: [u8; 3],
    #[serde(default = "default_color_space")]
    pub color_space: String,
}

fn default_screen_index() -> u32 {
    1
}

fn default_background_color() -> [u8; 3] {
    [127, 127, 127]
}

fn default_color_space() -> String {
    "rgb255".to_string()
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            screen_index: default_screen_index(),
            fullscreen: true,
            background_color: default_background_color(),
            color_space: default_color_space(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "stimlab_core_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("scratch dir");
        dir
    }

    #[test]
    fn atomic_write_replaces_previous_content() {
        let dir = scratch_dir("atomic");
        let path = dir.join("index.yml");
        atomic_write_bytes(&path, b"first").expect("first write");
        atomic_write_bytes(&path, b"second").expect("second write");
        let content = fs::read_to_string(&path).expect("read back");
        assert_eq!(content, "second");
        let leftovers: Vec<_> = fs::read_dir(&dir)
            .expect("list dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty(), "temp files must not remain");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn experiment_config_loads_with_defaults_for_missing_groups() {
        let dir = scratch_dir("config");
        let config_dir = dir.join(CONFIG_DIR);
        ensure_dir(&config_dir).expect("config dir");
        fs::write(
            config_dir.join(EXPERIMENT_CONFIG_FILE),
            "experiment:\n  name: probe\n  uuid: abc\n",
        )
        .expect("write config");

        let cfg = ExperimentConfig::load_from(&dir).expect("load config");
        assert_eq!(cfg.experiment.name, "probe");
        assert_eq!(cfg.hardware.tracker, TrackerFamily::Socket);
        assert_eq!(cfg.session.n_repeats, 2);
        assert!(cfg.session.shuffle);
        assert_eq!(cfg.recording.sampling_rate_hz, 200);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn malformed_config_is_a_validation_error() {
        let dir = scratch_dir("badcfg");
        let config_dir = dir.join(CONFIG_DIR);
        ensure_dir(&config_dir).expect("config dir");
        fs::write(
            config_dir.join(EXPERIMENT_CONFIG_FILE),
            "experiment: [not, a, mapping\n",
        )
        .expect("write config");

        let err = ExperimentConfig::load_from(&dir).expect_err("must fail");
        assert_eq!(err.exit_code(), 1);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_display_config_falls_back_to_defaults() {
        let dir = scratch_dir("display");
        let cfg = DisplayConfig::load_from(&dir).expect("defaults");
        assert_eq!(cfg.monitor.width_px, 1920);
        assert_eq!(cfg.display.background_color, [127, 127, 127]);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn move_dir_relocates_tree() {
        let dir = scratch_dir("move");
        let src = dir.join("src");
        ensure_dir(&src.join("nested")).expect("nested");
        fs::write(src.join("nested").join("a.txt"), "payload").expect("write");
        let dst = dir.join("dst").join("src");
        move_dir(&src, &dst).expect("move");
        assert!(!src.exists());
        assert_eq!(
            fs::read_to_string(dst.join("nested").join("a.txt")).expect("read"),
            "payload"
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn stopwatch_handle_reports_elapsed() {
        let watch = Stopwatch::start("unit");
        std::thread::sleep(Duration::from_millis(5));
        let elapsed = watch.stop();
        assert!(elapsed >= Duration::from_millis(5));
    }

    #[test]
    fn error_exit_codes_follow_the_cli_contract() {
        assert_eq!(Error::NotFound("x".into()).exit_code(), 1);
        assert_eq!(Error::Validation("x".into()).exit_code(), 1);
        assert_eq!(Error::EmptyList.exit_code(), 1);
        assert_eq!(Error::Device("x".into()).exit_code(), 2);
        assert_eq!(Error::Operational("x".into()).exit_code(), 2);
    }
}
