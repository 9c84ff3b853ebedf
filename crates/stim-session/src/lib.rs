use chrono::Utc;
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, UdpSocket};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use stim_core::{
    atomic_write_bytes, ensure_dir, DisplaySettings, Error, ExperimentConfig, HardwareConfig,
    Result, SessionParams, StimulusSource, Stopwatch, TrackerFamily,
};
use tracing::{info, warn};

pub const ORDER_FILE: &str = "order.txt";
pub const SESSION_SUMMARY_FILE: &str = "session.yml";
pub const WELCOME_IMAGE_STEM: &str = "welcome";
pub const GOODBYE_IMAGE_STEM: &str = "goodbye";

// ---------------------------------------------------------------------------
// Presentation sequence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Stimulus {
    pub identifier: String,
    pub path: PathBuf,
}

impl Stimulus {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.identifier.clone())
    }
}

/// Build the full presentation sequence. The base list is repeated
/// `n_repeats` times and, when `shuffle` is set, the concatenated sequence is
/// shuffled as a whole so repeats interleave instead of forming blocks.
pub fn build_sequence(
    experiment_dir: &Path,
    objects_dir: &Path,
    params: &SessionParams,
    source: StimulusSource,
) -> Result<Vec<Stimulus>> {
    let base = match source {
        StimulusSource::Screen => scan_objects(objects_dir)?,
        StimulusSource::AssetList => {
            let identifiers = stim_assets::load(&experiment_dir.join(stim_assets::ASSETS_FILE))?;
            if identifiers.is_empty() {
                return Err(Error::EmptyList);
            }
            identifiers
                .into_iter()
                .map(|identifier| {
                    let path = stim_assets::resolve_stimulus(objects_dir, &identifier)?;
                    Ok(Stimulus { identifier, path })
                })
                .collect::<Result<Vec<_>>>()?
        }
    };

    let mut sequence = Vec::with_capacity(base.len() * params.n_repeats.max(1) as usize);
    for _ in 0..params.n_repeats.max(1) {
        sequence.extend(base.iter().cloned());
    }
    if params.shuffle {
        sequence.shuffle(&mut OsRng);
    }
    Ok(sequence)
}

fn scan_objects(objects_dir: &Path) -> Result<Vec<Stimulus>> {
    if !objects_dir.is_dir() {
        return Err(Error::NotFound(format!(
            "stimulus folder not found: {}",
            objects_dir.display()
        )));
    }
    let mut stimuli = Vec::new();
    for entry in fs::read_dir(objects_dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_file() && stim_assets::is_accepted_image(&path) {
            let identifier = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            stimuli.push(Stimulus { identifier, path });
        }
    }
    if stimuli.is_empty() {
        return Err(Error::EmptySource(objects_dir.display().to_string()));
    }
    stimuli.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(stimuli)
}

pub fn find_script_image(script_images_dir: &Path, stem: &str) -> Option<PathBuf> {
    let entries = fs::read_dir(script_images_dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() && path.file_stem().and_then(|s| s.to_str()) == Some(stem) {
            return Some(path);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Display surface seam
// ---------------------------------------------------------------------------

/// Seam over the rendering backend. Every call renders and flips; rendering
/// backends themselves are out of scope for this crate.
pub trait DisplaySurface {
    fn show_text(&mut self, text: &str) -> Result<()>;
    fn show_image(&mut self, path: &Path) -> Result<()>;
    fn show_fixation(&mut self) -> Result<()>;
    fn blank(&mut self) -> Result<()>;
    fn capture_frame(&mut self, dest: &Path) -> Result<()>;
    /// Block until the operator acknowledges. Intentionally has no timeout.
    fn await_start(&mut self) -> Result<()>;
    fn close(&mut self);
}

/// Surface used by the CLI: renders nothing, logs every frame, and takes the
/// operator acknowledgment as a typed token on stdin.
pub struct HeadlessSurface {
    settings: DisplaySettings,
    last_image: Option<PathBuf>,
    open: bool,
}

impl HeadlessSurface {
    pub fn open(settings: DisplaySettings) -> Self {
        info!(
            screen_index = settings.screen_index,
            fullscreen = settings.fullscreen,
            color_space = %settings.color_space,
            "display surface opened"
        );
        Self {
            settings,
            last_image: None,
            open: true,
        }
    }
}

impl DisplaySurface for HeadlessSurface {
    fn show_text(&mut self, text: &str) -> Result<()> {
        println!("{}", text);
        Ok(())
    }

    fn show_image(&mut self, path: &Path) -> Result<()> {
        if !path.is_file() {
            return Err(Error::Operational(format!(
                "cannot render missing stimulus: {}",
                path.display()
            )));
        }
        info!(image = %path.display(), "flip");
        self.last_image = Some(path.to_path_buf());
        Ok(())
    }

    fn show_fixation(&mut self) -> Result<()> {
        info!("flip fixation marker");
        Ok(())
    }

    fn blank(&mut self) -> Result<()> {
        self.last_image = None;
        Ok(())
    }

    fn capture_frame(&mut self, dest: &Path) -> Result<()> {
        let source = self.last_image.as_ref().ok_or_else(|| {
            Error::Operational("no rendered frame available for capture".to_string())
        })?;
        if let Some(parent) = dest.parent() {
            ensure_dir(parent)?;
        }
        fs::copy(source, dest)?;
        Ok(())
    }

    fn await_start(&mut self) -> Result<()> {
        println!("type 'start' to begin the session");
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            let read = stdin.read_line(&mut line)?;
            if read == 0 {
                return Err(Error::Operational(
                    "stdin closed while awaiting start token".to_string(),
                ));
            }
            if line.trim().eq_ignore_ascii_case("start") {
                return Ok(());
            }
            println!("unrecognized input; type 'start' to begin");
        }
    }

    fn close(&mut self) {
        if self.open {
            info!(screen_index = self.settings.screen_index, "display surface closed");
            self.open = false;
        }
    }
}

impl Drop for HeadlessSurface {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Broadcast marker outlet
// ---------------------------------------------------------------------------

/// Broadcast-style marker stream: one UDP datagram per marker, single string
/// payload, fire-and-forget. Delivery failures are logged, never surfaced.
pub struct MarkerOutlet {
    stream_name: String,
    target: String,
    socket: UdpSocket,
}

impl MarkerOutlet {
    pub fn open(stream_name: &str, target: &str) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .map_err(|e| Error::Operational(format!("cannot open marker outlet: {}", e)))?;
        let _ = socket.set_broadcast(true);
        info!(stream = stream_name, target = target, "marker outlet open");
        Ok(Self {
            stream_name: stream_name.to_string(),
            target: target.to_string(),
            socket,
        })
    }

    pub fn push(&self, label: &str) {
        if let Err(e) = self.socket.send_to(label.as_bytes(), &self.target) {
            warn!(stream = %self.stream_name, marker = label, error = %e, "marker send failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Device session adapter
// ---------------------------------------------------------------------------

/// Capability interface over the two tracking-hardware families. A session is
/// ephemeral: it exists for one run and must reach stopped-and-saved before
/// the process exits normally.
pub trait DeviceSession {
    fn family(&self) -> &'static str;
    fn start_recording(&mut self) -> Result<()>;
    /// `timestamp` is advisory: the socket family always queries the device
    /// clock itself and ignores the supplied value.
    fn mark_event(&mut self, label: &str, timestamp: Option<f64>) -> Result<()>;
    fn stop_and_save(&mut self) -> Result<String>;
}

pub fn connect_device(hardware: &HardwareConfig) -> Result<Box<dyn DeviceSession>> {
    match hardware.tracker {
        TrackerFamily::Socket => Ok(Box::new(RemoteSocketSession::connect(
            &hardware.socket_address,
        )?)),
        TrackerFamily::Managed => Ok(Box::new(discover_managed(
            &hardware.discovery_address,
            Duration::from_secs_f64(hardware.discovery_timeout_s.max(0.1)),
        )?)),
        TrackerFamily::None => Ok(Box::new(NullSession::new())),
    }
}

/// Protocol-socket family: durable line-based request/response channel with a
/// device-clock query.
#[derive(Debug)]
pub struct RemoteSocketSession {
    address: String,
    stream: TcpStream,
    reader: BufReader<TcpStream>,
    recording: bool,
}

impl RemoteSocketSession {
    pub fn connect(address: &str) -> Result<Self> {
        let stream = TcpStream::connect(address).map_err(|e| {
            Error::Device(format!("cannot reach socket device at {}: {}", address, e))
        })?;
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .map_err(|e| Error::Device(format!("socket configuration failed: {}", e)))?;
        stream
            .set_write_timeout(Some(Duration::from_secs(5)))
            .map_err(|e| Error::Device(format!("socket configuration failed: {}", e)))?;
        let reader = BufReader::new(
            stream
                .try_clone()
                .map_err(|e| Error::Device(format!("socket clone failed: {}", e)))?,
        );
        info!(address, "socket device connected");
        Ok(Self {
            address: address.to_string(),
            stream,
            reader,
            recording: false,
        })
    }

    fn request(&mut self, line: &str) -> Result<String> {
        self.stream
            .write_all(line.as_bytes())
            .and_then(|_| self.stream.write_all(b"\n"))
            .and_then(|_| self.stream.flush())
            .map_err(|e| Error::Device(format!("send to {} failed: {}", self.address, e)))?;
        let mut reply = String::new();
        let read = self
            .reader
            .read_line(&mut reply)
            .map_err(|e| Error::Device(format!("reply from {} failed: {}", self.address, e)))?;
        if read == 0 {
            return Err(Error::Device(format!(
                "device at {} closed the connection",
                self.address
            )));
        }
        Ok(reply.trim().to_string())
    }

    /// Current device clock, command `t`.
    pub fn clock(&mut self) -> Result<f64> {
        let reply = self.request("t")?;
        reply
            .parse::<f64>()
            .map_err(|_| Error::Device(format!("unparseable device clock reply: '{}'", reply)))
    }
}

impl DeviceSession for RemoteSocketSession {
    fn family(&self) -> &'static str {
        TrackerFamily::Socket.as_str()
    }

    fn start_recording(&mut self) -> Result<()> {
        self.request("R")?;
        self.recording = true;
        info!(address = %self.address, "recording started");
        Ok(())
    }

    fn mark_event(&mut self, label: &str, _timestamp: Option<f64>) -> Result<()> {
        // Two-step handshake, in this order: the annotation must reference a
        // freshly queried device clock. A host-supplied timestamp would land
        // the marker off the recording's timeline.
        let timestamp = self.clock()?;
        let payload = serde_json::json!({
            "topic": "annotation",
            "label": label,
            "duration": 0.0,
            "timestamp": timestamp,
            "tags": [],
        });
        self.request(&format!("annotation {}", payload))?;
        Ok(())
    }

    fn stop_and_save(&mut self) -> Result<String> {
        let recording_id = self.request("r")?;
        self.recording = false;
        Ok(recording_id)
    }
}

impl Drop for RemoteSocketSession {
    fn drop(&mut self) {
        if self.recording {
            warn!(address = %self.address, "session dropped while recording; sending stop");
            let _ = self.request("r");
        }
    }
}

/// Discovery probe for the managed-recording family. Exactly one device must
/// answer within the timeout.
pub fn discover_managed(probe_address: &str, timeout: Duration) -> Result<ManagedSession> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .map_err(|e| Error::Device(format!("cannot open discovery socket: {}", e)))?;
    let _ = socket.set_broadcast(true);
    socket
        .set_read_timeout(Some(Duration::from_millis(200)))
        .map_err(|e| Error::Device(format!("discovery socket configuration failed: {}", e)))?;
    socket
        .send_to(b"stimlab-discover-v1", probe_address)
        .map_err(|e| Error::Device(format!("discovery probe to {} failed: {}", probe_address, e)))?;

    let deadline = Instant::now() + timeout;
    let mut devices: BTreeSet<String> = BTreeSet::new();
    let mut buf = [0u8; 512];
    while Instant::now() < deadline {
        match socket.recv_from(&mut buf) {
            Ok((n, peer)) => {
                let reply = String::from_utf8_lossy(&buf[..n]).trim().to_string();
                if reply.starts_with("http://") || reply.starts_with("https://") {
                    info!(device = %reply, peer = %peer, "discovery reply");
                    devices.insert(reply);
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => return Err(Error::Device(format!("discovery receive failed: {}", e))),
        }
    }

    match devices.len() {
        0 => Err(Error::DeviceNotFound(
            "no managed-recording device answered discovery".to_string(),
        )),
        1 => ManagedSession::new(devices.into_iter().next().unwrap_or_default()),
        n => Err(Error::DeviceNotFound(format!(
            "{} managed-recording devices answered discovery; exactly one is required",
            n
        ))),
    }
}

/// Managed-recording family: REST control channel on a discovered device.
#[derive(Debug)]
pub struct ManagedSession {
    base_url: String,
    client: reqwest::blocking::Client,
    recording: bool,
}

impl ManagedSession {
    pub fn new(base_url: String) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::Device(format!("cannot build device client: {}", e)))?;
        Ok(Self {
            base_url,
            client,
            recording: false,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn post(
        &self,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::blocking::Response> {
        let url = format!("{}{}", self.base_url, path);
        let request = self.client.post(&url);
        let request = match body {
            Some(body) => request.json(&body),
            None => request,
        };
        let response = request
            .send()
            .map_err(|e| Error::Device(format!("request to {} failed: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(Error::Device(format!(
                "device rejected {} with status {}",
                url,
                response.status()
            )));
        }
        Ok(response)
    }
}

impl DeviceSession for ManagedSession {
    fn family(&self) -> &'static str {
        TrackerFamily::Managed.as_str()
    }

    fn start_recording(&mut self) -> Result<()> {
        self.post("/api/recording/start", None)?;
        self.recording = true;
        info!(device = %self.base_url, "recording started");
        Ok(())
    }

    fn mark_event(&mut self, label: &str, timestamp: Option<f64>) -> Result<()> {
        let mut body = serde_json::json!({ "name": label });
        if let Some(ts) = timestamp {
            body["timestamp"] = serde_json::json!(ts);
        }
        self.post("/api/event", Some(body))?;
        Ok(())
    }

    fn stop_and_save(&mut self) -> Result<String> {
        let response = self.post("/api/recording/stop_and_save", None)?;
        let value: serde_json::Value = response
            .json()
            .map_err(|e| Error::Device(format!("unparseable stop_and_save reply: {}", e)))?;
        let recording_id = value
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Device("stop_and_save reply carried no id".to_string()))?
            .to_string();
        self.recording = false;
        Ok(recording_id)
    }
}

impl Drop for ManagedSession {
    fn drop(&mut self) {
        if self.recording {
            warn!(device = %self.base_url, "session dropped while recording; sending stop");
            let _ = self.post("/api/recording/stop_and_save", None);
        }
    }
}

/// Stand-in session for dry runs: counts events and synthesizes a recording
/// identifier.
pub struct NullSession {
    events: Vec<String>,
    recording: bool,
}

impl NullSession {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            recording: false,
        }
    }

    pub fn events(&self) -> &[String] {
        &self.events
    }
}

impl Default for NullSession {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceSession for NullSession {
    fn family(&self) -> &'static str {
        TrackerFamily::None.as_str()
    }

    fn start_recording(&mut self) -> Result<()> {
        self.recording = true;
        info!("dry-run recording started");
        Ok(())
    }

    fn mark_event(&mut self, label: &str, _timestamp: Option<f64>) -> Result<()> {
        self.events.push(label.to_string());
        Ok(())
    }

    fn stop_and_save(&mut self) -> Result<String> {
        self.recording = false;
        info!(events = self.events.len(), "dry-run recording stopped");
        Ok("dry-run".to_string())
    }
}

// ---------------------------------------------------------------------------
// Stimulus sequencer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    AwaitingStart,
    DriftCheck,
    Presenting,
    Finalizing,
    Closed,
}

#[derive(Debug)]
pub struct SessionReport {
    pub presented: usize,
    pub duration: Duration,
    pub recording_id: String,
    pub order_path: PathBuf,
}

#[derive(Debug, Serialize)]
struct SessionSummary {
    started_at: String,
    duration_s: f64,
    presented: usize,
    recording_id: String,
}

/// One presentation run. Owns its display surface and device session
/// exclusively; both are released on every exit path (surface and device
/// types close themselves on drop).
pub struct StimulusSession {
    params: SessionParams,
    output_dir: PathBuf,
    script_images_dir: PathBuf,
    surface: Box<dyn DisplaySurface>,
    device: Box<dyn DeviceSession>,
    outlet: MarkerOutlet,
    sequence: Vec<Stimulus>,
    order: Vec<String>,
    phase: Phase,
    ended: bool,
}

impl StimulusSession {
    pub fn new(
        experiment_dir: &Path,
        config: &ExperimentConfig,
        source_override: Option<StimulusSource>,
        surface: Box<dyn DisplaySurface>,
        device: Box<dyn DeviceSession>,
        outlet: MarkerOutlet,
    ) -> Result<Self> {
        let params = config.session.clone();
        let source = source_override.unwrap_or(params.source);
        let objects_dir = experiment_dir.join(&config.paths.objects);
        let sequence = build_sequence(experiment_dir, &objects_dir, &params, source)?;
        let output_dir = experiment_dir.join(&config.paths.output);
        ensure_dir(&output_dir)?;
        info!(
            stimuli = sequence.len(),
            source = ?source,
            device = device.family(),
            "session initialized"
        );
        Ok(Self {
            params,
            output_dir,
            script_images_dir: experiment_dir.join(&config.paths.script_images),
            surface,
            device,
            outlet,
            sequence,
            order: Vec::new(),
            phase: Phase::Initializing,
            ended: false,
        })
    }

    pub fn sequence(&self) -> &[Stimulus] {
        &self.sequence
    }

    fn transition(&mut self, next: Phase) {
        info!(from = ?self.phase, to = ?next, "session phase");
        self.phase = next;
    }

    /// Emit one semantic event to both synchronized channels. Each channel is
    /// fire-and-forget: a channel failing to receive the marker is logged but
    /// not remedied. No marker traffic is permitted after END.
    fn emit_marker(&mut self, label: &str) -> Result<()> {
        if self.ended {
            return Err(Error::Operational(format!(
                "marker '{}' rejected: session already emitted END",
                label
            )));
        }
        self.outlet.push(label);
        if let Err(e) = self.device.mark_event(label, None) {
            warn!(marker = label, error = %e, "device annotation failed");
        }
        Ok(())
    }

    /// Blocking wall-clock hold. Pacing is fixed; there is no catch-up when
    /// rendering overruns the target duration.
    fn hold(seconds: f64) {
        if seconds > 0.0 {
            thread::sleep(Duration::from_secs_f64(seconds));
        }
    }

    pub fn run(mut self) -> Result<SessionReport> {
        self.transition(Phase::AwaitingStart);
        match find_script_image(&self.script_images_dir, WELCOME_IMAGE_STEM) {
            Some(image) => {
                self.surface.show_image(&image)?;
                Self::hold(self.params.welcome_time_s);
            }
            None => self.surface.show_text("Press start to begin")?,
        }
        self.surface.await_start()?;

        self.transition(Phase::DriftCheck);
        self.surface.show_fixation()?;
        self.emit_marker("DRIFT")?;
        Self::hold(self.params.drift_time_s);

        self.transition(Phase::Presenting);
        self.device.start_recording()?;
        let started_at = Utc::now().to_rfc3339();
        self.emit_marker("START")?;
        let watch = Stopwatch::start("presentation");

        info!(count = self.sequence.len(), "presenting stimuli");
        for index in 0..self.sequence.len() {
            let stimulus = self.sequence[index].clone();
            // A stimulus failing to render is fatal: skipping would silently
            // reorder a timing-synchronized recording.
            self.surface.show_image(&stimulus.path)?;
            self.emit_marker(&format!("stim_{}", index))?;
            if self.params.capture_frames {
                let dest = self
                    .output_dir
                    .join(format!("{:03}_{}", index, stimulus.file_name()));
                self.surface.capture_frame(&dest)?;
            }
            Self::hold(self.params.stim_time_s);
            self.surface.blank()?;
            Self::hold(self.params.blank_time_s);
            self.order.push(stimulus.file_name());
        }

        self.transition(Phase::Finalizing);
        self.emit_marker("END")?;
        self.ended = true;

        let order_path = self.output_dir.join(ORDER_FILE);
        let mut content = String::new();
        for name in &self.order {
            content.push_str(name);
            content.push('\n');
        }
        atomic_write_bytes(&order_path, content.as_bytes())?;

        let duration = watch.stop();
        let recording_id = self.device.stop_and_save()?;
        info!(recording_id = %recording_id, "recording stopped and saved");

        let summary = SessionSummary {
            started_at,
            duration_s: duration.as_secs_f64(),
            presented: self.order.len(),
            recording_id: recording_id.clone(),
        };
        stim_core::save_yaml(&self.output_dir.join(SESSION_SUMMARY_FILE), &summary)?;

        if let Some(image) = find_script_image(&self.script_images_dir, GOODBYE_IMAGE_STEM) {
            self.surface.show_image(&image)?;
            Self::hold(self.params.goodbye_time_s);
        }

        self.transition(Phase::Closed);
        self.surface.close();

        Ok(SessionReport {
            presented: self.order.len(),
            duration,
            recording_id,
            order_path,
        })
    }
}
