use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("{0} is not supported by this automation backend")]
    Unsupported(&'static str),
    #[error("Failed to launch '{target}': {source}")]
    Launch {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Unknown mouse button: {0}")]
    UnknownButton(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

impl MouseButton {
    pub fn name(&self) -> &'static str {
        match self {
            MouseButton::Left => "left",
            MouseButton::Right => "right",
            MouseButton::Middle => "middle",
        }
    }
}

impl FromStr for MouseButton {
    type Err = AutomationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "left" => Ok(MouseButton::Left),
            "right" => Ok(MouseButton::Right),
            "middle" => Ok(MouseButton::Middle),
            other => Err(AutomationError::UnknownButton(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowInfo {
    pub id: u64,
    pub title: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemMetrics {
    pub os: String,
    pub arch: String,
    pub hostname: Option<String>,
    pub cpu_count: usize,
    pub load_average: Option<[f64; 3]>,
    pub memory_total_kb: Option<u64>,
    pub memory_available_kb: Option<u64>,
    pub disk_total_kb: Option<u64>,
    pub disk_available_kb: Option<u64>,
    pub network_interfaces: Vec<String>,
    pub uptime_secs: Option<u64>,
}

/// OS-level primitives used by intent handlers.
#[async_trait]
pub trait Automation: Send + Sync {
    async fn click(&self, x: i64, y: i64, button: MouseButton, clicks: u32) -> Result<(), AutomationError>;
    async fn type_text(&self, text: &str, interval: Duration) -> Result<(), AutomationError>;
    async fn press_key(&self, key: &str) -> Result<(), AutomationError>;
    async fn hotkey(&self, keys: &[&str]) -> Result<(), AutomationError>;
    async fn launch_application(&self, command: &str) -> Result<(), AutomationError>;
    async fn open_path(&self, path: &Path) -> Result<(), AutomationError>;
    async fn take_screenshot(&self, path: &Path) -> Result<PathBuf, AutomationError>;
    async fn system_metrics(&self) -> Result<SystemMetrics, AutomationError>;
    async fn screen_size(&self) -> Result<(u32, u32), AutomationError>;
    async fn list_windows(&self) -> Result<Vec<WindowInfo>, AutomationError>;
    async fn minimize_window(&self, window: &WindowInfo) -> Result<(), AutomationError>;
    async fn minimize_all(&self) -> Result<(), AutomationError>;

    /// First window whose title contains `fragment`, ignoring case.
    async fn find_window(&self, fragment: &str) -> Result<Option<WindowInfo>, AutomationError> {
        let needle = fragment.to_lowercase();
        Ok(self
            .list_windows()
            .await?
            .into_iter()
            .find(|window| window.title.to_lowercase().contains(&needle)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Click { x: i64, y: i64, button: MouseButton, clicks: u32 },
    Type(String),
    Key(String),
    Hotkey(Vec<String>),
    Launch(String),
    Open(PathBuf),
    Screenshot(PathBuf),
    Minimize(String),
    MinimizeAll,
}

/// Dry-run backend: performs nothing and records every action.
pub struct RecordingAutomation {
    actions: Mutex<Vec<Action>>,
    windows: Vec<WindowInfo>,
    screen: (u32, u32),
}

impl RecordingAutomation {
    pub fn new() -> Self {
        Self {
            actions: Mutex::new(Vec::new()),
            windows: Vec::new(),
            screen: (1920, 1080),
        }
    }

    pub fn with_windows(mut self, titles: &[&str]) -> Self {
        self.windows = titles
            .iter()
            .enumerate()
            .map(|(i, title)| WindowInfo {
                id: i as u64 + 1,
                title: title.to_string(),
            })
            .collect();
        self
    }

    pub fn actions(&self) -> Vec<Action> {
        self.actions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn record(&self, action: Action) {
        info!(?action, "dry-run automation");
        self.actions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(action);
    }
}

impl Default for RecordingAutomation {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Automation for RecordingAutomation {
    async fn click(&self, x: i64, y: i64, button: MouseButton, clicks: u32) -> Result<(), AutomationError> {
        self.record(Action::Click { x, y, button, clicks });
        Ok(())
    }

    async fn type_text(&self, text: &str, _interval: Duration) -> Result<(), AutomationError> {
        self.record(Action::Type(text.to_string()));
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<(), AutomationError> {
        self.record(Action::Key(key.to_string()));
        Ok(())
    }

    async fn hotkey(&self, keys: &[&str]) -> Result<(), AutomationError> {
        self.record(Action::Hotkey(keys.iter().map(|k| k.to_string()).collect()));
        Ok(())
    }

    async fn launch_application(&self, command: &str) -> Result<(), AutomationError> {
        self.record(Action::Launch(command.to_string()));
        Ok(())
    }

    async fn open_path(&self, path: &Path) -> Result<(), AutomationError> {
        self.record(Action::Open(path.to_path_buf()));
        Ok(())
    }

    async fn take_screenshot(&self, path: &Path) -> Result<PathBuf, AutomationError> {
        self.record(Action::Screenshot(path.to_path_buf()));
        Ok(path.to_path_buf())
    }

    async fn system_metrics(&self) -> Result<SystemMetrics, AutomationError> {
        Ok(SystemMetrics {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            cpu_count: 4,
            memory_total_kb: Some(8 * 1024 * 1024),
            memory_available_kb: Some(4 * 1024 * 1024),
            disk_total_kb: Some(256 * 1024 * 1024),
            disk_available_kb: Some(128 * 1024 * 1024),
            network_interfaces: vec!["lo".to_string(), "eth0".to_string()],
            ..SystemMetrics::default()
        })
    }

    async fn screen_size(&self) -> Result<(u32, u32), AutomationError> {
        Ok(self.screen)
    }

    async fn list_windows(&self) -> Result<Vec<WindowInfo>, AutomationError> {
        Ok(self.windows.clone())
    }

    async fn minimize_window(&self, window: &WindowInfo) -> Result<(), AutomationError> {
        self.record(Action::Minimize(window.title.clone()));
        Ok(())
    }

    async fn minimize_all(&self) -> Result<(), AutomationError> {
        self.record(Action::MinimizeAll);
        Ok(())
    }
}

/// Live backend. Starts processes and opens files with the desktop opener;
/// synthetic input and window control are left to platform-specific
/// backends.
pub struct HostAutomation;

impl HostAutomation {
    fn spawn(program: &str, args: &[&str], target: &str) -> Result<(), AutomationError> {
        debug!(program, ?args, "spawning");
        std::process::Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map(|_child| ())
            .map_err(|source| AutomationError::Launch {
                target: target.to_string(),
                source,
            })
    }
}

#[async_trait]
impl Automation for HostAutomation {
    async fn click(&self, _x: i64, _y: i64, _button: MouseButton, _clicks: u32) -> Result<(), AutomationError> {
        Err(AutomationError::Unsupported("Mouse input"))
    }

    async fn type_text(&self, _text: &str, _interval: Duration) -> Result<(), AutomationError> {
        Err(AutomationError::Unsupported("Keyboard input"))
    }

    async fn press_key(&self, _key: &str) -> Result<(), AutomationError> {
        Err(AutomationError::Unsupported("Keyboard input"))
    }

    async fn hotkey(&self, _keys: &[&str]) -> Result<(), AutomationError> {
        Err(AutomationError::Unsupported("Keyboard input"))
    }

    async fn launch_application(&self, command: &str) -> Result<(), AutomationError> {
        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| AutomationError::Unsupported("Launching an empty command"))?;
        let args: Vec<&str> = parts.collect();
        if cfg!(windows) {
            let mut full = vec!["/C", "start", "", program];
            full.extend(args.iter());
            Self::spawn("cmd", &full, command)
        } else {
            Self::spawn(program, &args, command)
        }
    }

    async fn open_path(&self, path: &Path) -> Result<(), AutomationError> {
        let target = path.to_string_lossy();
        if cfg!(windows) {
            Self::spawn("cmd", &["/C", "start", "", target.as_ref()], &target)
        } else if cfg!(target_os = "macos") {
            Self::spawn("open", &[target.as_ref()], &target)
        } else {
            Self::spawn("xdg-open", &[target.as_ref()], &target)
        }
    }

    async fn take_screenshot(&self, _path: &Path) -> Result<PathBuf, AutomationError> {
        Err(AutomationError::Unsupported("Screen capture"))
    }

    async fn system_metrics(&self) -> Result<SystemMetrics, AutomationError> {
        Ok(host_metrics())
    }

    async fn screen_size(&self) -> Result<(u32, u32), AutomationError> {
        Err(AutomationError::Unsupported("Screen geometry"))
    }

    async fn list_windows(&self) -> Result<Vec<WindowInfo>, AutomationError> {
        Err(AutomationError::Unsupported("Window enumeration"))
    }

    async fn minimize_window(&self, _window: &WindowInfo) -> Result<(), AutomationError> {
        Err(AutomationError::Unsupported("Window control"))
    }

    async fn minimize_all(&self) -> Result<(), AutomationError> {
        Err(AutomationError::Unsupported("Window control"))
    }
}

fn host_metrics() -> SystemMetrics {
    let mut metrics = SystemMetrics {
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        cpu_count: std::thread::available_parallelism().map_or(1, |n| n.get()),
        hostname: std::env::var("HOSTNAME").ok().or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        }),
        ..SystemMetrics::default()
    };

    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        metrics.memory_total_kb = meminfo_field(&meminfo, "MemTotal:");
        metrics.memory_available_kb = meminfo_field(&meminfo, "MemAvailable:");
    }
    if let Ok(loadavg) = std::fs::read_to_string("/proc/loadavg") {
        let values: Vec<f64> = loadavg
            .split_whitespace()
            .take(3)
            .filter_map(|v| v.parse().ok())
            .collect();
        if let [one, five, fifteen] = values[..] {
            metrics.load_average = Some([one, five, fifteen]);
        }
    }
    if let Ok(uptime) = std::fs::read_to_string("/proc/uptime") {
        metrics.uptime_secs = uptime
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<f64>().ok())
            .map(|secs| secs as u64);
    }
    if let Ok(entries) = std::fs::read_dir("/sys/class/net") {
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        metrics.network_interfaces = names;
    }
    if cfg!(unix) {
        if let Some((total, available)) = root_disk_usage() {
            metrics.disk_total_kb = Some(total);
            metrics.disk_available_kb = Some(available);
        }
    }
    metrics
}

fn meminfo_field(meminfo: &str, key: &str) -> Option<u64> {
    meminfo
        .lines()
        .find(|line| line.starts_with(key))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|v| v.parse().ok())
}

/// Total and available KiB of the root filesystem, from POSIX `df`.
fn root_disk_usage() -> Option<(u64, u64)> {
    let output = std::process::Command::new("df").args(["-Pk", "/"]).output().ok()?;
    let text = String::from_utf8_lossy(&output.stdout);
    let fields: Vec<&str> = text.lines().nth(1)?.split_whitespace().collect();
    let total = fields.get(1)?.parse().ok()?;
    let available = fields.get(3)?.parse().ok()?;
    Some((total, available))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mouse_button_parse() {
        assert_eq!("Right".parse::<MouseButton>().unwrap(), MouseButton::Right);
        assert!("sideways".parse::<MouseButton>().is_err());
    }

    #[tokio::test]
    async fn test_recording_automation_records_and_finds_windows() {
        let automation = RecordingAutomation::new().with_windows(&["Untitled - Notepad", "Calculator"]);
        automation.hotkey(&["ctrl", "l"]).await.unwrap();
        let found = automation.find_window("notepad").await.unwrap();
        assert_eq!(found.map(|w| w.id), Some(1));
        assert!(automation.find_window("paint").await.unwrap().is_none());
        assert_eq!(
            automation.actions(),
            vec![Action::Hotkey(vec!["ctrl".to_string(), "l".to_string()])]
        );
    }

    #[test]
    fn test_meminfo_field() {
        let sample = "MemTotal:       16318412 kB\nMemFree:  1 kB\nMemAvailable:   9000 kB\n";
        assert_eq!(meminfo_field(sample, "MemTotal:"), Some(16318412));
        assert_eq!(meminfo_field(sample, "MemAvailable:"), Some(9000));
        assert_eq!(meminfo_field(sample, "SwapTotal:"), None);
    }
}
