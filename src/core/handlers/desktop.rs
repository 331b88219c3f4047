use std::time::Duration;

use chrono::Local;
use serde_json::json;
use tracing::debug;

use super::{param_str, HandlerError, HandlerSettings};
use crate::config::expand_path;
use crate::core::automation::{Automation, MouseButton, SystemMetrics};
use crate::core::intent::ExecutionResult;
use crate::core::params::IntentParams;

const MAX_CLICKS: i64 = 10;

pub(super) async fn take_screenshot(
    automation: &dyn Automation,
    settings: &HandlerSettings,
    params: &IntentParams,
) -> Result<ExecutionResult, HandlerError> {
    let requested = param_str(params, "save_path").unwrap_or("desktop");
    let target = if requested.eq_ignore_ascii_case("desktop") {
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        settings.dirs.desktop.join(format!("screenshot_{}.png", stamp))
    } else {
        expand_path(requested)
    };

    let saved = automation.take_screenshot(&target).await?;
    Ok(ExecutionResult::ok(format!("Screenshot saved to {}", saved.display()))
        .with_data(json!({ "path": saved })))
}

pub(super) async fn click_coordinates(
    automation: &dyn Automation,
    params: &IntentParams,
) -> Result<ExecutionResult, HandlerError> {
    let (x, y) = params
        .get("coordinates")
        .and_then(|value| value.coordinates())
        .ok_or_else(|| HandlerError::invalid("coordinates", "expected an x,y pair"))?;
    let button: MouseButton = param_str(params, "button").unwrap_or("left").parse()?;
    let clicks = match params.get("clicks") {
        None => 1,
        Some(value) => value
            .as_int()
            .filter(|n| (1..=MAX_CLICKS).contains(n))
            .ok_or_else(|| HandlerError::invalid("clicks", format!("expected 1 to {}, got '{}'", MAX_CLICKS, value)))?,
    };

    if let Ok((width, height)) = automation.screen_size().await {
        if x >= i64::from(width) || y >= i64::from(height) {
            return Err(HandlerError::invalid(
                "coordinates",
                format!("({}, {}) is outside the {}x{} screen", x, y, width, height),
            ));
        }
    }

    automation.click(x, y, button, clicks as u32).await?;
    Ok(ExecutionResult::ok(format!(
        "Clicked at ({}, {}) with {} button",
        x,
        y,
        button.name()
    ))
    .with_data(json!({ "x": x, "y": y, "button": button, "clicks": clicks })))
}

pub(super) async fn type_text(
    automation: &dyn Automation,
    params: &IntentParams,
) -> Result<ExecutionResult, HandlerError> {
    let text = params
        .get("text")
        .and_then(|value| value.as_str())
        .filter(|text| !text.is_empty())
        .ok_or_else(|| HandlerError::invalid("text", "nothing to type"))?;
    let interval = match params.get("interval") {
        None => 0.01,
        Some(value) => value
            .as_float()
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .ok_or_else(|| HandlerError::invalid("interval", format!("'{}' is not a number of seconds", value)))?,
    };

    automation
        .type_text(text, Duration::from_secs_f64(interval))
        .await?;
    Ok(ExecutionResult::ok(format!("Typed: {}", text))
        .with_data(json!({ "characters": text.chars().count(), "interval": interval })))
}

pub(super) async fn minimize_window(
    automation: &dyn Automation,
    params: &IntentParams,
) -> Result<ExecutionResult, HandlerError> {
    let title = param_str(params, "window_title")
        .filter(|t| !matches!(t.to_lowercase().as_str(), "all" | "all windows" | "everything"));

    let Some(title) = title else {
        automation.minimize_all().await?;
        return Ok(ExecutionResult::ok("Minimized all windows"));
    };

    match automation.find_window(title).await? {
        Some(window) => {
            debug!(id = window.id, title = %window.title, "minimizing");
            automation.minimize_window(&window).await?;
            Ok(ExecutionResult::ok(format!("Minimized window: {}", window.title)))
        }
        None => Ok(ExecutionResult::failure(format!("Window not found: {}", title))),
    }
}

pub(super) async fn system_information(
    automation: &dyn Automation,
    params: &IntentParams,
) -> Result<ExecutionResult, HandlerError> {
    let info_type = param_str(params, "info_type").unwrap_or("general").to_lowercase();
    let metrics = automation.system_metrics().await?;

    let (lines, data) = match info_type.as_str() {
        "cpu" => cpu_section(&metrics),
        "memory" => memory_section(&metrics),
        "disk" => disk_section(&metrics),
        "network" => network_section(&metrics),
        "general" => {
            let mut lines = vec![
                format!("OS: {} ({})", metrics.os, metrics.arch),
                format!("Host: {}", metrics.hostname.as_deref().unwrap_or("unknown")),
            ];
            if let Some(uptime) = metrics.uptime_secs {
                lines.push(format!("Uptime: {}h {}m", uptime / 3600, (uptime % 3600) / 60));
            }
            for (section, _) in [
                cpu_section(&metrics),
                memory_section(&metrics),
                disk_section(&metrics),
            ] {
                lines.extend(section);
            }
            (lines, serde_json::to_value(&metrics).unwrap_or_default())
        }
        other => {
            return Err(HandlerError::invalid(
                "info_type",
                format!("unknown section '{}' (expected general, cpu, memory, disk or network)", other),
            ))
        }
    };

    Ok(ExecutionResult::ok(lines.join("\n")).with_data(data))
}

fn cpu_section(metrics: &SystemMetrics) -> (Vec<String>, serde_json::Value) {
    let mut lines = vec![format!("CPU cores: {}", metrics.cpu_count)];
    if let Some([one, five, fifteen]) = metrics.load_average {
        lines.push(format!("Load average: {:.2} {:.2} {:.2}", one, five, fifteen));
    }
    (lines, json!({ "cpu_count": metrics.cpu_count, "load_average": metrics.load_average }))
}

fn memory_section(metrics: &SystemMetrics) -> (Vec<String>, serde_json::Value) {
    let lines = match (metrics.memory_total_kb, metrics.memory_available_kb) {
        (Some(total), Some(available)) => vec![format!(
            "Memory: {} MB available of {} MB ({:.1}% used)",
            available / 1024,
            total / 1024,
            percent_used(total, available)
        )],
        _ => vec!["Memory: unavailable".to_string()],
    };
    (
        lines,
        json!({ "memory_total_kb": metrics.memory_total_kb, "memory_available_kb": metrics.memory_available_kb }),
    )
}

fn disk_section(metrics: &SystemMetrics) -> (Vec<String>, serde_json::Value) {
    let lines = match (metrics.disk_total_kb, metrics.disk_available_kb) {
        (Some(total), Some(available)) => vec![format!(
            "Disk: {} GB free of {} GB ({:.1}% used)",
            available / (1024 * 1024),
            total / (1024 * 1024),
            percent_used(total, available)
        )],
        _ => vec!["Disk: unavailable".to_string()],
    };
    (
        lines,
        json!({ "disk_total_kb": metrics.disk_total_kb, "disk_available_kb": metrics.disk_available_kb }),
    )
}

fn network_section(metrics: &SystemMetrics) -> (Vec<String>, serde_json::Value) {
    let lines = vec![format!("Network interfaces: {}", metrics.network_interfaces.join(", "))];
    (lines, json!({ "network_interfaces": metrics.network_interfaces }))
}

fn percent_used(total: u64, available: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (total.saturating_sub(available)) as f64 * 100.0 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::automation::{Action, RecordingAutomation};
    use crate::core::handlers::testing;
    use crate::core::params::ParamValue;

    #[tokio::test]
    async fn test_click_reports_position_and_button() {
        let automation = RecordingAutomation::new();
        let params = testing::params(&[
            ("coordinates", ParamValue::Coordinates { x: 500, y: 300 }),
            ("button", "right".into()),
            ("clicks", ParamValue::Int(2)),
        ]);
        let result = click_coordinates(&automation, &params).await.unwrap();
        assert_eq!(result.message, "Clicked at (500, 300) with right button");
        assert_eq!(
            automation.actions(),
            vec![Action::Click { x: 500, y: 300, button: MouseButton::Right, clicks: 2 }]
        );
    }

    #[tokio::test]
    async fn test_click_rejects_offscreen_and_bad_counts() {
        let automation = RecordingAutomation::new();
        let offscreen = testing::params(&[("coordinates", ParamValue::Coordinates { x: 5000, y: 10 })]);
        assert!(click_coordinates(&automation, &offscreen).await.is_err());

        let raw_count = testing::params(&[
            ("coordinates", ParamValue::Coordinates { x: 5, y: 10 }),
            ("clicks", "lots".into()),
        ]);
        let err = click_coordinates(&automation, &raw_count).await.unwrap_err();
        assert!(err.to_string().contains("clicks"));
        assert!(automation.actions().is_empty());
    }

    #[tokio::test]
    async fn test_screenshot_desktop_default() {
        let dir = tempfile::tempdir().unwrap();
        let settings = testing::settings(dir.path());
        let automation = RecordingAutomation::new();
        let params = testing::params(&[("save_path", ParamValue::Path("desktop".into()))]);

        let result = take_screenshot(&automation, &settings, &params).await.unwrap();
        assert!(result.success);
        match automation.actions().as_slice() {
            [Action::Screenshot(path)] => {
                assert!(path.starts_with(&settings.dirs.desktop));
                let name = path.file_name().unwrap().to_string_lossy().into_owned();
                assert!(name.starts_with("screenshot_") && name.ends_with(".png"));
            }
            other => panic!("unexpected actions {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_minimize_by_title_and_all() {
        let automation = RecordingAutomation::new().with_windows(&["Untitled - Notepad"]);
        let one = testing::params(&[("window_title", "notepad".into())]);
        assert!(minimize_window(&automation, &one).await.unwrap().success);

        let missing = testing::params(&[("window_title", "paint".into())]);
        let result = minimize_window(&automation, &missing).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Window not found: paint"));

        minimize_window(&automation, &IntentParams::new()).await.unwrap();
        assert_eq!(
            automation.actions(),
            vec![Action::Minimize("Untitled - Notepad".to_string()), Action::MinimizeAll]
        );
    }

    #[tokio::test]
    async fn test_system_information_sections() {
        let automation = RecordingAutomation::new();
        let general = system_information(&automation, &IntentParams::new()).await.unwrap();
        assert!(general.message.contains("CPU cores: 4"));
        assert!(general.message.contains("Memory:"));

        let cpu = testing::params(&[("info_type", "cpu".into())]);
        let result = system_information(&automation, &cpu).await.unwrap();
        assert!(!result.message.contains("Memory"));

        let bogus = testing::params(&[("info_type", "gpu".into())]);
        assert!(system_information(&automation, &bogus).await.is_err());
    }

    #[tokio::test]
    async fn test_type_text_uses_interval() {
        let automation = RecordingAutomation::new();
        let params = testing::params(&[("text", "Hello World".into()), ("interval", ParamValue::Float(0.0))]);
        let result = type_text(&automation, &params).await.unwrap();
        assert_eq!(result.message, "Typed: Hello World");
        assert_eq!(automation.actions(), vec![Action::Type("Hello World".to_string())]);
    }
}
