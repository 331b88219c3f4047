use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde_json::json;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::{param_str, require_str, HandlerError, HandlerSettings, UserDirs};
use crate::config::expand_path;
use crate::core::automation::Automation;
use crate::core::intent::ExecutionResult;
use crate::core::params::IntentParams;

/// Files modified within this window count as "recent" for `open_file`.
const RECENT_WINDOW: Duration = Duration::from_secs(3600);
const SEARCH_LIMIT: usize = 20;
const SEARCH_DEPTH: usize = 3;

pub(super) async fn create_file(
    settings: &HandlerSettings,
    params: &IntentParams,
) -> Result<ExecutionResult, HandlerError> {
    let filename = params
        .get("filename")
        .and_then(|value| value.as_path())
        .filter(|path| !path.as_os_str().is_empty())
        .ok_or_else(|| HandlerError::invalid("filename", "missing"))?;
    let location = param_str(params, "location").unwrap_or("");
    let mut content = params
        .get("content")
        .and_then(|value| value.as_str())
        .unwrap_or("")
        .to_string();

    let mut path = if filename.is_absolute() {
        filename
    } else {
        resolve_location(location, &settings.dirs).join(filename)
    };
    if path.extension().is_none() {
        path.set_extension(infer_extension(&content));
    }
    if content.is_empty() {
        content = default_content(&path);
    }

    if tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Ok(ExecutionResult::failure(format!(
            "File already exists: {}",
            path.display()
        )));
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| HandlerError::io(format!("Failed to create {}", parent.display()), e))?;
    }
    tokio::fs::write(&path, content.as_bytes())
        .await
        .map_err(|e| HandlerError::io(format!("Failed to write {}", path.display()), e))?;

    info!(path = %path.display(), bytes = content.len(), "created file");
    Ok(ExecutionResult::ok(format!("Created file: {}", path.display()))
        .with_data(json!({ "path": path, "bytes": content.len() })))
}

/// Maps a spoken location to a directory. Relative paths hang off the
/// working directory.
fn resolve_location(location: &str, dirs: &UserDirs) -> PathBuf {
    match location.trim().to_lowercase().as_str() {
        "" | "here" | "current" => dirs.cwd.clone(),
        "desktop" => dirs.desktop.clone(),
        "documents" | "docs" | "my documents" => dirs.documents.clone(),
        "downloads" => dirs.downloads.clone(),
        "home" => dirs.home.clone(),
        _ => {
            let expanded = expand_path(location.trim());
            if expanded.is_absolute() {
                expanded
            } else {
                dirs.cwd.join(expanded)
            }
        }
    }
}

fn infer_extension(content: &str) -> &'static str {
    let lower = content.to_lowercase();
    if lower.contains("<html") || lower.contains("<!doctype") || lower.contains("<body") {
        "html"
    } else if lower.contains("def ") || lower.contains("import ") || lower.contains("print(") {
        "py"
    } else if lower.contains("function") || lower.contains("const ") || lower.contains("console.log") {
        "js"
    } else {
        "txt"
    }
}

fn default_content(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "untitled".to_string());
    match path.extension().and_then(|e| e.to_str()).map(str::to_lowercase).as_deref() {
        Some("html") | Some("htm") => format!(
            "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n    <meta charset=\"UTF-8\">\n    \
             <title>{stem}</title>\n</head>\n<body>\n    <h1>{stem}</h1>\n</body>\n</html>\n"
        ),
        Some("py") => format!(
            "#!/usr/bin/env python3\n\"\"\"{stem}\"\"\"\n\n\ndef main():\n    \
             print(\"Hello from {stem}\")\n\n\nif __name__ == \"__main__\":\n    main()\n"
        ),
        _ => String::new(),
    }
}

pub(super) async fn open_file(
    automation: &dyn Automation,
    settings: &HandlerSettings,
    params: &IntentParams,
) -> Result<ExecutionResult, HandlerError> {
    let target = param_str(params, "target").map(str::to_string);
    let dirs = settings.dirs.clone();

    let chosen = tokio::task::spawn_blocking(move || pick_file(&dirs, target.as_deref()))
        .await
        .map_err(|e| HandlerError::Failed(format!("File lookup stopped: {}", e)))?;

    let path = match chosen {
        Ok(path) => path,
        Err(reason) => return Ok(ExecutionResult::failure(reason)),
    };
    automation.open_path(&path).await?;
    Ok(ExecutionResult::ok(format!("Opened {}", path.display())).with_data(json!({ "path": path })))
}

/// The file named by `target`, or the newest recently modified file in the
/// usual places.
fn pick_file(dirs: &UserDirs, target: Option<&str>) -> Result<PathBuf, String> {
    if let Some(name) = target {
        let direct = expand_path(name);
        let direct = if direct.is_absolute() { direct } else { dirs.cwd.join(direct) };
        if direct.is_file() {
            return Ok(direct);
        }
    }

    let now = SystemTime::now();
    let needle = target.map(str::to_lowercase);
    let mut best: Option<(SystemTime, PathBuf)> = None;
    for dir in [&dirs.cwd, &dirs.desktop, &dirs.documents] {
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1).into_iter().flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            let Ok(modified) = meta.modified() else { continue };
            let matches = match &needle {
                Some(needle) => entry.file_name().to_string_lossy().to_lowercase().contains(needle),
                None => now
                    .duration_since(modified)
                    .map_or(true, |age| age <= RECENT_WINDOW),
            };
            if matches && best.as_ref().map_or(true, |(t, _)| modified > *t) {
                best = Some((modified, entry.into_path()));
            }
        }
    }

    best.map(|(_, path)| path).ok_or_else(|| match target {
        Some(name) => format!("No file matching '{}' found", name),
        None => "No recently created files found".to_string(),
    })
}

pub(super) async fn file_operations(
    settings: &HandlerSettings,
    params: &IntentParams,
) -> Result<ExecutionResult, HandlerError> {
    let operation = require_str(params, "operation")?.to_lowercase();
    let dirs = &settings.dirs;
    let resolve = |name: &str| {
        let path = expand_path(name.trim());
        if path.is_absolute() {
            path
        } else {
            dirs.cwd.join(path)
        }
    };

    match operation.as_str() {
        "copy" | "move" | "rename" => {
            let source = resolve(require_str(params, "source")?);
            let mut destination = resolve(require_str(params, "destination")?);
            if tokio::fs::metadata(&destination).await.map_or(false, |m| m.is_dir()) {
                if let Some(name) = source.file_name() {
                    destination = destination.join(name);
                }
            }
            if operation == "copy" {
                tokio::fs::copy(&source, &destination)
                    .await
                    .map_err(|e| HandlerError::io(format!("Failed to copy {}", source.display()), e))?;
            } else {
                tokio::fs::rename(&source, &destination)
                    .await
                    .map_err(|e| HandlerError::io(format!("Failed to move {}", source.display()), e))?;
            }
            let verb = if operation == "copy" { "Copied" } else { "Moved" };
            Ok(ExecutionResult::ok(format!(
                "{} {} to {}",
                verb,
                source.display(),
                destination.display()
            ))
            .with_data(json!({ "source": source, "destination": destination })))
        }
        "delete" => {
            let source = resolve(require_str(params, "source")?);
            let meta = tokio::fs::metadata(&source)
                .await
                .map_err(|e| HandlerError::io(format!("Cannot delete {}", source.display()), e))?;
            if !meta.is_file() {
                return Ok(ExecutionResult::failure(format!(
                    "Refusing to delete {}: not a regular file",
                    source.display()
                )));
            }
            tokio::fs::remove_file(&source)
                .await
                .map_err(|e| HandlerError::io(format!("Failed to delete {}", source.display()), e))?;
            Ok(ExecutionResult::ok(format!("Deleted {}", source.display())))
        }
        "search" | "find" => {
            let fragment = param_str(params, "filename")
                .or_else(|| param_str(params, "source"))
                .ok_or_else(|| HandlerError::invalid("filename", "nothing to search for"))?
                .to_lowercase();
            let roots = vec![
                dirs.cwd.clone(),
                dirs.desktop.clone(),
                dirs.documents.clone(),
                dirs.downloads.clone(),
            ];
            let needle = fragment.clone();
            let found = tokio::task::spawn_blocking(move || search_files(&roots, &needle))
                .await
                .map_err(|e| HandlerError::Failed(format!("Search stopped: {}", e)))?;
            let message = if found.is_empty() {
                format!("No files found matching '{}'", fragment)
            } else {
                let listing: Vec<String> = found.iter().map(|p| p.display().to_string()).collect();
                format!(
                    "Found {} file(s) matching '{}':\n{}",
                    found.len(),
                    fragment,
                    listing.join("\n")
                )
            };
            Ok(ExecutionResult::ok(message).with_data(json!({ "matches": found })))
        }
        other => Ok(ExecutionResult::failure(format!("Unsupported file operation: {}", other))),
    }
}

/// Walks `roots` down to `SEARCH_DEPTH` directories below each, collecting up
/// to `SEARCH_LIMIT` files whose name contains `needle`.
fn search_files(roots: &[PathBuf], needle: &str) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for root in roots {
        let walker = WalkDir::new(root).max_depth(SEARCH_DEPTH + 1).sort_by_file_name();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    debug!(error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if !entry.file_name().to_string_lossy().to_lowercase().contains(needle) {
                continue;
            }
            if seen.insert(entry.path().to_path_buf()) {
                found.push(entry.into_path());
                if found.len() >= SEARCH_LIMIT {
                    return found;
                }
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::automation::{Action, RecordingAutomation};
    use crate::core::handlers::testing;
    use crate::core::params::ParamValue;

    #[tokio::test]
    async fn test_create_file_on_desktop_with_default_html() {
        let dir = tempfile::tempdir().unwrap();
        let settings = testing::settings(dir.path());
        let params = testing::params(&[
            ("filename", ParamValue::Path("index.html".into())),
            ("location", "desktop".into()),
            ("content", "".into()),
        ]);

        let result = create_file(&settings, &params).await.unwrap();
        assert!(result.success, "{:?}", result);
        let written = std::fs::read_to_string(settings.dirs.desktop.join("index.html")).unwrap();
        assert!(written.contains("<title>index</title>"));

        let again = create_file(&settings, &params).await.unwrap();
        assert!(!again.success);
        assert!(again.message.contains("already exists"));
    }

    #[tokio::test]
    async fn test_create_file_infers_extension_from_content() {
        let dir = tempfile::tempdir().unwrap();
        let settings = testing::settings(dir.path());
        let params = testing::params(&[
            ("filename", ParamValue::Path("script".into())),
            ("content", "print('hi')".into()),
        ]);
        create_file(&settings, &params).await.unwrap();
        let path = settings.dirs.cwd.join("script.py");
        assert_eq!(std::fs::read_to_string(path).unwrap(), "print('hi')");
    }

    #[test]
    fn test_resolve_location_keywords() {
        let dirs = UserDirs::rooted(Path::new("/base"));
        assert_eq!(resolve_location("Desktop", &dirs), PathBuf::from("/base/Desktop"));
        assert_eq!(resolve_location("", &dirs), PathBuf::from("/base/work"));
        assert_eq!(resolve_location("notes", &dirs), PathBuf::from("/base/work/notes"));
        assert_eq!(resolve_location("/tmp/x", &dirs), PathBuf::from("/tmp/x"));
    }

    #[tokio::test]
    async fn test_open_file_prefers_named_then_recent() {
        let dir = tempfile::tempdir().unwrap();
        let settings = testing::settings(dir.path());
        std::fs::write(settings.dirs.documents.join("report.txt"), "r").unwrap();
        std::fs::write(settings.dirs.desktop.join("notes.md"), "n").unwrap();
        let automation = RecordingAutomation::new();

        let named = testing::params(&[("target", "notes".into())]);
        let result = open_file(&automation, &settings, &named).await.unwrap();
        assert!(result.success);
        assert_eq!(
            automation.actions(),
            vec![Action::Open(settings.dirs.desktop.join("notes.md"))]
        );

        let recent = open_file(&automation, &settings, &IntentParams::new()).await.unwrap();
        assert!(recent.success);

        let missing = testing::params(&[("target", "budget".into())]);
        let result = open_file(&automation, &settings, &missing).await.unwrap();
        assert_eq!(result.error.as_deref(), Some("No file matching 'budget' found"));
    }

    #[test]
    fn test_search_stops_at_depth_limit() {
        let dir = tempfile::tempdir().unwrap();
        let shallow = dir.path().join("a/b/c");
        let deep = shallow.join("d");
        std::fs::create_dir_all(&deep).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();
        std::fs::write(shallow.join("old_notes.md"), "").unwrap();
        std::fs::write(deep.join("deep_notes.md"), "").unwrap();
        std::fs::write(shallow.join("other.md"), "").unwrap();

        let roots = vec![dir.path().to_path_buf(), dir.path().to_path_buf()];
        let found = search_files(&roots, "notes");
        assert_eq!(found, vec![dir.path().join("a/b/c/old_notes.md"), dir.path().join("notes.txt")]);
    }

    #[tokio::test]
    async fn test_file_operations_copy_delete_search() {
        let dir = tempfile::tempdir().unwrap();
        let settings = testing::settings(dir.path());
        let source = settings.dirs.cwd.join("document.txt");
        std::fs::write(&source, "data").unwrap();
        std::fs::create_dir_all(settings.dirs.cwd.join("backup")).unwrap();

        let copy = testing::params(&[
            ("operation", "copy".into()),
            ("source", ParamValue::Path("document.txt".into())),
            ("destination", ParamValue::Path("backup".into())),
        ]);
        let result = file_operations(&settings, &copy).await.unwrap();
        assert!(result.success, "{:?}", result);
        assert!(settings.dirs.cwd.join("backup/document.txt").exists());

        let search = testing::params(&[("operation", "search".into()), ("filename", "DOCUMENT".into())]);
        let result = file_operations(&settings, &search).await.unwrap();
        assert!(result.message.starts_with("Found 2 file(s)"), "{}", result.message);

        let delete = testing::params(&[
            ("operation", "delete".into()),
            ("source", ParamValue::Path("document.txt".into())),
        ]);
        assert!(file_operations(&settings, &delete).await.unwrap().success);
        assert!(!source.exists());

        let missing = file_operations(&settings, &delete).await;
        assert!(missing.is_err());
    }
}
