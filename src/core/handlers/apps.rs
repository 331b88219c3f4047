use std::time::Duration;

use serde_json::json;
use url::Url;

use super::{param_str, require_str, HandlerError, HandlerSettings};
use crate::core::automation::Automation;
use crate::core::intent::ExecutionResult;
use crate::core::params::IntentParams;

const TYPING_INTERVAL: Duration = Duration::from_millis(10);

/// Spoken application names and the command that starts them on each
/// platform: (aliases, windows, macos, other unix).
const APPLICATIONS: &[(&[&str], &str, &str, &str)] = &[
    (&["calculator", "calc"], "calc", "open -a Calculator", "gnome-calculator"),
    (&["notepad"], "notepad", "open -a TextEdit", "gedit"),
    (&["explorer"], "explorer", "open .", "xdg-open ."),
    (&["chrome"], "chrome", "open -b com.google.Chrome", "google-chrome"),
    (&["firefox"], "firefox", "open -a Firefox", "firefox"),
    (&["edge"], "msedge", "open -b com.microsoft.edgemac", "microsoft-edge"),
    (&["browser"], "msedge", "open -a Safari", "x-www-browser"),
    (&["cmd", "powershell", "terminal"], "cmd", "open -a Terminal", "x-terminal-emulator"),
    (&["whatsapp", "whats app"], "whatsapp:", "open -a WhatsApp", "whatsapp-desktop"),
    (&["telegram"], "telegram", "open -a Telegram", "telegram-desktop"),
    (&["discord"], "discord", "open -a Discord", "discord"),
    (&["slack"], "slack", "open -a Slack", "slack"),
    (&["teams"], "msteams:", "open -b com.microsoft.teams2", "teams"),
    (&["zoom"], "zoommtg:", "open -a zoom.us", "zoom"),
    (&["spotify"], "spotify:", "open -a Spotify", "spotify"),
    (&["vlc"], "vlc", "open -a VLC", "vlc"),
    (&["word"], "winword", "open -b com.microsoft.Word", "libreoffice --writer"),
    (&["excel"], "excel", "open -b com.microsoft.Excel", "libreoffice --calc"),
    (&["powerpoint"], "powerpnt", "open -b com.microsoft.Powerpoint", "libreoffice --impress"),
    (&["outlook", "mail"], "outlook", "open -a Mail", "thunderbird"),
    (&["photos"], "ms-photos:", "open -a Photos", "eog"),
    (&["camera"], "microsoft.windows.camera:", "open -b com.apple.PhotoBooth", "cheese"),
    (&["calendar"], "outlookcal:", "open -a Calendar", "gnome-calendar"),
    (&["maps"], "bingmaps:", "open -a Maps", "gnome-maps"),
    (&["store"], "ms-windows-store:", "open -b com.apple.AppStore", "gnome-software"),
];

/// Command line for a spoken application name; unknown names are passed
/// through unchanged.
pub(super) fn application_command(name: &str) -> String {
    let wanted = name.trim().to_lowercase();
    let wanted = wanted.split_whitespace().collect::<Vec<_>>().join(" ");
    APPLICATIONS
        .iter()
        .find(|(aliases, ..)| aliases.contains(&wanted.as_str()))
        .map(|(_, windows, macos, unix)| {
            if cfg!(windows) {
                windows.to_string()
            } else if cfg!(target_os = "macos") {
                macos.to_string()
            } else {
                unix.to_string()
            }
        })
        .unwrap_or(wanted)
}

pub(super) async fn open_application(
    automation: &dyn Automation,
    settings: &HandlerSettings,
    params: &IntentParams,
) -> Result<ExecutionResult, HandlerError> {
    let app_name = require_str(params, "app_name")?;
    let command = application_command(app_name);
    automation.launch_application(&command).await?;
    settings.settle(1).await;
    Ok(ExecutionResult::ok(format!("Opened {}", app_name))
        .with_data(json!({ "application": app_name, "command": command })))
}

pub(super) fn search_url(query: &str) -> Result<Url, HandlerError> {
    Url::parse_with_params("https://www.google.com/search", &[("q", query)])
        .map_err(|e| HandlerError::Failed(format!("Cannot build search URL: {}", e)))
}

pub(super) async fn browser_search(
    automation: &dyn Automation,
    settings: &HandlerSettings,
    params: &IntentParams,
) -> Result<ExecutionResult, HandlerError> {
    let browser = require_str(params, "browser")?;
    let query = require_str(params, "query")?;
    let url = search_url(query)?;

    automation.launch_application(&application_command(browser)).await?;
    settings.settle(3).await;
    automation.hotkey(&["ctrl", "l"]).await?;
    automation.type_text(url.as_str(), TYPING_INTERVAL).await?;
    automation.press_key("enter").await?;

    Ok(ExecutionResult::ok(format!("Searching for '{}' in {}", query, browser))
        .with_data(json!({ "browser": browser, "url": url.as_str() })))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ChatApp {
    WhatsApp,
    Telegram,
    Discord,
}

impl ChatApp {
    fn label(&self) -> &'static str {
        match self {
            ChatApp::WhatsApp => "WhatsApp",
            ChatApp::Telegram => "Telegram",
            ChatApp::Discord => "Discord",
        }
    }

    fn launch_name(&self) -> &'static str {
        match self {
            ChatApp::WhatsApp => "whatsapp",
            ChatApp::Telegram => "telegram",
            ChatApp::Discord => "discord",
        }
    }

    /// Hotkey that opens the app's chat switcher.
    fn search_keys(&self) -> [&'static str; 2] {
        match self {
            ChatApp::WhatsApp => ["ctrl", "f"],
            ChatApp::Telegram | ChatApp::Discord => ["ctrl", "k"],
        }
    }

    fn contact_param(&self) -> &'static str {
        match self {
            ChatApp::Discord => "channel_or_user",
            _ => "contact",
        }
    }
}

/// Opens the chat and types the message, leaving it unsent.
pub(super) async fn send_chat(
    automation: &dyn Automation,
    settings: &HandlerSettings,
    app: ChatApp,
    params: &IntentParams,
) -> Result<ExecutionResult, HandlerError> {
    let contact = require_str(params, app.contact_param())?;
    let message = param_str(params, "message");

    automation
        .launch_application(&application_command(app.launch_name()))
        .await?;
    settings.settle(4).await;
    automation.hotkey(&app.search_keys()).await?;
    settings.settle(1).await;
    automation.type_text(contact, TYPING_INTERVAL).await?;
    settings.settle(2).await;
    automation.press_key("enter").await?;

    let summary = match message {
        Some(text) => {
            settings.settle(2).await;
            automation.type_text(text, TYPING_INTERVAL).await?;
            format!(
                "Opened {} chat with {} and typed the message (not sent)",
                app.label(),
                contact
            )
        }
        None => format!("Opened {} chat with {}", app.label(), contact),
    };
    Ok(ExecutionResult::ok(summary).with_data(json!({
        "app": app.label(),
        "contact": contact,
        "message": message,
        "sent": false,
    })))
}

/// Starts a new message in the mail client and fills the fields by tabbing
/// through them. The message is not sent.
pub(super) async fn email_compose(
    automation: &dyn Automation,
    settings: &HandlerSettings,
    params: &IntentParams,
) -> Result<ExecutionResult, HandlerError> {
    let recipient = require_str(params, "recipient")?;
    let subject = param_str(params, "subject");
    let body = param_str(params, "message");

    automation.launch_application(&application_command("mail")).await?;
    settings.settle(4).await;
    automation.hotkey(&["ctrl", "n"]).await?;
    settings.settle(2).await;
    automation.type_text(recipient, TYPING_INTERVAL).await?;
    automation.press_key("tab").await?;
    if let Some(subject) = subject {
        automation.type_text(subject, TYPING_INTERVAL).await?;
    }
    automation.press_key("tab").await?;
    if let Some(body) = body {
        automation.type_text(body, TYPING_INTERVAL).await?;
    }

    Ok(ExecutionResult::ok(format!("Composed email to {} (not sent)", recipient)).with_data(json!({
        "recipient": recipient,
        "subject": subject,
        "message": body,
        "sent": false,
    })))
}

fn media_key(action: &str, media: Option<&str>) -> Option<&'static str> {
    match action {
        "play" | "pause" => Some("playpause"),
        "stop" => Some("stop"),
        "next" | "skip" => Some("nexttrack"),
        "previous" => Some("prevtrack"),
        "volume" => match media.map(str::to_lowercase).as_deref() {
            Some("up") => Some("volumeup"),
            Some("down") => Some("volumedown"),
            Some("mute") => Some("volumemute"),
            _ => None,
        },
        _ => None,
    }
}

pub(super) async fn media_control(
    automation: &dyn Automation,
    settings: &HandlerSettings,
    params: &IntentParams,
) -> Result<ExecutionResult, HandlerError> {
    let action = require_str(params, "action")?.to_lowercase();
    let app = param_str(params, "app");
    let media = param_str(params, "media");

    // "open spotify and play <something>": search inside the player.
    if let (Some(app), Some(media), "play") = (app, media, action.as_str()) {
        automation.launch_application(&application_command(app)).await?;
        settings.settle(4).await;
        automation.hotkey(&["ctrl", "l"]).await?;
        automation.type_text(media, TYPING_INTERVAL).await?;
        automation.press_key("enter").await?;
        return Ok(ExecutionResult::ok(format!("Playing '{}' in {}", media, app)));
    }

    let key = media_key(&action, media).ok_or_else(|| {
        HandlerError::invalid("action", format!("don't know how to '{}' media", action))
    })?;
    if let Some(app) = app {
        automation.launch_application(&application_command(app)).await?;
        settings.settle(2).await;
    }
    automation.press_key(key).await?;

    let what = match (action.as_str(), media) {
        ("volume", Some(direction)) => format!("Volume {}", direction),
        _ => format!("Media {}", action),
    };
    Ok(ExecutionResult::ok(what).with_data(json!({ "key": key })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::automation::{Action, RecordingAutomation};
    use crate::core::handlers::testing;

    #[test]
    fn test_search_url_is_encoded() {
        let url = search_url("rust & tokio?").unwrap();
        assert_eq!(url.as_str(), "https://www.google.com/search?q=rust+%26+tokio%3F");
    }

    #[test]
    fn test_application_command_passthrough() {
        assert_eq!(application_command("Some Tool"), "some tool");
        assert!(!application_command("calculator").is_empty());
    }

    #[tokio::test]
    async fn test_browser_search_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let settings = testing::settings(dir.path());
        let automation = RecordingAutomation::new();
        let params = testing::params(&[("browser", "chrome".into()), ("query", "python tutorials".into())]);

        let result = browser_search(&automation, &settings, &params).await.unwrap();
        assert_eq!(result.message, "Searching for 'python tutorials' in chrome");
        let actions = automation.actions();
        assert_eq!(actions.len(), 4);
        assert!(matches!(actions[0], Action::Launch(_)));
        assert_eq!(actions[1], Action::Hotkey(vec!["ctrl".into(), "l".into()]));
        assert_eq!(
            actions[2],
            Action::Type("https://www.google.com/search?q=python+tutorials".into())
        );
        assert_eq!(actions[3], Action::Key("enter".into()));
    }

    #[tokio::test]
    async fn test_chat_types_but_does_not_send() {
        let dir = tempfile::tempdir().unwrap();
        let settings = testing::settings(dir.path());
        let automation = RecordingAutomation::new();
        let params = testing::params(&[("channel_or_user", "dev-team".into()), ("message", "standup".into())]);

        let result = send_chat(&automation, &settings, ChatApp::Discord, &params).await.unwrap();
        assert!(result.message.contains("not sent"));
        let actions = automation.actions();
        assert_eq!(actions[1], Action::Hotkey(vec!["ctrl".into(), "k".into()]));
        assert_eq!(actions.last(), Some(&Action::Type("standup".into())));
        assert_eq!(
            actions.iter().filter(|a| **a == Action::Key("enter".into())).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_media_keys() {
        let dir = tempfile::tempdir().unwrap();
        let settings = testing::settings(dir.path());
        let automation = RecordingAutomation::new();

        let volume = testing::params(&[("action", "volume".into()), ("media", "up".into())]);
        assert_eq!(
            media_control(&automation, &settings, &volume).await.unwrap().message,
            "Volume up"
        );
        let next = testing::params(&[("action", "next".into())]);
        media_control(&automation, &settings, &next).await.unwrap();
        assert_eq!(
            automation.actions(),
            vec![Action::Key("volumeup".into()), Action::Key("nexttrack".into())]
        );

        let sideways = testing::params(&[("action", "volume".into()), ("media", "sideways".into())]);
        assert!(media_control(&automation, &settings, &sideways).await.is_err());
    }
}
