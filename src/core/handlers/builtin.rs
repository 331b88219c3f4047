use std::sync::Arc;

use async_trait::async_trait;

use super::{apps, desktop, files, HandlerError, HandlerSettings, IntentHandler};
use crate::core::automation::Automation;
use crate::core::intent::ExecutionResult;
use crate::core::params::IntentParams;

/// The closed set of handlers shipped with the assistant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    TakeScreenshot,
    ClickCoordinates,
    TypeText,
    OpenApplication,
    MinimizeWindow,
    SystemInformation,
    CreateFile,
    OpenFile,
    BrowserSearch,
    WhatsappMessage,
    TelegramMessage,
    DiscordMessage,
    FileOperations,
    MediaControl,
    EmailCompose,
}

impl HandlerKind {
    pub const ALL: [HandlerKind; 15] = [
        HandlerKind::TakeScreenshot,
        HandlerKind::ClickCoordinates,
        HandlerKind::TypeText,
        HandlerKind::OpenApplication,
        HandlerKind::MinimizeWindow,
        HandlerKind::SystemInformation,
        HandlerKind::CreateFile,
        HandlerKind::OpenFile,
        HandlerKind::BrowserSearch,
        HandlerKind::WhatsappMessage,
        HandlerKind::TelegramMessage,
        HandlerKind::DiscordMessage,
        HandlerKind::FileOperations,
        HandlerKind::MediaControl,
        HandlerKind::EmailCompose,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            HandlerKind::TakeScreenshot => "take_screenshot",
            HandlerKind::ClickCoordinates => "click_coordinates",
            HandlerKind::TypeText => "type_text",
            HandlerKind::OpenApplication => "open_application",
            HandlerKind::MinimizeWindow => "minimize_window",
            HandlerKind::SystemInformation => "system_information",
            HandlerKind::CreateFile => "create_file",
            HandlerKind::OpenFile => "open_file",
            HandlerKind::BrowserSearch => "browser_search",
            HandlerKind::WhatsappMessage => "whatsapp_message",
            HandlerKind::TelegramMessage => "telegram_message",
            HandlerKind::DiscordMessage => "discord_message",
            HandlerKind::FileOperations => "file_operations",
            HandlerKind::MediaControl => "media_control",
            HandlerKind::EmailCompose => "email_compose",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

#[derive(Debug)]
pub struct BuiltinHandler {
    kind: HandlerKind,
    settings: Arc<HandlerSettings>,
}

impl BuiltinHandler {
    pub fn new(kind: HandlerKind, settings: Arc<HandlerSettings>) -> Self {
        Self { kind, settings }
    }

    pub fn kind(&self) -> HandlerKind {
        self.kind
    }
}

#[async_trait]
impl IntentHandler for BuiltinHandler {
    async fn invoke(
        &self,
        automation: &dyn Automation,
        params: &IntentParams,
    ) -> Result<ExecutionResult, HandlerError> {
        let settings = self.settings.as_ref();
        match self.kind {
            HandlerKind::TakeScreenshot => desktop::take_screenshot(automation, settings, params).await,
            HandlerKind::ClickCoordinates => desktop::click_coordinates(automation, params).await,
            HandlerKind::TypeText => desktop::type_text(automation, params).await,
            HandlerKind::MinimizeWindow => desktop::minimize_window(automation, params).await,
            HandlerKind::SystemInformation => desktop::system_information(automation, params).await,
            HandlerKind::OpenApplication => apps::open_application(automation, settings, params).await,
            HandlerKind::BrowserSearch => apps::browser_search(automation, settings, params).await,
            HandlerKind::WhatsappMessage => {
                apps::send_chat(automation, settings, apps::ChatApp::WhatsApp, params).await
            }
            HandlerKind::TelegramMessage => {
                apps::send_chat(automation, settings, apps::ChatApp::Telegram, params).await
            }
            HandlerKind::DiscordMessage => {
                apps::send_chat(automation, settings, apps::ChatApp::Discord, params).await
            }
            HandlerKind::EmailCompose => apps::email_compose(automation, settings, params).await,
            HandlerKind::MediaControl => apps::media_control(automation, settings, params).await,
            HandlerKind::CreateFile => files::create_file(settings, params).await,
            HandlerKind::OpenFile => files::open_file(automation, settings, params).await,
            HandlerKind::FileOperations => files::file_operations(settings, params).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_round_trip() {
        for kind in HandlerKind::ALL {
            assert_eq!(HandlerKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(HandlerKind::from_name("unknown"), None);
    }
}
