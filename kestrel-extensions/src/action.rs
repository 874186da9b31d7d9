//! Toolbar Action Surface
//!
//! Descriptors summarising an extension's script injection status for the
//! toolbar, and the provider seam the toolbar framework consumes. The
//! descriptors are derived data; rendering them is the toolbar's job.

extern crate alloc;

use alloc::string::{String, ToString};

use crate::manifest::ActionDecl;
use crate::{Extension, ExtensionId, PageId};

/// Script injection status of an extension on the current page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptStatus {
    /// No script is waiting and none has been approved.
    Blocked,
    /// At least one injection request is waiting for user consent.
    Pending,
    /// The extension has been granted consent for this page.
    Running,
}

/// What the toolbar should do after a click was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickAction {
    /// Nothing further.
    None,
    /// Open the extension's popup page.
    ShowPopup,
}

/// Derived toolbar descriptor for one extension.
///
/// Regenerable at any time from the gate's state plus the manifest; safe to
/// drop and recompute, never authoritative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionDescriptor {
    /// Extension this action belongs to.
    pub extension_id: ExtensionId,
    /// Tooltip title.
    pub title: String,
    /// Badge text overlaid on the icon.
    pub badge_text: String,
    /// Popup page opened on click, if any.
    pub popup: Option<String>,
    /// Injection status the descriptor reflects.
    pub status: ScriptStatus,
}

impl ActionDescriptor {
    /// Copy and normalise a declared toolbar action.
    pub fn normalized_from(
        extension: &Extension,
        decl: &ActionDecl,
        status: ScriptStatus,
    ) -> Self {
        Self {
            extension_id: extension.id.clone(),
            title: decl
                .default_title
                .clone()
                .unwrap_or_else(|| extension.manifest.name.clone()),
            badge_text: decl
                .default_badge_text
                .clone()
                .unwrap_or_else(|| Self::badge_for(status).to_string()),
            popup: decl.default_popup.clone(),
            status,
        }
    }

    /// Synthesise a default action for an extension that declared none.
    pub fn generated_for(extension: &Extension, status: ScriptStatus) -> Self {
        Self {
            extension_id: extension.id.clone(),
            title: extension.manifest.name.clone(),
            badge_text: Self::badge_for(status).to_string(),
            popup: None,
            status,
        }
    }

    /// Derive the descriptor for an extension, declared or not.
    pub fn derive(extension: &Extension, status: ScriptStatus) -> Self {
        match &extension.manifest.action {
            Some(decl) => Self::normalized_from(extension, decl, status),
            None => Self::generated_for(extension, status),
        }
    }

    fn badge_for(status: ScriptStatus) -> &'static str {
        match status {
            ScriptStatus::Pending => "!",
            ScriptStatus::Blocked | ScriptStatus::Running => "",
        }
    }
}

/// Source of toolbar actions for one page view.
///
/// The toolbar framework queries descriptors, forwards clicks, and relays
/// navigation and extension unload so the provider can drop per-page state.
pub trait ActionProvider {
    /// Current descriptor for the extension, or `None` if no action should
    /// be rendered at all.
    fn action_for_extension(&self, extension: &Extension) -> Option<ActionDescriptor>;

    /// A click on the extension's toolbar action.
    fn on_clicked(&self, extension: &Extension) -> ClickAction;

    /// The page view committed a navigation to a new document.
    fn on_navigated(&self, page: PageId);

    /// The extension was unloaded from the browser.
    fn on_extension_unloaded(&self, extension_id: &ExtensionId);
}
