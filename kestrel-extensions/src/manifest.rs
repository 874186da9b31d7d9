//! Extension Manifest Model
//!
//! Trimmed manifest data used by the registry and the toolbar action
//! surface. Parsing from packed extension files happens elsewhere.

extern crate alloc;

use alloc::string::{String, ToString};
use alloc::vec::Vec;

/// Extension manifest.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    /// Extension name.
    pub name: String,
    /// Extension version.
    pub version: String,
    /// Description.
    pub description: Option<String>,
    /// Permissions.
    pub permissions: Vec<String>,
    /// Declared toolbar action.
    pub action: Option<ActionDecl>,
}

impl Manifest {
    /// Create a new manifest.
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            ..Default::default()
        }
    }

    /// Add a permission.
    pub fn add_permission(&mut self, permission: &str) {
        if !self.permissions.contains(&permission.to_string()) {
            self.permissions.push(permission.to_string());
        }
    }
}

/// Declared toolbar action (the manifest `action` key).
#[derive(Debug, Clone, Default)]
pub struct ActionDecl {
    /// Tooltip title.
    pub default_title: Option<String>,
    /// Popup page shown on click.
    pub default_popup: Option<String>,
    /// Badge text.
    pub default_badge_text: Option<String>,
}

impl ActionDecl {
    /// Whether clicking this action opens a popup.
    pub fn has_popup(&self) -> bool {
        self.default_popup.as_deref().is_some_and(|p| !p.is_empty())
    }
}
