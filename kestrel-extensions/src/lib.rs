//! Kestrel Browser Extension System
//!
//! This crate provides the extension surface of the Kestrel browser that
//! deals with content script execution consent. Extensions that want to run
//! scripts on a page may need explicit user approval first; the
//! [`gate::InjectionGate`] tracks that approval per page view and defers
//! injection until it arrives.
//!
//! # Modules
//!
//! - `manifest`: Trimmed extension manifest model
//! - `action`: Toolbar action descriptors and the provider seam
//! - `gate`: Per-page-view script injection gating

#![no_std]

extern crate alloc;

pub mod action;
pub mod gate;
pub mod manifest;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use hashbrown::HashMap;
use spin::RwLock;

pub use action::{ActionDescriptor, ActionProvider, ClickAction, ScriptStatus};
pub use gate::{GateConfig, InjectionGate};

/// Extension ID (unique identifier).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExtensionId(pub String);

impl ExtensionId {
    /// Create a new extension ID.
    pub fn new(id: &str) -> Self {
        Self(id.into())
    }

    /// Get as string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Generate an ID from extension name (for development).
    pub fn from_name(name: &str) -> Self {
        let mut hash = 0u64;
        for b in name.bytes() {
            hash = hash.wrapping_mul(31).wrapping_add(b as u64);
        }
        Self(alloc::format!("{:032x}", hash))
    }
}

/// Identifier of one document/navigation instance of a page view.
///
/// A new one is minted on every committed navigation; state keyed by a page
/// ID must never outlive that navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId(pub u64);

/// Correlation token for an in-flight permission request from the script
/// injection runtime. Carried back on the reply, never stored by the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

/// Extension state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionState {
    /// Extension is disabled.
    Disabled,
    /// Extension is enabled and running.
    Enabled,
}

/// Loaded extension information.
#[derive(Debug, Clone)]
pub struct Extension {
    /// Extension ID.
    pub id: ExtensionId,
    /// Manifest data.
    pub manifest: manifest::Manifest,
    /// Current state.
    pub state: ExtensionState,
}

impl Extension {
    /// Create a new extension.
    pub fn new(id: ExtensionId, manifest: manifest::Manifest) -> Self {
        Self {
            id,
            manifest,
            state: ExtensionState::Disabled,
        }
    }

    /// Check if extension declares a permission.
    pub fn has_permission(&self, permission: &str) -> bool {
        self.manifest.permissions.iter().any(|p| p == permission)
    }
}

/// Extension registry.
///
/// Owns `Extension` values for the whole browser; every other component,
/// the injection gate included, refers to extensions by ID only.
pub struct ExtensionManager {
    /// Loaded extensions.
    extensions: RwLock<HashMap<ExtensionId, Extension>>,
    /// Event listeners.
    listeners: RwLock<Vec<ExtensionEventListener>>,
}

/// Extension event listener.
type ExtensionEventListener = Box<dyn Fn(&ExtensionEvent) + Send + Sync>;

/// Extension lifecycle event.
#[derive(Debug, Clone)]
pub enum ExtensionEvent {
    /// Extension installed.
    Installed(ExtensionId),
    /// Extension uninstalled.
    Uninstalled(ExtensionId),
    /// Extension enabled.
    Enabled(ExtensionId),
    /// Extension disabled.
    Disabled(ExtensionId),
}

impl ExtensionManager {
    /// Create a new extension manager.
    pub fn new() -> Self {
        Self {
            extensions: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Load an extension from its manifest.
    pub fn load_extension(
        &self,
        manifest: manifest::Manifest,
    ) -> Result<ExtensionId, ExtensionError> {
        let id = ExtensionId::from_name(&manifest.name);
        let extension = Extension::new(id.clone(), manifest);

        let mut extensions = self.extensions.write();
        if extensions.contains_key(&id) {
            return Err(ExtensionError::AlreadyInstalled);
        }

        extensions.insert(id.clone(), extension);
        drop(extensions);
        self.emit_event(ExtensionEvent::Installed(id.clone()));

        Ok(id)
    }

    /// Unload an extension.
    pub fn unload_extension(&self, id: &ExtensionId) -> Result<(), ExtensionError> {
        let removed = self.extensions.write().remove(id).is_some();
        if removed {
            self.emit_event(ExtensionEvent::Uninstalled(id.clone()));
            Ok(())
        } else {
            Err(ExtensionError::NotFound)
        }
    }

    /// Enable an extension.
    pub fn enable_extension(&self, id: &ExtensionId) -> Result<(), ExtensionError> {
        self.set_state(id, ExtensionState::Enabled, ExtensionEvent::Enabled(id.clone()))
    }

    /// Disable an extension.
    pub fn disable_extension(&self, id: &ExtensionId) -> Result<(), ExtensionError> {
        self.set_state(id, ExtensionState::Disabled, ExtensionEvent::Disabled(id.clone()))
    }

    fn set_state(
        &self,
        id: &ExtensionId,
        state: ExtensionState,
        event: ExtensionEvent,
    ) -> Result<(), ExtensionError> {
        let mut extensions = self.extensions.write();
        if let Some(ext) = extensions.get_mut(id) {
            ext.state = state;
            drop(extensions);
            self.emit_event(event);
            Ok(())
        } else {
            Err(ExtensionError::NotFound)
        }
    }

    /// Get an extension by ID.
    pub fn get_extension(&self, id: &ExtensionId) -> Option<Extension> {
        self.extensions.read().get(id).cloned()
    }

    /// Get enabled extensions.
    pub fn enabled_extensions(&self) -> Vec<Extension> {
        self.extensions
            .read()
            .values()
            .filter(|e| e.state == ExtensionState::Enabled)
            .cloned()
            .collect()
    }

    /// Add event listener.
    pub fn add_listener(&self, listener: ExtensionEventListener) {
        self.listeners.write().push(listener);
    }

    /// Emit event to listeners.
    fn emit_event(&self, event: ExtensionEvent) {
        for listener in self.listeners.read().iter() {
            listener(&event);
        }
    }
}

impl Default for ExtensionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Extension error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionError {
    /// Extension not found.
    NotFound,
    /// Extension already installed.
    AlreadyInstalled,
}
