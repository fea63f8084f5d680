//! Errors raised by the callback registry.

use crate::hooks::CallbackKind;

/// Errors returned while registering callbacks or plugins.
///
/// None of these ever reach a database caller: the APM adapter swallows them
/// during registration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HookError {
    /// A callback with this name already exists in the processor.
    #[error("callback `{name}` is already registered on the {kind} processor")]
    DuplicateCallback { kind: CallbackKind, name: String },

    /// A plugin with this name was already installed on the connection.
    #[error("plugin `{0}` is already registered")]
    PluginRegistered(String),
}
