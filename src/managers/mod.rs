// Extension host state managers
// Managers own persisted state: permission grants and the installed-extension registry.

pub mod extension_registry;
pub mod permission_manager;
