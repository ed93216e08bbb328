// Provider loading and resolution
//
// The loader turns manifests on disk (or in a Git checkout) into validated
// LoadedProvider values; the registry owns them after load and resolves
// `(resource_type, operation, tags)` to a provider + workflow.

pub mod loader;
pub mod registry;

pub use loader::{GitProviderSource, LoadedProvider, ProviderLoader};
pub use registry::ProviderRegistry;
