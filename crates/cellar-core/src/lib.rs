//! Compatibility-tool lifecycle management: an async install queue that
//! downloads and unpacks release archives into the Steam tools directory,
//! an inventory of what is installed, a persisted settings store, and a
//! supervisor for the helper backend process.

pub mod error;
mod extract;
mod fetch;
mod hashing;
pub mod inventory;
pub mod queue;
pub mod release;
pub mod service;
pub mod settings;
pub mod supervisor;
mod vdf;

pub use error::{
    EnqueueError, FetchError, InstallError, InventoryError, ProcessLaunchError, SettingsError,
};
pub use inventory::InstalledTool;
pub use queue::{InstallQueue, InstallRequest, InstallStatus};
pub use release::{Release, ReleaseAsset, GZIP_CONTENT_TYPE};
pub use service::{Cellar, CellarConfig, ToolListing, ToolState};
pub use settings::SettingsStore;
pub use supervisor::Supervisor;
