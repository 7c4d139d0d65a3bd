pub mod health_controller;
pub mod manifest_controller;
pub mod playback_controller;

pub use manifest_controller::ManifestController;
pub use playback_controller::PlaybackController;
