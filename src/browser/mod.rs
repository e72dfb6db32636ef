pub mod chrome;
pub mod launcher;
pub mod surface;

pub use launcher::{BrowserLauncher, ConstructionGate, SurfaceProvider};
pub use surface::{BrowserSurface, ElementRef};
