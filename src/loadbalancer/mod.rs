pub mod checksum;
pub mod render;
pub mod updater;

pub use render::Renderer;
pub use updater::{Updater, CHANGE_BUFFER};
