//! Built-in tasks.
//!
//! Each one expresses its work purely through target capabilities, so it
//! behaves correctly whether the target applies, previews or renders.

mod command;
mod download;
mod file;
mod image;

pub use command::{CommandTask, CommandTaskBuilder};
pub use download::FetchAssetTask;
pub use file::{DirectoryTask, FileTask};
pub use image::LoadImageTask;
