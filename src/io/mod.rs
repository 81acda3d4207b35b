mod fd;
mod pipe;

pub use fd::{page_size, IoAction, OsFile};
pub use pipe::Pipe;
