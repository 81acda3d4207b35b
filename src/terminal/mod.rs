mod guard;
mod session;

pub use session::TerminalSession;
