pub mod form;
pub mod session;

// Re-export common types
pub use form::{FormPortal, WebFormPortal};
pub use session::BrowserSession;
