pub mod message;

pub use message::{ConversationMessage, Role};
