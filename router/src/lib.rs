pub mod board;
pub mod dispatch;
pub mod facts;
pub mod memory;

pub use board::{Board, BoardConfig, PostRejection};
pub use dispatch::{classify, MessageKind, Router, RouterConfig};
pub use facts::{Fact, FactStore, FactView};
pub use memory::{is_greeting, ConversationMemory, Turn};
