pub mod dispatch;
pub mod engine;
pub mod message;
pub mod ordering;
pub mod peers;

pub use dispatch::*;
pub use engine::*;
pub use message::*;
pub use ordering::*;
pub use peers::*;
