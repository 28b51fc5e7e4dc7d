pub mod checkpoint;
pub mod manager;
pub mod transfer;

pub use checkpoint::*;
pub use manager::*;
pub use transfer::*;
