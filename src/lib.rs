pub mod bitcake;
pub mod broadcast;
pub mod common;
pub mod handler;
pub mod network;
pub mod snapshot;
