pub mod acharya_badrinath;
pub mod alagar_venkatesan;
pub mod collector;
pub mod coordinated_checkpointing;
pub mod strategy;

pub use acharya_badrinath::*;
pub use alagar_venkatesan::*;
pub use collector::*;
pub use coordinated_checkpointing::*;
pub use strategy::*;

use std::sync::Arc;

/// The snapshot algorithm a servent runs, kept concrete so its handlers can
/// reach algorithm specific state.
#[derive(Clone)]
pub enum Algorithm {
    AcharyaBadrinath(Arc<AcharyaBadrinath>),
    AlagarVenkatesan(Arc<AlagarVenkatesan>),
    CoordinatedCheckpointing(Arc<CoordinatedCheckpointing>),
}

impl Algorithm {
    pub fn strategy(&self) -> Arc<dyn SnapshotStrategy> {
        match self {
            Algorithm::AcharyaBadrinath(ab) => ab.clone(),
            Algorithm::AlagarVenkatesan(av) => av.clone(),
            Algorithm::CoordinatedCheckpointing(cc) => cc.clone(),
        }
    }
}
