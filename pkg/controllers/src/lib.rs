//! Background reconcilers.

pub mod queue;
pub mod sharedquota;
