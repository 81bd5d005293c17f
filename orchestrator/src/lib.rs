#[macro_use]
extern crate serde;

mod aggregator;
mod config;
mod error;
mod ids;
mod key_creation;
mod keygen;
mod messaging;
mod mixing;
mod mixnet;
mod serde_base64;
mod status;
mod store;
mod votes;

pub mod simulator;

pub use aggregator::*;
pub use config::*;
pub use error::*;
pub use ids::*;
pub use key_creation::*;
pub use keygen::*;
pub use messaging::*;
pub use mixing::*;
pub use mixnet::*;
pub use serde_base64::*;
pub use status::*;
pub use store::*;
pub use votes::*;

#[cfg(test)]
mod tests;
