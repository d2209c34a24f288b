//! Writers that persist metadata bus traffic into the durable stores

pub mod writers;

pub use writers::{LineageWriter, OpsWriter, RegistryWriter};
