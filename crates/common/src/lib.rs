// tether-common: shared types and wire shapes for the Tether workspace

pub mod events;
pub mod protocol;
pub mod types;
