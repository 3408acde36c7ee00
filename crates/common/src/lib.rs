// syncroom-common: wire protocol and shared types for syncroom crates

pub mod protocol;
pub mod types;
