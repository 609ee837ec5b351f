// apiforge-common: shared types for the apiforge sync workspace

pub mod protocol;
pub mod types;
