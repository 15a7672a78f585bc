pub mod bootstrap;
pub mod entrypoints;
pub mod interpreter;
pub mod layout;
pub mod patch;
pub mod runtime;
