//! Small shared helpers.

pub mod cmd;
