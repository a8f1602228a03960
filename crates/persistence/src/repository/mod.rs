//! File-backed stores

pub mod experience;
pub mod playbook;

pub use experience::*;
pub use playbook::*;
