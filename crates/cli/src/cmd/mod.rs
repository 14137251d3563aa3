//! CLI command implementations

pub mod branch;
pub mod inspect;
pub mod jars;
pub mod maintenance;
pub mod recovery;
pub mod run;
pub mod secrets;
pub mod sync;
pub mod track;
