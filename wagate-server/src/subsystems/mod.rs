pub mod cache;
pub mod directory;
pub mod recovery;
pub mod registry;
pub mod supervisor;
