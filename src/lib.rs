pub mod cli;
pub mod error;
pub mod frame;
pub mod input;
pub mod layout;
pub mod linker;
pub mod reloc;
pub mod writer;

pub use linker::run;
