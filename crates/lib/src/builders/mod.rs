//! Concrete builder implementations.

mod barrier;
mod command;
mod copy;
mod simple;

pub use barrier::Barrier;
pub use command::{CommandBuilder, SourceConversion};
pub use copy::CopyBuilder;
pub use simple::SimpleBuilder;
