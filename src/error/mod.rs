pub mod decode;
pub mod generic;

pub use decode::DecodeError;
pub use generic::{CdcError, CdcResult};
