pub mod checkpoints;
pub mod headers;

pub use checkpoints::{CheckPoint, RETARGETING_PERIOD};
pub use headers::{Blockchain, ChainError, HeaderReader, IndexedHeader};
