mod origin;

pub use origin::{OriginError, OriginErrorExt, OriginGuard};
