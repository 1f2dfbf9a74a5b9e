pub mod dom;
pub mod interp;
pub mod ir;
pub mod numeric;
pub mod result;
pub mod secret;
pub mod seed;

pub use ir::Subroutine;
pub use numeric::Width;
pub use secret::{SecretPair, TimeSecret, WatermarkConfig};
