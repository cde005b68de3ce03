mod driver;
mod protocol;
mod random;
mod registers;

pub use driver::VedirectDriver;
pub use protocol::VeDirect;
pub use random::{RandomDriver, RandomKind};
pub use registers::{registers_for_product, VeKind, VeRegisterDef};
