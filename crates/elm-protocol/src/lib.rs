pub mod dtc;
pub mod measurement;
pub mod protocol;
pub mod state;

pub use dtc::*;
pub use measurement::*;
pub use protocol::*;
pub use state::*;
