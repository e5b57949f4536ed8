pub mod backend;
pub mod correlate;
pub mod icmp;
pub mod process;
pub mod raw;
pub mod socket;

pub use backend::*;
pub use correlate::*;
pub use icmp::*;
pub use process::*;
pub use raw::*;
pub use socket::*;
