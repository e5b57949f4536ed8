pub mod ping;
pub mod route;

pub use ping::*;
pub use route::*;
