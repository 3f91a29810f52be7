mod assets;
mod health;

pub use assets::{index, serve_static};
pub use health::health_check;
