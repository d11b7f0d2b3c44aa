mod app;
pub mod collection;
pub mod sink;

pub use app::{app, seeded, Upstream};
