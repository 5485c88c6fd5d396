pub mod color;
pub mod composer;
pub mod library;
pub mod model;
pub mod patterns;
