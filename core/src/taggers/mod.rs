//! Concrete pattern taggers (component I extension point).

pub mod vector_body;

pub use vector_body::VectorBodyTagger;
