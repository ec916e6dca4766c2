// src/models/mod.rs

pub mod answer_paper;
pub mod question;
pub mod quiz;

/// A text column held a value outside of its enum.
#[derive(Debug, thiserror::Error)]
#[error("unknown {what}: '{value}'")]
pub struct UnknownVariant {
    what: &'static str,
    value: String,
}

impl UnknownVariant {
    pub fn new(what: &'static str, value: String) -> Self {
        Self { what, value }
    }
}
