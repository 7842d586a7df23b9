//! Listing attributes and the pure steps that produce them.

pub mod attributes;
pub mod images;
pub mod ocr;
pub mod prompts;
pub mod provenance;
pub mod qc;
pub mod repair;
pub mod sanitize;
pub mod title;
pub mod voice;
