//! Rust language profile

use agon_common::Language;

use super::LanguageProfile;

/// Get profile for Rust
pub fn profile(image: Option<String>) -> LanguageProfile {
    LanguageProfile {
        language: Language::Rust,
        image: image.unwrap_or_else(|| "rust:1.85-bookworm".to_string()),
        source_file: "solution.rs".to_string(),
        compile_command: Some("rustc -O -o solution solution.rs".to_string()),
        run_command: "./solution".to_string(),
    }
}
