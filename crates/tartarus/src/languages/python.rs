//! Python language profile

use agon_common::Language;

use super::LanguageProfile;

/// Get profile for Python
pub fn profile(image: Option<String>) -> LanguageProfile {
    LanguageProfile {
        language: Language::Python,
        image: image.unwrap_or_else(|| "python:3.12-bookworm".to_string()),
        source_file: "solution.py".to_string(),
        compile_command: None,
        run_command: "python3 solution.py".to_string(),
    }
}
