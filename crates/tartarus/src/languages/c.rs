//! C language profile

use agon_common::Language;

use super::LanguageProfile;

/// Get profile for C
pub fn profile(image: Option<String>) -> LanguageProfile {
    LanguageProfile {
        language: Language::C,
        image: image.unwrap_or_else(|| "gcc:14".to_string()),
        source_file: "solution.c".to_string(),
        compile_command: Some("gcc -O2 -std=c11 -o solution solution.c -lm".to_string()),
        run_command: "./solution".to_string(),
    }
}
