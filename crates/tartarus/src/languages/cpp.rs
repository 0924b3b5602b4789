//! C++ language profile

use agon_common::Language;

use super::LanguageProfile;

/// Get profile for C++
pub fn profile(image: Option<String>) -> LanguageProfile {
    LanguageProfile {
        language: Language::Cpp,
        image: image.unwrap_or_else(|| "gcc:14".to_string()),
        source_file: "solution.cpp".to_string(),
        compile_command: Some("g++ -O2 -std=c++17 -o solution solution.cpp".to_string()),
        run_command: "./solution".to_string(),
    }
}
