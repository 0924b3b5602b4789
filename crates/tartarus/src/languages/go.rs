//! Go language profile

use agon_common::Language;

use super::LanguageProfile;

/// Get profile for Go
pub fn profile(image: Option<String>) -> LanguageProfile {
    LanguageProfile {
        language: Language::Go,
        image: image.unwrap_or_else(|| "golang:1.23-bookworm".to_string()),
        source_file: "solution.go".to_string(),
        // Root filesystem is read-only; the build cache lives on the /tmp tmpfs.
        compile_command: Some(
            "GOCACHE=/tmp/go-cache go build -o solution solution.go".to_string(),
        ),
        run_command: "./solution".to_string(),
    }
}
