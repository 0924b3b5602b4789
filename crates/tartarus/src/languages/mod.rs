//! Language profiles: build/run commands and execution image per language

pub mod c;
pub mod cpp;
pub mod go;
pub mod python;
pub mod rust;

use std::collections::HashMap;

use agon_common::Language;

use crate::config::ImageOverrides;
use crate::error::SandboxError;

/// Static execution profile for one language.
///
/// Commands run with `/workspace` (the mounted workspace) as working
/// directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageProfile {
    pub language: Language,
    pub image: String,
    pub source_file: String,
    pub compile_command: Option<String>,
    pub run_command: String,
}

impl LanguageProfile {
    pub fn requires_compilation(&self) -> bool {
        self.compile_command.is_some()
    }
}

/// Registry of every supported language.
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    profiles: HashMap<Language, LanguageProfile>,
}

impl LanguageRegistry {
    pub fn new(images: &ImageOverrides) -> Self {
        let profiles = [
            cpp::profile(images.cpp.clone()),
            c::profile(images.c.clone()),
            rust::profile(images.rust.clone()),
            go::profile(images.go.clone()),
            python::profile(images.python.clone()),
        ]
        .into_iter()
        .map(|p| (p.language, p))
        .collect();

        Self { profiles }
    }

    /// Get the profile for a language
    pub fn profile(&self, language: Language) -> Result<&LanguageProfile, SandboxError> {
        self.profiles
            .get(&language)
            .ok_or(SandboxError::UnsupportedLanguage(language))
    }

    /// Distinct images used by the registered languages
    pub fn images(&self) -> Vec<String> {
        let mut images: Vec<String> = self.profiles.values().map(|p| p.image.clone()).collect();
        images.sort();
        images.dedup();
        images
    }
}

impl Default for LanguageRegistry {
    fn default() -> Self {
        Self::new(&ImageOverrides::default())
    }
}
