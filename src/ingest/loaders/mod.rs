pub mod json;
pub mod markdown;
pub mod plaintext;

use std::path::Path;

use crate::error::Result;

/// Turns raw file content into plain text for chunking
pub trait ContentLoader: Send + Sync {
    /// Check if this loader handles the given (lower-cased) extension
    fn can_load(&self, extension: &str) -> bool;

    /// Extract text from the raw file content
    fn extract(&self, raw: &str, path: &str) -> Result<String>;
}

/// Loader registry that selects a loader by extension
pub struct LoaderRegistry {
    loaders: Vec<Box<dyn ContentLoader>>,
}

impl LoaderRegistry {
    /// Registry with the built-in Markdown, JSON and plain text loaders
    pub fn new() -> Self {
        let mut registry = Self {
            loaders: Vec::new(),
        };
        registry.register(Box::new(markdown::MarkdownLoader));
        registry.register(Box::new(json::JsonLoader));
        registry.register(Box::new(plaintext::PlainTextLoader));
        registry
    }

    pub fn register(&mut self, loader: Box<dyn ContentLoader>) {
        self.loaders.push(loader);
    }

    pub fn find_loader(&self, extension: &str) -> Option<&dyn ContentLoader> {
        self.loaders
            .iter()
            .find(|l| l.can_load(extension))
            .map(|l| l.as_ref())
    }

    pub fn supports(&self, extension: &str) -> bool {
        self.find_loader(extension).is_some()
    }

    /// Read and extract a file.
    ///
    /// `Ok(None)` when no loader handles the extension. Read and decode errors
    /// are returned; a structured loader that rejects its input falls back to
    /// plain text.
    pub fn load(&self, path: &Path, extension: &str) -> Result<Option<String>> {
        let Some(loader) = self.find_loader(extension) else {
            return Ok(None);
        };

        let raw = std::fs::read_to_string(path)?;
        let display = path.display().to_string();
        match loader.extract(&raw, &display) {
            Ok(text) => Ok(Some(text)),
            Err(e) => {
                log::warn!(
                    "Loader failed for {} ({}), falling back to plain text: {}",
                    display,
                    extension,
                    e
                );
                plaintext::PlainTextLoader.extract(&raw, &display).map(Some)
            }
        }
    }
}

impl Default for LoaderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
