use super::ContentLoader;
use crate::error::Result;

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "text", "log", "csv", "tsv", "ini", "cfg", "conf", "toml", "yaml", "yml", "xml",
    "html", "htm", "sql", "rs", "py", "js", "ts", "go", "java", "c", "h", "cpp", "sh",
];

/// Plain text loader; also the fallback when a structured loader fails
pub struct PlainTextLoader;

impl ContentLoader for PlainTextLoader {
    fn can_load(&self, extension: &str) -> bool {
        TEXT_EXTENSIONS.contains(&extension)
    }

    fn extract(&self, raw: &str, _path: &str) -> Result<String> {
        Ok(raw.trim_start_matches('\u{feff}').to_string())
    }
}
