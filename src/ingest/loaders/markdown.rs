use super::ContentLoader;
use crate::error::Result;
use pulldown_cmark::{Event, Parser as CmarkParser, TagEnd};

/// Markdown loader: renders block structure to plain text paragraphs
pub struct MarkdownLoader;

fn flush_block(out: &mut String, block: &mut String) {
    let trimmed = block.trim();
    if !trimmed.is_empty() {
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(trimmed);
    }
    block.clear();
}

impl ContentLoader for MarkdownLoader {
    fn can_load(&self, extension: &str) -> bool {
        matches!(extension, "md" | "markdown")
    }

    fn extract(&self, raw: &str, _path: &str) -> Result<String> {
        let mut out = String::new();
        let mut block = String::new();

        for event in CmarkParser::new(raw) {
            match event {
                Event::Text(text) | Event::Code(text) => block.push_str(&text),
                Event::SoftBreak | Event::HardBreak => block.push('\n'),
                Event::End(TagEnd::TableCell) => block.push(' '),
                Event::End(
                    TagEnd::Paragraph
                    | TagEnd::Heading(_)
                    | TagEnd::CodeBlock
                    | TagEnd::Item
                    | TagEnd::TableHead
                    | TagEnd::TableRow,
                ) => flush_block(&mut out, &mut block),
                _ => {}
            }
        }
        flush_block(&mut out, &mut block);

        Ok(out)
    }
}
