use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};

use crate::pipeline::{BoxError, ParsedDocument, Parser};

const PAGE_BREAK: char = '\u{000C}';

/// Plain UTF-8 text. Form feeds separate pages.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextParser;

#[async_trait]
impl Parser for TextParser {
    async fn parse(&self, path: &Path) -> Result<ParsedDocument, BoxError> {
        let path: PathBuf = path.to_path_buf();
        let bytes = tokio::task::spawn_blocking(move || std::fs::read(&path)).await??;

        let content = String::from_utf8(bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let pages = content.split(PAGE_BREAK).count() as u32;

        Ok(ParsedDocument {
            content,
            total_pages: Some(pages),
        })
    }
}
