//! Token-bounded, boundary-aware document chunking.
//!
//! The chunker prefers semantic boundaries (markdown headers, then blank-line
//! paragraphs) and accumulates sections greedily under a token budget. When a
//! chunk closes and another will follow, a tail of the closed chunk is carried
//! forward at the nearest natural break so context survives the boundary. A
//! single section that alone exceeds the budget is hard-split at the token
//! level into overlapping windows.
//!
//! Chunking never loses a document: any failure falls back to returning the
//! original, unchunked record.

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::model::{PageRecord, Placement, page_metadata};
use crate::tokenizer::Tokenizer;
use crate::types::SiftError;

/// Budgets controlling chunk size and boundary overlap.
#[derive(Clone, Debug)]
pub struct ChunkingConfig {
    /// Maximum tokens per chunk.
    pub max_tokens: usize,
    /// Target token length of the overlap carried into the next chunk. The
    /// actual overlap is clamped to whatever fits at the discovered break
    /// point.
    pub overlap_tokens: usize,
    /// How far back (in characters) to look for a natural break when
    /// building the overlap tail.
    pub overlap_window_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: 4000,
            overlap_tokens: 200,
            overlap_window_chars: 1000,
        }
    }
}

/// Splits one document's content into an ordered list of records.
#[derive(Clone, Debug)]
pub struct Chunker {
    tokenizer: Tokenizer,
    config: ChunkingConfig,
}

/// Natural break patterns tried in preference order when choosing where the
/// overlap tail starts.
const BREAK_PATTERNS: [&str; 4] = ["\n\n", ". ", ", ", " "];

impl Chunker {
    pub fn new(tokenizer: Tokenizer) -> Self {
        Self::with_config(tokenizer, ChunkingConfig::default())
    }

    pub fn with_config(tokenizer: Tokenizer, config: ChunkingConfig) -> Self {
        Self { tokenizer, config }
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Chunks a document's content.
    ///
    /// Returns a single unchanged document record when the content already
    /// fits within `max_tokens`. Otherwise returns the parent record (full
    /// content intact) followed by its chunks with contiguous indices. Any
    /// internal failure degrades to the unchunked document.
    pub fn chunk(&self, page: &PageRecord) -> Vec<PageRecord> {
        match self.try_chunk(page) {
            Ok(records) => records,
            Err(err) => {
                warn!(url = %page.url, error = %err, "chunking failed, keeping document unchunked");
                vec![self.unchunked(page)]
            }
        }
    }

    fn try_chunk(&self, page: &PageRecord) -> Result<Vec<PageRecord>, SiftError> {
        let content = page.content.as_str();
        if content.trim().is_empty() {
            return Ok(vec![self.unchunked(page)]);
        }
        if self.tokenizer.count(content) <= self.config.max_tokens {
            return Ok(vec![self.unchunked(page)]);
        }

        let sections = split_sections(content);
        let mut chunks: Vec<(String, usize)> = Vec::new();
        let mut current = String::new();
        let mut current_tokens = 0usize;

        for section in sections {
            let section_tokens = self.tokenizer.count(&section);

            // A single oversized section cannot be closed at a boundary;
            // flush the buffer and hard-split it at the token level.
            if section_tokens > self.config.max_tokens {
                if current_tokens > 0 {
                    chunks.push((std::mem::take(&mut current), current_tokens));
                    current_tokens = 0;
                }
                chunks.extend(self.hard_split(&section)?);
                continue;
            }

            let candidate = if current.is_empty() {
                section.clone()
            } else {
                format!("{current}\n\n{section}")
            };
            let candidate_tokens = self.tokenizer.count(&candidate);

            if current_tokens > 0 && candidate_tokens > self.config.max_tokens {
                let closed = std::mem::take(&mut current);
                let closed_tokens = current_tokens;

                // Seed the next chunk with an overlap tail when one fits.
                let tail = if closed_tokens > self.config.overlap_tokens {
                    self.overlap_tail(&closed)
                } else {
                    String::new()
                };
                chunks.push((closed, closed_tokens));

                if tail.is_empty() {
                    current = section;
                } else {
                    let seeded = format!("{tail}\n\n{section}");
                    if self.tokenizer.count(&seeded) <= self.config.max_tokens {
                        current = seeded;
                    } else {
                        current = section;
                    }
                }
            } else {
                current = candidate;
            }
            current_tokens = self.tokenizer.count(&current);
        }

        if !current.is_empty() {
            chunks.push((current, current_tokens));
        }

        // A lone chunk means the split was degenerate; keep the document whole.
        if chunks.len() <= 1 {
            return Ok(vec![self.unchunked(page)]);
        }

        debug!(url = %page.url, chunks = chunks.len(), "split document into chunks");

        let mut records = Vec::with_capacity(chunks.len() + 1);
        records.push(self.unchunked(page));
        for (index, (content, token_count)) in chunks.into_iter().enumerate() {
            records.push(PageRecord {
                url: PageRecord::chunk_url(&page.url, index),
                title: page.title.clone(),
                summary: page.summary.clone(),
                content,
                embedding: None,
                metadata: page_metadata(&page.url, token_count),
                placement: Placement::Chunk { index },
            });
        }
        Ok(records)
    }

    /// The parent record: content intact, placement `Document`, metadata
    /// recomputed from the URL and full token count.
    fn unchunked(&self, page: &PageRecord) -> PageRecord {
        let token_count = self.tokenizer.count(&page.content);
        let mut record = page.clone();
        record.placement = Placement::Document;
        record.metadata = page_metadata(&page.url, token_count);
        record
    }

    /// Token-level split of an oversized section: windows of `max_tokens`
    /// advancing by `max_tokens - overlap_tokens` until exhausted.
    fn hard_split(&self, section: &str) -> Result<Vec<(String, usize)>, SiftError> {
        let tokens = self.tokenizer.encode(section);
        let step = self
            .config
            .max_tokens
            .saturating_sub(self.config.overlap_tokens)
            .max(1);

        let mut windows = Vec::new();
        let mut start = 0usize;
        loop {
            let end = (start + self.config.max_tokens).min(tokens.len());
            let text = self.tokenizer.decode(&tokens[start..end])?;
            windows.push((text, end - start));
            if end >= tokens.len() {
                break;
            }
            start += step;
        }
        Ok(windows)
    }

    /// Picks the overlap tail from the end of a closed chunk: the text after
    /// the nearest natural break (paragraph, sentence, clause, whitespace —
    /// in that order) within the last `overlap_window_chars` characters.
    fn overlap_tail(&self, closed: &str) -> String {
        let window = tail_window(closed.trim_end(), self.config.overlap_window_chars);
        for pattern in BREAK_PATTERNS {
            if let Some(at) = window.rfind(pattern) {
                return window[at + pattern.len()..].trim_start().to_string();
            }
        }
        String::new()
    }
}

/// Splits content at markdown headers, keeping each header attached to the
/// text that follows it. Falls back to blank-line paragraphs when headers
/// yield fewer than two sections.
fn split_sections(content: &str) -> Vec<String> {
    static HEADER_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?m)^#{1,6}\s+\S.*$").expect("header regex"));

    let starts: Vec<usize> = HEADER_RE.find_iter(content).map(|m| m.start()).collect();
    let mut sections: Vec<String> = Vec::new();

    if !starts.is_empty() {
        if starts[0] > 0 {
            sections.push(content[..starts[0]].to_string());
        }
        for (i, &start) in starts.iter().enumerate() {
            let end = starts.get(i + 1).copied().unwrap_or(content.len());
            sections.push(content[start..end].to_string());
        }
        sections.retain(|section| !section.trim().is_empty());
        if sections.len() >= 2 {
            return sections;
        }
    }

    let paragraphs: Vec<String> = content
        .split("\n\n")
        .filter(|paragraph| !paragraph.trim().is_empty())
        .map(str::to_string)
        .collect();
    if paragraphs.is_empty() {
        vec![content.to_string()]
    } else {
        paragraphs
    }
}

/// Last `max_chars` characters of `s`, on a char boundary.
fn tail_window(s: &str, max_chars: usize) -> &str {
    if max_chars == 0 {
        return "";
    }
    match s.char_indices().rev().nth(max_chars - 1) {
        Some((start, _)) => &s[start..],
        None => s,
    }
}
