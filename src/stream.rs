//! Splits a model's streamed output into "thinking" and "answer" segments.
//!
//! The parser is a two-state scanner (answer / thinking) with a small hold-back
//! buffer: when a chunk ends with the first few characters of a delimiter, those
//! characters are held until the next chunk decides whether they start the
//! delimiter or are plain text. The buffer never exceeds the longest delimiter
//! minus one character.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

pub const THINK_OPEN: &str = "<think>";
pub const THINK_CLOSE: &str = "</think>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SegmentKind {
    Thinking,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSegment {
    pub kind: SegmentKind,
    pub text: String,
    pub is_final: bool,
}

impl StreamSegment {
    fn new(kind: SegmentKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            is_final: false,
        }
    }
}

/// One parser per model invocation; not reusable after `finish`.
#[derive(Debug)]
pub struct StreamParser {
    open: String,
    close: String,
    in_thinking: bool,
    pending: String,
    answer: String,
    thinking: String,
    /// Thinking text of the span currently open.
    current_span: String,
    span_started: Option<Instant>,
    thinking_elapsed: Duration,
    finished: bool,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser {
    pub fn new() -> Self {
        Self::with_delimiters(THINK_OPEN, THINK_CLOSE)
    }

    pub fn with_delimiters(open: &str, close: &str) -> Self {
        Self {
            open: open.to_string(),
            close: close.to_string(),
            in_thinking: false,
            pending: String::new(),
            answer: String::new(),
            thinking: String::new(),
            current_span: String::new(),
            span_started: None,
            thinking_elapsed: Duration::ZERO,
            finished: false,
        }
    }

    /// Feed one raw chunk; returns the segments it completes.
    pub fn feed(&mut self, chunk: &str) -> Vec<StreamSegment> {
        let mut segments = Vec::new();
        if self.finished {
            return segments;
        }
        self.pending.push_str(chunk);

        loop {
            let delimiter = if self.in_thinking { &self.close } else { &self.open };
            match self.pending.find(delimiter.as_str()) {
                Some(pos) => {
                    let before: String = self.pending[..pos].to_string();
                    let rest_start = pos + delimiter.len();
                    self.pending.drain(..rest_start);
                    self.emit(before, &mut segments);
                    self.toggle();
                }
                None => {
                    let keep = partial_suffix_len(&self.pending, delimiter);
                    let flush_len = self.pending.len() - keep;
                    let flushed: String = self.pending.drain(..flush_len).collect();
                    self.emit(flushed, &mut segments);
                    break;
                }
            }
        }

        segments
    }

    /// Signal end of stream. A thinking span that never closed is turned into
    /// answer text so nothing the model produced is lost.
    pub fn finish(&mut self) -> Vec<StreamSegment> {
        let mut segments = Vec::new();
        if self.finished {
            return segments;
        }
        self.finished = true;

        let leftover = std::mem::take(&mut self.pending);
        if self.in_thinking {
            self.current_span.push_str(&leftover);
            self.close_span_timer();
            self.in_thinking = false;
            let recovered = std::mem::take(&mut self.current_span);
            self.answer.push_str(&recovered);
            segments.push(StreamSegment::new(SegmentKind::Answer, recovered));
        } else if !leftover.is_empty() {
            self.answer.push_str(&leftover);
            segments.push(StreamSegment::new(SegmentKind::Answer, leftover));
        }

        match segments.last_mut() {
            Some(last) => last.is_final = true,
            None => segments.push(StreamSegment {
                kind: SegmentKind::Answer,
                text: String::new(),
                is_final: true,
            }),
        }
        segments
    }

    /// Answer text so far (thinking excluded, unless recovered by `finish`).
    pub fn answer(&self) -> &str {
        &self.answer
    }

    /// All text seen inside closed or open thinking spans.
    pub fn thinking(&self) -> &str {
        &self.thinking
    }

    pub fn is_thinking(&self) -> bool {
        self.in_thinking
    }

    /// Total time spent inside thinking spans, including a span still open.
    pub fn thinking_duration(&self) -> Duration {
        let running = self.span_started.map(|s| s.elapsed()).unwrap_or_default();
        self.thinking_elapsed + running
    }

    pub fn into_answer(self) -> String {
        self.answer
    }

    fn emit(&mut self, text: String, segments: &mut Vec<StreamSegment>) {
        if text.is_empty() {
            return;
        }
        if self.in_thinking {
            self.thinking.push_str(&text);
            self.current_span.push_str(&text);
            segments.push(StreamSegment::new(SegmentKind::Thinking, text));
        } else {
            self.answer.push_str(&text);
            segments.push(StreamSegment::new(SegmentKind::Answer, text));
        }
    }

    fn toggle(&mut self) {
        if self.in_thinking {
            self.close_span_timer();
            self.current_span.clear();
            self.in_thinking = false;
        } else {
            self.span_started = Some(Instant::now());
            self.in_thinking = true;
        }
    }

    fn close_span_timer(&mut self) {
        if let Some(started) = self.span_started.take() {
            self.thinking_elapsed += started.elapsed();
        }
    }
}

/// Length of the longest proper prefix of `delimiter` that `text` ends with.
fn partial_suffix_len(text: &str, delimiter: &str) -> usize {
    let max = delimiter.len().saturating_sub(1).min(text.len());
    (1..=max)
        .rev()
        .find(|&k| delimiter.is_char_boundary(k) && text.ends_with(&delimiter[..k]))
        .unwrap_or(0)
}

/// Run a whole chunk sequence through a fresh parser.
pub fn parse_all<'a>(chunks: impl IntoIterator<Item = &'a str>) -> (Vec<StreamSegment>, String) {
    let mut parser = StreamParser::new();
    let mut segments = Vec::new();
    for chunk in chunks {
        segments.extend(parser.feed(chunk));
    }
    segments.extend(parser.finish());
    (segments, parser.into_answer())
}
