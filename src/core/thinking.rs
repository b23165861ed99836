//! Separation of visible answer text from `<think>`-style reasoning spans.
//!
//! Models emit reasoning inline, wrapped in `<thinking>`, `<think>` or
//! `<redacted_reasoning>` tags. Tags routinely arrive split across network
//! reads (`"<thi"` + `"nk>"`), so the splitter holds back any suffix that could
//! still grow into a tag until the next chunk decides it.

const OPEN_TAGS: [&str; 3] = ["<thinking>", "<think>", "<redacted_reasoning>"];
const CLOSE_TAGS: [&str; 3] = ["</thinking>", "</think>", "</redacted_reasoning>"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Visible(String),
    ThinkingStarted,
    Thinking(String),
    ThinkingFinished,
}

/// Receiver for splitter output. Implemented for `Vec<Segment>` so callers
/// that only want the segments can collect them.
pub trait SegmentSink {
    fn visible(&mut self, text: &str);
    fn thinking_started(&mut self);
    fn thinking(&mut self, text: &str);
    fn thinking_finished(&mut self);
}

impl SegmentSink for Vec<Segment> {
    fn visible(&mut self, text: &str) {
        match self.last_mut() {
            Some(Segment::Visible(existing)) => existing.push_str(text),
            _ => self.push(Segment::Visible(text.to_string())),
        }
    }

    fn thinking_started(&mut self) {
        self.push(Segment::ThinkingStarted);
    }

    fn thinking(&mut self, text: &str) {
        match self.last_mut() {
            Some(Segment::Thinking(existing)) => existing.push_str(text),
            _ => self.push(Segment::Thinking(text.to_string())),
        }
    }

    fn thinking_finished(&mut self) {
        self.push(Segment::ThinkingFinished);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SplitterState {
    #[default]
    Normal,
    InsideThinking,
}

#[derive(Debug, Default)]
pub struct ThinkingSplitter {
    state: SplitterState,
    lookback: String,
}

impl ThinkingSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SplitterState {
        self.state
    }

    pub fn push<S: SegmentSink + ?Sized>(&mut self, chunk: &str, sink: &mut S) {
        self.lookback.push_str(chunk);

        loop {
            let tags: &[&str] = match self.state {
                SplitterState::Normal => &OPEN_TAGS,
                SplitterState::InsideThinking => &CLOSE_TAGS,
            };

            if let Some((start, len)) = find_first_tag(&self.lookback, tags) {
                let before = &self.lookback[..start];
                match self.state {
                    SplitterState::Normal => {
                        if !before.is_empty() {
                            sink.visible(before);
                        }
                        sink.thinking_started();
                        self.state = SplitterState::InsideThinking;
                    }
                    SplitterState::InsideThinking => {
                        if !before.is_empty() {
                            sink.thinking(before);
                        }
                        sink.thinking_finished();
                        self.state = SplitterState::Normal;
                    }
                }
                self.lookback.drain(..start + len);
                continue;
            }

            let keep = partial_tag_suffix_len(&self.lookback, tags);
            let emit_len = self.lookback.len() - keep;
            if emit_len > 0 {
                let emitted = &self.lookback[..emit_len];
                match self.state {
                    SplitterState::Normal => sink.visible(emitted),
                    SplitterState::InsideThinking => sink.thinking(emitted),
                }
                self.lookback.drain(..emit_len);
            }
            break;
        }
    }

    /// Flush whatever is held back. An unterminated reasoning span is closed.
    pub fn finish<S: SegmentSink + ?Sized>(&mut self, sink: &mut S) {
        let rest = std::mem::take(&mut self.lookback);
        match self.state {
            SplitterState::Normal => {
                if !rest.is_empty() {
                    sink.visible(&rest);
                }
            }
            SplitterState::InsideThinking => {
                if !rest.is_empty() {
                    sink.thinking(&rest);
                }
                sink.thinking_finished();
            }
        }
        self.state = SplitterState::Normal;
    }
}

fn find_first_tag(haystack: &str, tags: &[&str]) -> Option<(usize, usize)> {
    tags.iter()
        .filter_map(|tag| haystack.find(tag).map(|pos| (pos, tag.len())))
        .min_by_key(|(pos, _)| *pos)
}

/// Length of the longest suffix of `text` that is a proper prefix of a tag.
fn partial_tag_suffix_len(text: &str, tags: &[&str]) -> usize {
    let longest = tags.iter().map(|tag| tag.len()).max().unwrap_or(0);
    let max_len = longest.saturating_sub(1).min(text.len());
    (1..=max_len)
        .rev()
        .filter(|len| text.is_char_boundary(text.len() - len))
        .find(|len| {
            let suffix = &text[text.len() - len..];
            tags.iter().any(|tag| tag.starts_with(suffix))
        })
        .unwrap_or(0)
}

/// Result of a whole-content scan.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SplitContent {
    pub regular: String,
    pub thinking: String,
}

/// Re-scan a complete response. Regular text outside reasoning spans is
/// concatenated; when several spans exist the last one wins. Both parts are
/// trimmed.
pub fn split_thinking(content: &str) -> SplitContent {
    let mut regular = String::new();
    let mut thinking = String::new();
    let mut rest = content;

    loop {
        let Some((open_at, open_len)) = find_first_tag(rest, &OPEN_TAGS) else {
            regular.push_str(rest);
            break;
        };
        let after_open = &rest[open_at + open_len..];
        let Some((close_at, close_len)) = find_first_tag(after_open, &CLOSE_TAGS) else {
            regular.push_str(rest);
            break;
        };
        regular.push_str(&rest[..open_at]);
        thinking = after_open[..close_at].to_string();
        rest = &after_open[close_at + close_len..];
    }

    SplitContent {
        regular: regular.trim().to_string(),
        thinking: thinking.trim().to_string(),
    }
}
