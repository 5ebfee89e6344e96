//! Streaming stop-marker detection over decoded text.
//!
//! Generated text arrives one fragment at a time, and a marker such as
//! `<|im_end|>` is usually split across several fragments. [`StopBuffer`]
//! accumulates the text and releases only the portion that cannot be the
//! beginning of a marker, so a marker is never shown half-revealed.
//!
//! Detection assumes every marker starts with the same character (for
//! chat templates this is `<`) and that the character does not occur again
//! inside a marker. [`StopBuffer::new`] rejects marker sets that break either
//! assumption.

use crate::error::StopError;

/// Result of feeding one fragment into a [`StopBuffer`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopUpdate {
    /// Text that is now safe to show. May be empty.
    pub emit: String,
    /// A marker was found; the stream must end now.
    pub stopped: bool,
}

#[derive(Debug, Clone)]
pub struct StopBuffer {
    markers: Vec<String>,
    /// Byte length of the longest marker.
    longest: usize,
    lead: char,
    text: String,
    /// Byte length of the prefix of `text` already handed out.
    released: usize,
    stopped: bool,
}

impl StopBuffer {
    pub fn new<I, S>(markers: I) -> Result<Self, StopError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let markers: Vec<String> = markers.into_iter().map(Into::into).collect();
        let mut lead = None;
        for (i, marker) in markers.iter().enumerate() {
            let mut chars = marker.chars();
            let first = chars.next().ok_or(StopError::EmptyMarker(i))?;
            match lead {
                None => lead = Some(first),
                Some(l) if l != first => {
                    return Err(StopError::MixedLeadingChar { first: l, other: first })
                }
                Some(_) => {}
            }
            if chars.any(|c| c == first) {
                return Err(StopError::InteriorLeadChar { marker: marker.clone(), lead: first });
            }
        }
        let lead = lead.ok_or(StopError::NoMarkers)?;
        let longest = markers.iter().map(String::len).max().unwrap_or(0);
        Ok(Self { markers, longest, lead, text: String::new(), released: 0, stopped: false })
    }

    /// Feed the next decoded fragment.
    ///
    /// When the accumulated text contains a marker, the unreleased region is
    /// discarded and the buffer stays stopped for good.
    pub fn push(&mut self, fragment: &str) -> StopUpdate {
        if self.stopped {
            return StopUpdate { emit: String::new(), stopped: true };
        }
        self.text.push_str(fragment);

        let window = &self.text[self.scan_start()..];
        if self.markers.iter().any(|m| window.contains(m.as_str())) {
            self.stopped = true;
            return StopUpdate { emit: String::new(), stopped: true };
        }

        let pending = &self.text[self.released..];
        let safe_end = match pending.rfind(self.lead) {
            Some(i) if self.is_marker_prefix(&pending[i..]) => i,
            _ => pending.len(),
        };
        let emit = pending[..safe_end].to_string();
        self.released += safe_end;
        StopUpdate { emit, stopped: false }
    }

    /// Release whatever is still held back. Call once the stream has ended
    /// without hitting a marker.
    pub fn finish(&mut self) -> String {
        if self.stopped {
            return String::new();
        }
        let tail = self.text[self.released..].to_string();
        self.released = self.text.len();
        tail
    }

    /// Everything handed out so far.
    pub fn released_text(&self) -> &str {
        &self.text[..self.released]
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Earliest byte a not-yet-seen marker can start at. Anything older was
    /// already searched when it arrived.
    fn scan_start(&self) -> usize {
        let mut start = self.released.saturating_sub(self.longest.saturating_sub(1));
        while !self.text.is_char_boundary(start) {
            start -= 1;
        }
        start
    }

    fn is_marker_prefix(&self, tail: &str) -> bool {
        self.markers.iter().any(|m| m.starts_with(tail))
    }
}
