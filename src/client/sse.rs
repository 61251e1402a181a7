//! Incremental server-sent-events decoding.

/// Accumulates response bytes and yields complete `data:` payloads.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete event's data, skipping comment-only and data-less
    /// events such as keep-alives.
    pub fn next_data(&mut self) -> Option<String> {
        while let Some(event) = drain_next_event(&mut self.buffer) {
            let text = String::from_utf8_lossy(&event);
            if let Some(data) = extract_data(&text) {
                return Some(data);
            }
        }
        None
    }
}

/// Position and delimiter length of the first event boundary.
fn find_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n");
    let crlf = buffer.windows(4).position(|w| w == b"\r\n\r\n");
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a <= b { (a, 2) } else { (b, 4) }),
        (Some(a), None) => Some((a, 2)),
        (None, Some(b)) => Some((b, 4)),
        (None, None) => None,
    }
}

fn drain_next_event(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let (pos, delim_len) = find_event_boundary(buffer)?;
    let event = buffer[..pos].to_vec();
    buffer.drain(..pos + delim_len);
    Some(event)
}

/// Join the event's `data:` lines with newlines.
fn extract_data(event: &str) -> Option<String> {
    let mut data = String::new();
    let mut found = false;

    for line in event.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some(mut rest) = line.strip_prefix("data:") {
            if let Some(stripped) = rest.strip_prefix(' ') {
                rest = stripped;
            }
            if found {
                data.push('\n');
            }
            data.push_str(rest);
            found = true;
        }
    }

    found.then_some(data)
}
