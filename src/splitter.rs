//! Streaming JSON splitter with path-keyed filters.
//!
//! `JsonSplitter` is a push-parser: network bytes arrive in arbitrary chunks
//! and callbacks fire as soon as the structure they subscribed to is complete,
//! without ever buffering a whole response. Filters are keyed by a short path
//! string describing the structural route to a value:
//!
//! - `{` — entered an object as the named value
//! - `[` — entered an array
//! - `"name` — string value at key `name` (empty name for array elements)
//! - `#name` — number value at key `name` (`#` alone is the bare-number
//!   response form servers use for errors)
//!
//! `{[a{` therefore matches each object inside the array `a` at the top
//! level — the action-packet shape.
//!
//! A few reserved paths hook the stream lifecycle: `""` fires once at stream
//! start, `<`/`>` at every chunk boundary, and `E` on a parse error just
//! before the splitter fails for good.
//!
//! Callbacks receive a [`JsonScanner`] positioned at the value (for closures:
//! at the opening brace, expected to consume exactly the closure) and answer
//! with a [`FilterOutcome`]. `Pause` suspends the stream: the caller keeps the
//! buffer and re-enters [`JsonSplitter::process_chunk`] later with the same
//! bytes (the tail may have grown), and the same callback fires again at the
//! same position. Byte accounting holds across calls: `consumed` bytes may be
//! purged and the remainder re-submitted with the next chunk appended.

use std::collections::BTreeMap;

use smallvec::SmallVec;

use crate::json::JsonScanner;

/// Answer returned by a streaming filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    /// The filter consumed its value; parsing continues.
    Consumed,
    /// Suspend parsing; re-enter later with the same buffer to retry.
    Pause,
    /// Irrecoverable: the whole response is failed.
    Fail,
}

/// Parser condition after a [`JsonSplitter::process_chunk`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitterState {
    /// Mid-document; feed more bytes when they arrive.
    Running,
    /// A filter paused the stream; nothing was consumed by this call.
    Paused,
    /// The document closed cleanly.
    Finished,
    /// Parse error or filter failure; the splitter stays failed until
    /// [`JsonSplitter::clear`].
    Failed,
}

/// Outcome of one `process_chunk` call.
#[derive(Debug, Clone, Copy)]
pub struct ChunkResult {
    /// Bytes of the input the caller may discard. The next call must start
    /// with the byte at this offset.
    pub consumed: usize,
    pub state: SplitterState,
}

type SplitFilter = Box<dyn FnMut(&mut JsonScanner<'_>) -> FilterOutcome>;

/// Reserved filter path: start of the whole stream.
pub const PATH_STREAM_START: &str = "";
/// Reserved filter path: before each chunk is processed.
pub const PATH_CHUNK_START: &str = "<";
/// Reserved filter path: after each chunk is processed.
pub const PATH_CHUNK_END: &str = ">";
/// Reserved filter path: bare-number (error) response.
pub const PATH_NUMERIC: &str = "#";
/// Reserved filter path: parse-error notification.
pub const PATH_ERROR: &str = "E";

/// Stateful push-parser carving a JSON byte stream into filtered values.
pub struct JsonSplitter {
    filters: BTreeMap<String, SplitFilter>,
    stack: SmallVec<[String; 8]>,
    path: String,
    last_name: String,
    /// 1 while a value may start, -1 right after a property name, 0 after a
    /// value completed. Closing a container is illegal at -1.
    expect_value: i8,
    /// Bytes scanned past the last consumption point, skipped on re-entry.
    pending: usize,
    /// Cursor and mark, kept only across a suspension.
    paused_pos: usize,
    paused_mark: usize,
    starting: bool,
    finished: bool,
    failed: bool,
    suspended: bool,
}

impl Default for JsonSplitter {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonSplitter {
    pub fn new() -> Self {
        Self {
            filters: BTreeMap::new(),
            stack: SmallVec::new(),
            path: String::new(),
            last_name: String::new(),
            expect_value: 1,
            pending: 0,
            paused_pos: 0,
            paused_mark: 0,
            starting: true,
            finished: false,
            failed: false,
            suspended: false,
        }
    }

    /// Registers (or replaces) the filter for a path.
    pub fn set_filter(
        &mut self,
        path: impl Into<String>,
        filter: impl FnMut(&mut JsonScanner<'_>) -> FilterOutcome + 'static,
    ) {
        self.filters.insert(path.into(), Box::new(filter));
    }

    /// Resets all parse state; registered filters survive.
    pub fn clear(&mut self) {
        self.stack.clear();
        self.path.clear();
        self.last_name.clear();
        self.expect_value = 1;
        self.pending = 0;
        self.paused_pos = 0;
        self.paused_mark = 0;
        self.starting = true;
        self.finished = false;
        self.failed = false;
        self.suspended = false;
    }

    pub fn has_finished(&self) -> bool {
        self.finished
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }

    pub fn is_starting(&self) -> bool {
        self.starting
    }

    fn run_boundary_filter(&mut self, path: &str) {
        if let Some(f) = self.filters.get_mut(path) {
            let mut scanner = JsonScanner::new(b"");
            if f(&mut scanner) == FilterOutcome::Fail {
                tracing::error!(path, "error in chunk boundary filter");
            }
        }
    }

    fn parse_error(&mut self, data: &[u8], pos: usize, what: &'static str) -> ChunkResult {
        tracing::error!(at = pos, "malformed JSON: {what}");
        if let Some(f) = self.filters.get_mut(PATH_ERROR) {
            let mut scanner = JsonScanner::new(&data[pos.min(data.len())..]);
            let _ = f(&mut scanner);
        }
        self.run_boundary_filter(PATH_CHUNK_END);
        self.failed = true;
        ChunkResult {
            consumed: 0,
            state: SplitterState::Failed,
        }
    }

    /// Scans forward through `data`, firing filters for every completed value
    /// whose path is subscribed. See the module docs for the buffer contract.
    pub fn process_chunk(&mut self, data: &[u8]) -> ChunkResult {
        if self.failed {
            return ChunkResult {
                consumed: 0,
                state: SplitterState::Failed,
            };
        }
        if self.finished {
            return ChunkResult {
                consumed: 0,
                state: SplitterState::Finished,
            };
        }

        let mut pos;
        let mut mark;
        if !self.suspended {
            self.run_boundary_filter(PATH_CHUNK_START);

            pos = self.pending;
            self.pending = 0;
            mark = 0;

            if self.starting {
                if let Some(f) = self.filters.get_mut(PATH_STREAM_START) {
                    let mut scanner = JsonScanner::new(b"");
                    if f(&mut scanner) == FilterOutcome::Fail {
                        return self.parse_error(data, pos, "stream start filter failed");
                    }
                }
                self.starting = false;
            }
        } else {
            self.suspended = false;
            pos = self.paused_pos;
            mark = self.paused_mark;
        }

        while pos < data.len() {
            let c = data[pos];
            match c {
                b'[' | b'{' => {
                    if self.expect_value == 0 {
                        return self.parse_error(data, pos, "unexpected object or array");
                    }

                    let mut entry = String::with_capacity(1 + self.last_name.len());
                    entry.push(c as char);
                    entry.push_str(&self.last_name);
                    self.path.push_str(&entry);
                    self.stack.push(entry);

                    if self.filters.contains_key(&self.path) {
                        // a filter watches this closure: mark its first byte
                        mark = pos;
                    }

                    pos += 1;
                    self.last_name.clear();
                    self.expect_value = i8::from(c == b'[');
                }
                b']' | b'}' => {
                    if self.expect_value < 0 {
                        return self.parse_error(data, pos, "premature closure");
                    }
                    let open = match self.stack.last() {
                        Some(entry) => entry.as_bytes()[0],
                        None => return self.parse_error(data, pos, "mismatched close"),
                    };
                    if (c == b']' && open != b'[') || (c == b'}' && open != b'{') {
                        return self.parse_error(data, pos, "mismatched close");
                    }

                    let saved_name = std::mem::take(&mut self.last_name);
                    pos += 1;

                    let key = if self.stack.len() == 1
                        && c == b'}'
                        && mark == 0
                        && data.starts_with(b"{\"err\":")
                    {
                        PATH_NUMERIC.to_string()
                    } else {
                        self.path.clone()
                    };

                    if let Some(f) = self.filters.get_mut(&key) {
                        let mut scanner = JsonScanner::new(&data[mark..pos]);
                        match f(&mut scanner) {
                            FilterOutcome::Pause => {
                                // reposition on the close so the same filter
                                // fires again on resume
                                pos -= 1;
                                self.last_name = saved_name;
                                self.suspended = true;
                                self.paused_pos = pos;
                                self.paused_mark = mark;
                                return ChunkResult {
                                    consumed: 0,
                                    state: SplitterState::Paused,
                                };
                            }
                            FilterOutcome::Fail => {
                                return self.parse_error(data, pos, "streaming filter failed");
                            }
                            FilterOutcome::Consumed => {
                                if self.path != "{" && scanner.pos != pos - mark {
                                    tracing::warn!(
                                        path = %key,
                                        unprocessed = pos - mark - scanner.pos,
                                        "filter left bytes unprocessed"
                                    );
                                }
                                mark = pos;
                            }
                        }
                    }

                    let popped = self.stack.pop().expect("checked above");
                    self.path.truncate(self.path.len() - popped.len());
                    self.expect_value = 0;

                    if self.stack.is_empty() {
                        debug_assert!(self.path.is_empty());
                        mark = pos;
                        self.finished = true;
                        break;
                    }
                }
                b',' => {
                    if self.expect_value != 0 {
                        return self.parse_error(data, pos, "stray comma");
                    }
                    if mark == pos {
                        mark += 1;
                    }
                    pos += 1;
                    self.expect_value =
                        i8::from(self.stack.last().is_some_and(|e| e.as_bytes()[0] == b'['));
                }
                b'"' => {
                    let Some(t) = str_end(data, pos) else {
                        // string spans the chunk boundary
                        break;
                    };

                    if self.expect_value != 0 {
                        let key = format!("{}\"{}", self.path, self.last_name);
                        if let Some(f) = self.filters.get_mut(&key) {
                            let mut scanner = JsonScanner::new(&data[pos..pos + t]);
                            match f(&mut scanner) {
                                FilterOutcome::Pause => {
                                    self.suspended = true;
                                    self.paused_pos = pos;
                                    self.paused_mark = mark;
                                    return ChunkResult {
                                        consumed: 0,
                                        state: SplitterState::Paused,
                                    };
                                }
                                FilterOutcome::Fail => {
                                    return self.parse_error(data, pos, "streaming filter failed");
                                }
                                FilterOutcome::Consumed => mark = pos + t,
                            }
                        }
                        pos += t;
                        self.expect_value = 0;
                        self.last_name.clear();
                    } else {
                        // property name needs at least one byte after it
                        if pos + t >= data.len() {
                            break;
                        }
                        if data[pos + t] != b':' {
                            return self.parse_error(data, pos, "no colon after property name");
                        }
                        self.last_name =
                            String::from_utf8_lossy(&data[pos + 1..pos + t - 1]).into_owned();
                        pos += t + 1;
                        self.expect_value = -1;
                    }
                }
                b'0'..=b'9' | b'.' | b'-' => {
                    if self.expect_value == 0 {
                        return self.parse_error(data, pos, "unexpected number");
                    }

                    let j = num_end(data, pos);
                    if pos + j >= data.len() {
                        // the number may continue in the next chunk
                        break;
                    }

                    if !self.stack.is_empty() {
                        let key = format!("{}#{}", self.path, self.last_name);
                        if let Some(f) = self.filters.get_mut(&key) {
                            let mut scanner = JsonScanner::new(&data[pos..pos + j]);
                            match f(&mut scanner) {
                                FilterOutcome::Pause => {
                                    self.suspended = true;
                                    self.paused_pos = pos;
                                    self.paused_mark = mark;
                                    return ChunkResult {
                                        consumed: 0,
                                        state: SplitterState::Paused,
                                    };
                                }
                                FilterOutcome::Fail => {
                                    return self.parse_error(data, pos, "streaming filter failed");
                                }
                                FilterOutcome::Consumed => mark = pos + j,
                            }
                        }
                        pos += j;
                        self.expect_value = 0;
                    } else {
                        // bare number: the whole response is an error code
                        pos += j;
                        self.expect_value = 0;
                        if mark == pos - j {
                            if let Some(f) = self.filters.get_mut(PATH_NUMERIC) {
                                let mut scanner = JsonScanner::new(&data[mark..pos]);
                                if f(&mut scanner) == FilterOutcome::Fail {
                                    return self.parse_error(data, pos, "error filter failed");
                                }
                            }
                        }
                        mark = pos;
                        self.finished = true;
                        break;
                    }
                }
                b' ' => {
                    // a concession to the API team's aesthetic sense
                    pos += 1;
                }
                _ => return self.parse_error(data, pos, "bogus character"),
            }
        }

        self.run_boundary_filter(PATH_CHUNK_END);

        self.pending = pos - mark;
        ChunkResult {
            consumed: mark,
            state: if self.finished {
                SplitterState::Finished
            } else {
                SplitterState::Running
            },
        }
    }
}

/// Length of the quoted string starting at `from` (both quotes included), or
/// `None` when the closing quote has not arrived yet.
fn str_end(data: &[u8], from: usize) -> Option<usize> {
    let mut i = from + 1;
    while i < data.len() {
        if data[i] == b'"' {
            let mut backslashes = 0;
            while i - backslashes > from + 1 && data[i - backslashes - 1] == b'\\' {
                backslashes += 1;
            }
            if backslashes % 2 == 0 {
                return Some(i + 1 - from);
            }
        }
        i += 1;
    }
    None
}

/// Length of the number run starting at `from`.
fn num_end(data: &[u8], from: usize) -> usize {
    let mut i = from;
    while i < data.len() && matches!(data[i], b'0'..=b'9' | b'-' | b'+' | b'e' | b'E' | b'.') {
        i += 1;
    }
    i - from
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    const STREAM: &[u8] = br#"{"w":"wss://x/","sn":"S1","a":[{"a":"u","n":"AAAAAAAA"}]}"#;

    fn collect_filters(
        splitter: &mut JsonSplitter,
        seen: &Rc<RefCell<Vec<(String, String)>>>,
    ) {
        for path in ["{[a{", "{\"w", "{\"sn"] {
            let seen = Rc::clone(seen);
            splitter.set_filter(path, move |scanner| {
                let mut value = String::new();
                scanner.store_object(Some(&mut value));
                seen.borrow_mut().push((path.to_string(), value));
                FilterOutcome::Consumed
            });
        }
    }

    #[test]
    fn whole_stream_at_once() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut splitter = JsonSplitter::new();
        collect_filters(&mut splitter, &seen);

        let result = splitter.process_chunk(STREAM);
        assert_eq!(result.consumed, STREAM.len());
        assert!(matches!(result.state, SplitterState::Finished));

        let seen = seen.borrow();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], ("{\"w".into(), "wss://x/".into()));
        assert_eq!(seen[1], ("{\"sn".into(), "S1".into()));
        assert_eq!(
            seen[2],
            ("{[a{".into(), r#"{"a":"u","n":"AAAAAAAA"}"#.into())
        );
    }

    #[test]
    fn four_byte_chunks_match_single_feed() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut splitter = JsonSplitter::new();
        collect_filters(&mut splitter, &seen);

        let mut buffer: Vec<u8> = Vec::new();
        for chunk in STREAM.chunks(4) {
            buffer.extend_from_slice(chunk);
            let result = splitter.process_chunk(&buffer);
            assert!(result.consumed <= buffer.len());
            buffer.drain(..result.consumed);
        }
        assert!(splitter.has_finished());

        let seen = seen.borrow();
        assert_eq!(seen.len(), 3);
        assert_eq!(
            seen[2],
            ("{[a{".into(), r#"{"a":"u","n":"AAAAAAAA"}"#.into())
        );
    }

    #[test]
    fn bare_number_fires_error_filter() {
        let value = Rc::new(RefCell::new(None));
        let mut splitter = JsonSplitter::new();
        {
            let value = Rc::clone(&value);
            splitter.set_filter(PATH_NUMERIC, move |scanner| {
                *value.borrow_mut() = Some(scanner.get_int());
                FilterOutcome::Consumed
            });
        }

        let result = splitter.process_chunk(b"-9,");
        assert!(matches!(result.state, SplitterState::Finished));
        assert_eq!(*value.borrow(), Some(-9));
    }

    #[test]
    fn err_object_fires_error_filter() {
        let value = Rc::new(RefCell::new(None));
        let mut splitter = JsonSplitter::new();
        {
            let value = Rc::clone(&value);
            splitter.set_filter(PATH_NUMERIC, move |scanner| {
                scanner.enter_object();
                assert_eq!(scanner.get_name_id(), crate::json::name_id("err"));
                *value.borrow_mut() = Some(scanner.get_int());
                FilterOutcome::Consumed
            });
        }

        let result = splitter.process_chunk(br#"{"err":-16}"#);
        assert!(matches!(result.state, SplitterState::Finished));
        assert_eq!(*value.borrow(), Some(-16));
    }

    #[test]
    fn pause_replays_same_callback_once() {
        let calls = Rc::new(RefCell::new(0));
        let mut splitter = JsonSplitter::new();
        {
            let calls = Rc::clone(&calls);
            splitter.set_filter("{[a{", move |scanner| {
                *calls.borrow_mut() += 1;
                if *calls.borrow() == 1 {
                    return FilterOutcome::Pause;
                }
                scanner.store_object(None);
                FilterOutcome::Consumed
            });
        }

        let result = splitter.process_chunk(STREAM);
        assert!(matches!(result.state, SplitterState::Paused));
        assert_eq!(result.consumed, 0);
        assert_eq!(*calls.borrow(), 1);

        let result = splitter.process_chunk(STREAM);
        assert!(matches!(result.state, SplitterState::Finished));
        assert_eq!(*calls.borrow(), 2);
    }

    #[test]
    fn numeric_array_elements_fire_scalar_filter() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut splitter = JsonSplitter::new();
        {
            let seen = Rc::clone(&seen);
            splitter.set_filter("[#", move |scanner| {
                seen.borrow_mut().push(scanner.get_int());
                FilterOutcome::Consumed
            });
        }

        let result = splitter.process_chunk(b"[-3,0,-9]");
        assert!(matches!(result.state, SplitterState::Finished));
        assert_eq!(*seen.borrow(), vec![-3, 0, -9]);
    }

    #[test]
    fn malformed_input_fails_and_notifies() {
        let notified = Rc::new(RefCell::new(false));
        let mut splitter = JsonSplitter::new();
        {
            let notified = Rc::clone(&notified);
            splitter.set_filter(PATH_ERROR, move |_| {
                *notified.borrow_mut() = true;
                FilterOutcome::Consumed
            });
        }

        let result = splitter.process_chunk(b"{]");
        assert!(matches!(result.state, SplitterState::Failed));
        assert!(*notified.borrow());
        assert!(splitter.has_failed());

        // failed splitters stay failed until cleared
        let result = splitter.process_chunk(b"{}");
        assert!(matches!(result.state, SplitterState::Failed));
        splitter.clear();
        let result = splitter.process_chunk(b"{}");
        assert!(matches!(result.state, SplitterState::Finished));
    }

    #[test]
    fn strings_split_across_chunks() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut splitter = JsonSplitter::new();
        {
            let seen = Rc::clone(&seen);
            splitter.set_filter("{\"w", move |scanner| {
                let mut v = String::new();
                scanner.store_object(Some(&mut v));
                seen.borrow_mut().push(v);
                FilterOutcome::Consumed
            });
        }

        let data = br#"{"w":"wss://host/path"}"#;
        let mut buffer: Vec<u8> = Vec::new();
        for chunk in data.chunks(7) {
            buffer.extend_from_slice(chunk);
            let result = splitter.process_chunk(&buffer);
            buffer.drain(..result.consumed);
        }
        assert_eq!(*seen.borrow(), vec!["wss://host/path".to_string()]);
    }
}
