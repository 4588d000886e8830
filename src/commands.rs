//! Outgoing API commands and the request/response dispatcher.
//!
//! Commands batch into Requests of up to [`MAX_COMMANDS`]; a command flagged
//! `batch_separately` always travels alone so a failure of the whole batch
//! cannot take unrelated commands down with it. A strict one-request-in-flight
//! discipline keeps side effects ordered across commands.
//!
//! Once a Request has been serialized it is frozen: retries transmit
//! byte-identical JSON under the same idempotency id, and the server
//! deduplicates by that id. Responses arrive as a bare error number or as an
//! array aligned 1:1 with the request's commands, streamed through the
//! [`crate::splitter`] so per-command completions fire as their slice of the
//! response closes.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::ApiError;
use crate::json::JsonScanner;
use crate::node::{Handle, handle_to_b64};
use crate::splitter::{FilterOutcome, JsonSplitter, SplitterState};

/// Commands batched into one request at most.
pub const MAX_COMMANDS: usize = 10_000;

/// Why an in-flight request is being abandoned for retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    NetworkFailure,
    ApiBusy,
    Abandoned,
}

/// Incremental JSON writer for command payloads.
///
/// Purely append-only: the caller opens the value, adds `"name":value`
/// arguments, and reads the accumulated string back.
#[derive(Debug, Default, Clone)]
pub struct JsonWriter {
    json: String,
}

impl JsonWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_comma(&mut self) {
        if let Some(last) = self.json.chars().last() {
            if last != '[' && last != '{' {
                self.json.push(',');
            }
        }
    }

    /// Opens a command object with its method tag.
    pub fn cmd(&mut self, method: &str) -> &mut Self {
        self.json.push_str("{\"a\":\"");
        self.json.push_str(method);
        self.json.push('"');
        self
    }

    pub fn arg(&mut self, name: &str, value: &str) -> &mut Self {
        self.add_comma();
        self.json.push('"');
        self.json.push_str(name);
        self.json.push_str("\":\"");
        self.json.push_str(&escape(value));
        self.json.push('"');
        self
    }

    pub fn arg_int(&mut self, name: &str, value: i64) -> &mut Self {
        self.add_comma();
        self.json.push('"');
        self.json.push_str(name);
        self.json.push_str("\":");
        self.json.push_str(&value.to_string());
        self
    }

    pub fn arg_handle(&mut self, name: &str, handle: Handle, size: usize) -> &mut Self {
        let encoded = handle_to_b64(handle, size);
        self.add_comma();
        self.json.push('"');
        self.json.push_str(name);
        self.json.push_str("\":\"");
        self.json.push_str(&encoded);
        self.json.push('"');
        self
    }

    pub fn arg_b64(&mut self, name: &str, data: &[u8]) -> &mut Self {
        use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
        let encoded = URL_SAFE_NO_PAD.encode(data);
        self.add_comma();
        self.json.push('"');
        self.json.push_str(name);
        self.json.push_str("\":\"");
        self.json.push_str(&encoded);
        self.json.push('"');
        self
    }

    pub fn begin_object(&mut self, name: &str) -> &mut Self {
        self.add_comma();
        self.json.push('"');
        self.json.push_str(name);
        self.json.push_str("\":{");
        self
    }

    pub fn end_object(&mut self) -> &mut Self {
        self.json.push('}');
        self
    }

    pub fn close(&mut self) -> &mut Self {
        self.json.push('}');
        self
    }

    pub fn as_str(&self) -> &str {
        &self.json
    }

    pub fn into_string(self) -> String {
        self.json
    }
}

/// Escapes quotes and backslashes; multi-byte sequences pass through.
fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out
}

/// Completion callback of a command: a scanner over the command's own slice
/// of the response, or the error number the server answered instead.
pub type CommandCompletion = Box<dyn FnMut(Result<&mut JsonScanner<'_>, ApiError>)>;

/// A single API call bundle.
pub struct Command {
    json: String,
    batch_separately: bool,
    completion: Option<CommandCompletion>,
}

impl Command {
    /// Wraps a serialized command object. The payload must be the complete
    /// `{"a":…}` object produced by [`JsonWriter`].
    pub fn new(payload: JsonWriter, completion: Option<CommandCompletion>) -> Self {
        Self {
            json: payload.into_string(),
            batch_separately: false,
            completion,
        }
    }

    /// Forces this command into its own request.
    pub fn batch_separately(mut self) -> Self {
        self.batch_separately = true;
        self
    }

    pub fn payload(&self) -> &str {
        &self.json
    }
}

/// Shared response-routing state the splitter filters mutate.
struct ResponseState {
    cmds: Vec<Command>,
    process_index: usize,
    seq_tag: Option<String>,
    stop_processing: bool,
}

impl ResponseState {
    /// Hands the next command its response. Completions are taken on first
    /// use, so replaying a response is a no-op.
    fn complete_next(&mut self, outcome: Result<&mut JsonScanner<'_>, ApiError>) {
        let index = self.process_index;
        self.process_index += 1;
        let Some(cmd) = self.cmds.get_mut(index) else {
            tracing::warn!(index, "response element without a matching command");
            return;
        };
        if let Some(mut completion) = cmd.completion.take() {
            completion(outcome);
        }
    }

    fn fail_all(&mut self, error: ApiError) {
        for cmd in &mut self.cmds {
            if let Some(mut completion) = cmd.completion.take() {
                completion(Err(error));
            }
        }
        self.process_index = self.cmds.len();
    }
}

/// An ordered batch of commands with frozen wire bytes.
pub struct Request {
    state: Rc<RefCell<ResponseState>>,
    splitter: JsonSplitter,
    filters_installed: bool,
    chunked_progress: usize,
    cached_json: Option<String>,
    cached_id: Option<String>,
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

impl Request {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(ResponseState {
                cmds: Vec::new(),
                process_index: 0,
                seq_tag: None,
                stop_processing: false,
            })),
            splitter: JsonSplitter::new(),
            filters_installed: false,
            chunked_progress: 0,
            cached_json: None,
            cached_id: None,
        }
    }

    pub fn add(&mut self, cmd: Command) {
        debug_assert!(self.cached_json.is_none(), "request already frozen");
        self.state.borrow_mut().cmds.push(cmd);
    }

    pub fn len(&self) -> usize {
        self.state.borrow().cmds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.borrow().cmds.is_empty()
    }

    /// Serializes the batch, freezing the bytes and the idempotency id. Every
    /// later call returns the identical pair, which is what makes retries
    /// safe against double-apply.
    pub fn serialize(&mut self, reqid: &mut ReqIdGen) -> (String, String) {
        if let (Some(json), Some(id)) = (&self.cached_json, &self.cached_id) {
            return (json.clone(), id.clone());
        }

        let mut json = String::from("[");
        {
            let state = self.state.borrow();
            for (i, cmd) in state.cmds.iter().enumerate() {
                if i > 0 {
                    json.push(',');
                }
                json.push_str(&cmd.json);
            }
        }
        json.push(']');

        let id = reqid.next_id();
        self.cached_json = Some(json.clone());
        self.cached_id = Some(id.clone());
        (json, id)
    }

    fn install_filters(&mut self) {
        if self.filters_installed {
            return;
        }
        self.filters_installed = true;

        // whole-response numeric error: every command fails with it
        let state = Rc::clone(&self.state);
        self.splitter.set_filter("#", move |scanner| {
            let error = ApiError(scanner.get_int());
            let mut state = state.borrow_mut();
            state.stop_processing = true;
            state.fail_all(error);
            FilterOutcome::Consumed
        });

        // object element: the common structured response
        let state = Rc::clone(&self.state);
        self.splitter.set_filter("[{", move |scanner| {
            state.borrow_mut().complete_next(Ok(scanner));
            scanner.consume_all();
            FilterOutcome::Consumed
        });

        // array element: either [seqtag, result] or a plain array result
        let state = Rc::clone(&self.state);
        self.splitter.set_filter("[[", move |scanner| {
            let mut state = state.borrow_mut();
            let mut probe = scanner.clone();
            if probe.enter_array() {
                let mut tag = String::new();
                let tagged = probe.remaining().first() == Some(&b'"')
                    && probe.store_object(Some(&mut tag))
                    && probe.remaining().first().is_some_and(|&b| b == b',');
                if tagged {
                    probe.pos += 1;
                    state.seq_tag = Some(tag);
                    state.complete_next(Ok(&mut probe));
                    scanner.consume_all();
                    return FilterOutcome::Consumed;
                }
            }
            state.complete_next(Ok(scanner));
            scanner.consume_all();
            FilterOutcome::Consumed
        });

        // string element
        let state = Rc::clone(&self.state);
        self.splitter.set_filter("[\"", move |scanner| {
            state.borrow_mut().complete_next(Ok(scanner));
            scanner.consume_all();
            FilterOutcome::Consumed
        });

        // numeric element: a per-command error code
        let state = Rc::clone(&self.state);
        self.splitter.set_filter("[#", move |scanner| {
            let error = ApiError(scanner.get_int());
            state.borrow_mut().complete_next(Err(error));
            FilterOutcome::Consumed
        });
    }

    /// Feeds response bytes as they arrive; returns consumed bytes the caller
    /// may discard.
    pub fn process_chunk(&mut self, chunk: &[u8]) -> usize {
        self.install_filters();
        let result = self.splitter.process_chunk(chunk);
        self.chunked_progress += result.consumed;

        if matches!(result.state, SplitterState::Failed) {
            tracing::error!("response parse failed, failing the whole request");
            self.state.borrow_mut().fail_all(ApiError::INTERNAL);
        }
        result.consumed
    }

    /// Processes a complete response body at once. A sentinel byte marks the
    /// end so a bare-number response parses without a trailing delimiter.
    pub fn process_response(&mut self, response: &[u8]) {
        let mut body = Vec::with_capacity(response.len() + 1);
        body.extend_from_slice(response);
        body.push(0);
        let consumed = self.process_chunk(&body);
        if !self.finished() && !self.failed() {
            tracing::error!(
                consumed,
                len = response.len(),
                "truncated response for request"
            );
            self.state.borrow_mut().fail_all(ApiError::INTERNAL);
        }
    }

    pub fn finished(&self) -> bool {
        self.splitter.has_finished()
    }

    pub fn failed(&self) -> bool {
        self.splitter.has_failed()
    }

    pub fn chunked_progress(&self) -> usize {
        self.chunked_progress
    }

    pub fn seq_tag(&self) -> Option<String> {
        self.state.borrow().seq_tag.clone()
    }

    /// Rewinds response processing for a byte-identical retry. Completions
    /// already delivered stay delivered; replayed elements become no-ops.
    fn rewind_for_retry(&mut self) {
        self.splitter.clear();
        self.chunked_progress = 0;
        let mut state = self.state.borrow_mut();
        state.process_index = 0;
        state.stop_processing = false;
    }

    /// Fails every command that has not completed yet.
    fn fail_all(&mut self, error: ApiError) {
        self.state.borrow_mut().fail_all(error);
    }

    fn clear(&mut self) {
        self.state.borrow_mut().cmds.clear();
        self.state.borrow_mut().process_index = 0;
        self.splitter.clear();
        self.filters_installed = false;
        self.chunked_progress = 0;
        self.cached_json = None;
        self.cached_id = None;
    }
}

/// Generator of 10-character idempotency ids: seeded randomness for the
/// prefix, a counter tail so consecutive requests differ predictably.
pub struct ReqIdGen {
    chars: [u8; 10],
}

const ID_ALPHABET: &[u8; 62] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

impl ReqIdGen {
    pub fn new() -> Self {
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x5eed);
        Self::with_seed(seed)
    }

    pub fn with_seed(seed: u64) -> Self {
        let mut chars = [0u8; 10];
        let mut x = seed | 1;
        for c in chars.iter_mut() {
            // xorshift step per character
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            *c = ID_ALPHABET[(x % ID_ALPHABET.len() as u64) as usize];
        }
        Self { chars }
    }

    /// Current id, then advance the counter tail.
    pub fn next_id(&mut self) -> String {
        let id = String::from_utf8_lossy(&self.chars).into_owned();
        for slot in self.chars.iter_mut().rev() {
            let at = ID_ALPHABET.iter().position(|&a| a == *slot).unwrap_or(0);
            if at + 1 < ID_ALPHABET.len() {
                *slot = ID_ALPHABET[at + 1];
                break;
            }
            *slot = ID_ALPHABET[0];
        }
        id
    }
}

impl Default for ReqIdGen {
    fn default() -> Self {
        Self::new()
    }
}

/// Client↔server request pipeline: batches outgoing commands, owns the
/// in-flight request, routes response bytes, retries with the frozen id.
pub struct RequestDispatcher {
    inflight: Request,
    nextreqs: VecDeque<Request>,
    inflight_fail_reason: Option<RetryReason>,
    reqid: ReqIdGen,
    last_seq_tag: Option<String>,
}

impl RequestDispatcher {
    pub fn new() -> Self {
        Self::with_reqid(ReqIdGen::new())
    }

    pub fn with_reqid(reqid: ReqIdGen) -> Self {
        Self {
            inflight: Request::new(),
            nextreqs: VecDeque::new(),
            inflight_fail_reason: None,
            reqid,
            last_seq_tag: None,
        }
    }

    /// Queues a command, opening a new batch at flush boundaries.
    pub fn add(&mut self, cmd: Command) {
        let needs_new = match self.nextreqs.back() {
            None => true,
            Some(last) => {
                cmd.batch_separately || last.len() >= MAX_COMMANDS || {
                    // a separately-batched request never grows
                    last.len() == 1
                        && last.state.borrow().cmds[0].batch_separately
                }
            }
        };
        if needs_new {
            self.nextreqs.push_back(Request::new());
        }
        self.nextreqs
            .back_mut()
            .expect("just ensured")
            .add(cmd);
    }

    /// Commands are waiting and nothing is in flight.
    pub fn ready_to_send(&self) -> bool {
        !self.nextreqs.is_empty() && self.inflight.is_empty()
    }

    /// True from first send until the response fully arrives, across retries.
    pub fn cmds_inflight(&self) -> bool {
        !self.inflight.is_empty()
    }

    /// Serialized bytes and idempotency id of the request to transmit. The
    /// same pair is returned while a retry is pending.
    pub fn server_request(&mut self) -> Option<(String, String)> {
        if self.inflight.is_empty() {
            self.inflight = self.nextreqs.pop_front()?;
        }
        self.inflight_fail_reason = None;
        Some(self.inflight.serialize(&mut self.reqid))
    }

    /// Feeds one chunk of the response; returns bytes consumed. The next call
    /// must start with the unconsumed remainder.
    pub fn server_chunk(&mut self, chunk: &[u8]) -> usize {
        if self.inflight.is_empty() {
            tracing::warn!(len = chunk.len(), "response chunk with nothing in flight");
            return 0;
        }
        let consumed = self.inflight.process_chunk(chunk);
        if self.inflight.finished() || self.inflight.failed() {
            self.finish_inflight();
        }
        consumed
    }

    /// Processes a complete, non-chunked response.
    pub fn server_response(&mut self, response: &[u8]) {
        if self.inflight.is_empty() {
            if !response.is_empty() {
                tracing::warn!(len = response.len(), "response with nothing in flight");
            }
            return;
        }
        self.inflight.process_response(response);
        self.finish_inflight();
    }

    /// Bytes of response consumed so far for chunked requests.
    pub fn chunked_progress(&self) -> usize {
        self.inflight.chunked_progress()
    }

    /// Abandons the current transmission; the next [`Self::server_request`]
    /// retransmits the identical bytes under the identical id.
    pub fn inflight_failure(&mut self, reason: RetryReason) {
        tracing::warn!(?reason, "in-flight request failed, will retry");
        self.inflight_fail_reason = Some(reason);
        self.inflight.rewind_for_retry();
    }

    /// The server rejected the whole batch: every command fails with the
    /// error and the next batch advances.
    pub fn server_error(&mut self, error: ApiError) {
        tracing::warn!(%error, "server reported request-level error");
        self.inflight.fail_all(error);
        self.inflight = Request::new();
    }

    /// Server-issued sequence tag of the last completed request, threaded to
    /// the action-packet stream for causal ordering.
    pub fn last_seq_tag(&self) -> Option<&str> {
        self.last_seq_tag.as_deref()
    }

    pub fn clear(&mut self) {
        self.inflight.clear();
        self.nextreqs.clear();
        self.inflight_fail_reason = None;
    }

    fn finish_inflight(&mut self) {
        if self.inflight.failed() {
            self.inflight.fail_all(ApiError::INTERNAL);
        } else {
            // commands the response never reached fail internally
            let mut state = self.inflight.state.borrow_mut();
            while state.process_index < state.cmds.len() {
                let index = state.process_index;
                state.process_index += 1;
                if let Some(mut completion) = state.cmds[index].completion.take() {
                    completion(Err(ApiError::INTERNAL));
                }
            }
        }
        if let Some(tag) = self.inflight.seq_tag() {
            self.last_seq_tag = Some(tag);
        }
        self.inflight = Request::new();
    }
}

impl Default for RequestDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(method: &str, log: &Rc<RefCell<Vec<String>>>) -> Command {
        let mut payload = JsonWriter::new();
        payload.cmd(method).close();
        let log = Rc::clone(log);
        let method = method.to_string();
        Command::new(
            payload,
            Some(Box::new(move |outcome| {
                let entry = match outcome {
                    Ok(scanner) => {
                        let mut value = String::new();
                        scanner.store_object(Some(&mut value));
                        format!("{method}: ok {value}")
                    }
                    Err(e) => format!("{method}: err {}", e.0),
                };
                log.borrow_mut().push(entry);
            })),
        )
    }

    #[test]
    fn writer_builds_command_payloads() {
        let mut w = JsonWriter::new();
        w.cmd("up")
            .arg("n", "file \"x\"")
            .arg_int("s", 42)
            .arg_handle("h", 7, 6)
            .close();
        assert_eq!(
            w.as_str(),
            format!(
                r#"{{"a":"up","n":"file \"x\"","s":42,"h":"{}"}}"#,
                handle_to_b64(7, 6)
            )
        );
    }

    #[test]
    fn serialize_freezes_bytes_and_id() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut request = Request::new();
        request.add(command("ug", &log));
        request.add(command("f", &log));

        let mut reqid = ReqIdGen::with_seed(7);
        let (json, id) = request.serialize(&mut reqid);
        assert_eq!(json, r#"[{"a":"ug"},{"a":"f"}]"#);
        assert_eq!(id.len(), 10);

        // frozen across calls, even though the generator advanced
        let (json2, id2) = request.serialize(&mut reqid);
        assert_eq!(json, json2);
        assert_eq!(id, id2);
    }

    #[test]
    fn batching_rules() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut dispatcher = RequestDispatcher::with_reqid(ReqIdGen::with_seed(1));
        dispatcher.add(command("a1", &log));
        dispatcher.add(command("a2", &log));
        dispatcher.add(command("solo", &log).batch_separately());
        dispatcher.add(command("a3", &log));

        assert_eq!(dispatcher.nextreqs.len(), 3);
        assert_eq!(dispatcher.nextreqs[0].len(), 2);
        assert_eq!(dispatcher.nextreqs[1].len(), 1);
        assert_eq!(dispatcher.nextreqs[2].len(), 1);
    }

    #[test]
    fn responses_route_to_commands_in_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut dispatcher = RequestDispatcher::with_reqid(ReqIdGen::with_seed(2));
        dispatcher.add(command("one", &log));
        dispatcher.add(command("two", &log));
        dispatcher.add(command("three", &log));

        dispatcher.server_request().unwrap();
        dispatcher.server_response(br#"[{"r":1},-9,"tok"]"#);

        assert_eq!(
            *log.borrow(),
            vec![
                "one: ok {\"r\":1}".to_string(),
                "two: err -9".to_string(),
                "three: ok tok".to_string(),
            ]
        );
        assert!(!dispatcher.cmds_inflight());
    }

    #[test]
    fn whole_response_error_fails_batch() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut dispatcher = RequestDispatcher::with_reqid(ReqIdGen::with_seed(3));
        dispatcher.add(command("one", &log));
        dispatcher.add(command("two", &log));

        dispatcher.server_request().unwrap();
        dispatcher.server_response(b"-3");

        assert_eq!(
            *log.borrow(),
            vec!["one: err -3".to_string(), "two: err -3".to_string()]
        );
    }

    #[test]
    fn chunked_response_with_retry_is_idempotent() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut dispatcher = RequestDispatcher::with_reqid(ReqIdGen::with_seed(4));
        dispatcher.add(command("one", &log));
        dispatcher.add(command("two", &log));

        let (json, id) = dispatcher.server_request().unwrap();
        let response = br#"[{"r":1},{"r":2}]"#;

        // first element arrives, then the connection dies
        let consumed = dispatcher.server_chunk(&response[..10]);
        assert!(consumed <= 10);
        assert_eq!(log.borrow().len(), 1);

        dispatcher.inflight_failure(RetryReason::NetworkFailure);
        let (json2, id2) = dispatcher.server_request().unwrap();
        assert_eq!(json, json2);
        assert_eq!(id, id2);

        // full replay: the first completion must not fire again
        dispatcher.server_response(response);
        assert_eq!(
            *log.borrow(),
            vec!["one: ok {\"r\":1}".to_string(), "two: ok {\"r\":2}".to_string()]
        );
    }

    #[test]
    fn seq_tags_thread_through() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut dispatcher = RequestDispatcher::with_reqid(ReqIdGen::with_seed(5));
        dispatcher.add(command("one", &log));

        dispatcher.server_request().unwrap();
        dispatcher.server_response(br#"[["st7",{"r":1}]]"#);

        assert_eq!(dispatcher.last_seq_tag(), Some("st7"));
        assert_eq!(*log.borrow(), vec!["one: ok {\"r\":1}".to_string()]);
    }

    #[test]
    fn server_error_advances_to_next_batch() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut dispatcher = RequestDispatcher::with_reqid(ReqIdGen::with_seed(6));
        dispatcher.add(command("one", &log));
        dispatcher.add(command("solo", &log).batch_separately());

        dispatcher.server_request().unwrap();
        dispatcher.server_error(ApiError(-18));
        assert_eq!(*log.borrow(), vec!["one: err -18".to_string()]);

        // the separately batched command is still waiting its turn
        assert!(dispatcher.ready_to_send());
        dispatcher.server_request().unwrap();
        dispatcher.server_response(br#"[{"done":1}]"#);
        assert_eq!(log.borrow().last().unwrap(), "solo: ok {\"done\":1}");
    }

    #[test]
    fn unanswered_commands_fail_internally() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut dispatcher = RequestDispatcher::with_reqid(ReqIdGen::with_seed(8));
        dispatcher.add(command("one", &log));
        dispatcher.add(command("two", &log));

        dispatcher.server_request().unwrap();
        // the server only answered the first command
        dispatcher.server_response(br#"[{"r":1}]"#);
        assert_eq!(
            *log.borrow(),
            vec!["one: ok {\"r\":1}".to_string(), "two: err -1".to_string()]
        );
    }

    #[test]
    fn reqid_is_deterministic_per_seed_and_advances() {
        let mut a = ReqIdGen::with_seed(42);
        let mut b = ReqIdGen::with_seed(42);
        let first = a.next_id();
        assert_eq!(first, b.next_id());
        assert_ne!(first, a.next_id());
        assert!(first.bytes().all(|c| ID_ALPHABET.contains(&c)));
    }
}
