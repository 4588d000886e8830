//! Linear non-validating JSON scanner.
//!
//! `JsonScanner` walks a byte span with an explicit cursor and extracts typed
//! values without building a document tree. It is deliberately non-strict:
//! malformed input yields default values and the caller layers its own shape
//! checks on top. This is the reader handed to streaming filters by the
//! [`crate::splitter`] module, positioned either at a scalar or at the opening
//! brace of a finished closure.
//!
//! Reads past the end of the span yield a `0` sentinel byte, so scans
//! terminate without bounds bookkeeping at every call site.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};

/// Sentinel for "no handle": all bits set.
pub const UNDEF_HANDLE: u64 = u64::MAX;

/// Packs up to eight ASCII characters into a 64-bit tag.
///
/// Short attribute and action names compare as integers instead of strings;
/// `name_id("fav")` is the key under which the favourite attribute lives.
pub fn name_id(name: &str) -> u64 {
    let mut id: u64 = 0;
    for &b in name.as_bytes() {
        id = id.wrapping_shl(8).wrapping_add(u64::from(b));
    }
    id
}

/// Forward-only cursor over an immutable JSON byte span.
#[derive(Clone)]
pub struct JsonScanner<'a> {
    buf: &'a [u8],
    /// Current scan position. Callers may reposition freely.
    pub pos: usize,
}

impl<'a> JsonScanner<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Byte at the cursor, or `0` past the end.
    fn byte(&self) -> u8 {
        self.byte_at(self.pos)
    }

    fn byte_at(&self, at: usize) -> u8 {
        self.buf.get(at).copied().unwrap_or(0)
    }

    /// Unscanned remainder of the span.
    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos.min(self.buf.len())..]
    }

    /// True once the cursor has passed the last byte.
    pub fn is_fully_consumed(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Moves the cursor past the end of the span.
    pub fn consume_all(&mut self) {
        self.pos = self.buf.len();
    }

    fn skip_separator(&mut self) {
        if matches!(self.byte(), b',' | b':') {
            self.pos += 1;
        }
    }

    /// True when the next value is a number (after an optional comma).
    pub fn is_numeric(&mut self) -> bool {
        if self.byte() == b',' {
            self.pos += 1;
        }
        let mut at = self.pos;
        if self.byte_at(at) == b'-' {
            at += 1;
        }
        self.byte_at(at).is_ascii_digit()
    }

    /// Copies the current value or balanced sub-closure, repositioning after
    /// it. String values are copied without their surrounding quotes. Returns
    /// `false` at the end of the enclosing container or on malformed input.
    pub fn store_object(&mut self, out: Option<&mut String>) -> bool {
        while self.byte() > 0 && self.byte() <= b' ' {
            self.pos += 1;
        }

        if matches!(self.byte(), b']' | b'}') {
            return false;
        }
        if self.byte() == b',' {
            self.pos += 1;
        }

        let start = self.pos;
        let mut at = self.pos;
        let mut open_square = 0i32;
        let mut open_curly = 0i32;

        loop {
            match self.byte_at(at) {
                b'[' => open_square += 1,
                b'{' => open_curly += 1,
                b']' => {
                    open_square -= 1;
                    if open_square < 0 {
                        return false;
                    }
                }
                b'}' => {
                    open_curly -= 1;
                    if open_curly < 0 {
                        return false;
                    }
                }
                b'"' => {
                    at += 1;
                    let mut escaped = false;
                    while self.byte_at(at) != 0 && (escaped || self.byte_at(at) != b'"') {
                        escaped = self.byte_at(at) == b'\\' && !escaped;
                        at += 1;
                    }
                    if self.byte_at(at) == 0 {
                        return false;
                    }
                }
                c if c.is_ascii_digit() || c == b'-' || c == b'.' => {
                    at += 1;
                    while matches!(self.byte_at(at), b'0'..=b'9' | b'.' | b'e' | b'E' | b'+' | b'-')
                    {
                        at += 1;
                    }
                    at -= 1;
                }
                b':' | b',' => {}
                _ => return false,
            }

            at += 1;

            if open_square == 0 && open_curly == 0 {
                if let Some(out) = out {
                    let raw = if self.byte_at(start) == b'"' {
                        &self.buf[start + 1..at - 1]
                    } else {
                        &self.buf[start..at]
                    };
                    out.clear();
                    out.push_str(&String::from_utf8_lossy(raw));
                }
                self.pos = at;
                return true;
            }
        }
    }

    /// Reads `"name":` and repositions past the separator, packing the name
    /// into a 64-bit tag. Empty-valued keys (`"x":,`) are skipped so callers
    /// always land on a real value; returns `0` at the end of the container.
    pub fn get_name_id(&mut self) -> u64 {
        let mut at = self.pos;
        if matches!(self.byte_at(at), b',' | b':') {
            at += 1;
        }

        if self.byte_at(at) != b'"' {
            return 0;
        }
        at += 1;

        let mut id: u64 = 0;
        while self.byte_at(at) != 0 && self.byte_at(at) != b'"' {
            id = id.wrapping_shl(8).wrapping_add(u64::from(self.byte_at(at)));
            at += 1;
        }
        if self.byte_at(at) != b'"' {
            return 0;
        }
        self.pos = at + 1;
        if matches!(self.byte(), b':' | b',') {
            self.pos += 1;
        }

        if id != 0 && self.skip_empty_value() {
            return self.get_name_id();
        }
        id
    }

    /// Skips empty values (`"x":,` / `"x":]` / `"x":}`) and literal `null`.
    fn skip_empty_value(&mut self) -> bool {
        match self.byte() {
            b',' => {
                self.pos += 1;
                true
            }
            b']' | b'}' => true,
            b'n' if self.remaining().starts_with(b"null") => {
                match self.byte_at(self.pos + 4) {
                    b',' => {
                        self.pos += 5;
                        true
                    }
                    b']' | b'}' => {
                        self.pos += 4;
                        true
                    }
                    _ => false,
                }
            }
            _ => false,
        }
    }

    /// Reads the next key name as a string, repositioning past `":"`.
    pub fn get_name(&mut self) -> String {
        let mut at = self.pos;
        if matches!(self.byte_at(at), b',' | b':') {
            at += 1;
        }

        let mut name = String::new();
        if self.byte_at(at) == b'"' {
            at += 1;
            while self.byte_at(at) != 0 && self.byte_at(at) != b'"' {
                name.push(self.byte_at(at) as char);
                at += 1;
            }
            self.pos = at + 2;
        }
        name
    }

    /// Matches and consumes a specific quoted string value.
    pub fn is(&mut self, value: &str) -> bool {
        if self.byte() == b',' {
            self.pos += 1;
        }
        if self.byte() != b'"' {
            return false;
        }
        let t = value.len();
        if self.buf.len() < self.pos + t + 2 {
            return false;
        }
        if &self.buf[self.pos + 1..self.pos + 1 + t] != value.as_bytes()
            || self.buf[self.pos + t + 1] != b'"'
        {
            return false;
        }
        self.pos += t + 2;
        true
    }

    /// Decodes the current Base64 string value into bytes; `None` when the
    /// cursor is not at a string. Accepts both alphabets, ignores padding.
    pub fn store_binary(&mut self) -> Option<Vec<u8>> {
        if self.byte() == b',' {
            self.pos += 1;
        }
        if self.byte() != b'"' {
            return None;
        }

        let start = self.pos + 1;
        let mut end = start;
        while self.byte_at(end) != 0 && self.byte_at(end) != b'"' {
            end += 1;
        }
        if self.byte_at(end) != b'"' {
            return None;
        }

        let normalized: Vec<u8> = self.buf[start..end]
            .iter()
            .filter(|&&b| b != b'=')
            .map(|&b| match b {
                b'+' => b'-',
                b'/' => b'_',
                other => other,
            })
            .collect();

        let decoded = URL_SAFE_NO_PAD.decode(&normalized).ok()?;
        self.store_object(None);
        Some(decoded)
    }

    /// True when the next value is a quoted handle of the given decoded width
    /// (6 bytes ⇒ 8 chars, anything else ⇒ 11 chars).
    pub fn is_handle(&mut self, size: usize) -> bool {
        let chars = if size == 6 { 8 } else { 11 };
        if self.byte() == b',' {
            self.pos += 1;
        }
        if self.byte() != b'"' {
            return false;
        }
        for i in 0..=chars {
            if self.byte_at(self.pos + i) == 0 {
                return false;
            }
        }
        self.byte_at(self.pos + chars + 1) == b'"'
    }

    /// Decodes a Base64 handle of 6 or 8 bytes into a 64-bit value, or
    /// [`UNDEF_HANDLE`] when the value does not decode to that width.
    pub fn get_handle(&mut self, size: usize) -> u64 {
        match self.store_binary() {
            Some(bytes) if bytes.len() == size => {
                let mut buf = [0u8; 8];
                buf[..size].copy_from_slice(&bytes);
                u64::from_le_bytes(buf)
            }
            _ => UNDEF_HANDLE,
        }
    }

    /// Decodes an integer value; `-1` on malformed input. Quoted numbers are
    /// accepted the way the servers occasionally send them.
    pub fn get_int(&mut self) -> i64 {
        self.skip_separator();

        let mut at = self.pos;
        if self.byte_at(at) == b'"' {
            at += 1;
        }
        if !self.byte_at(at).is_ascii_digit() && self.byte_at(at) != b'-' {
            tracing::error!("parse error (get_int)");
            return -1;
        }

        let negative = self.byte_at(at) == b'-';
        if negative {
            at += 1;
        }
        let mut value: i64 = 0;
        while self.byte_at(at).is_ascii_digit() {
            value = value
                .wrapping_mul(10)
                .wrapping_add(i64::from(self.byte_at(at) - b'0'));
            at += 1;
        }
        self.store_object(None);
        if negative { -value } else { value }
    }

    /// Decodes an unsigned 64-bit value; `u64::MAX` on malformed input.
    pub fn get_uint64(&mut self) -> u64 {
        self.skip_separator();

        let mut at = self.pos;
        if self.byte_at(at) == b'"' {
            at += 1;
        }
        if !self.byte_at(at).is_ascii_digit() {
            tracing::error!("parse error (get_uint64)");
            return u64::MAX;
        }
        let mut value: u64 = 0;
        while self.byte_at(at).is_ascii_digit() {
            value = value
                .wrapping_mul(10)
                .wrapping_add(u64::from(self.byte_at(at) - b'0'));
            at += 1;
        }
        self.store_object(None);
        value
    }

    /// Decodes a float value; `-1.0` on malformed input.
    pub fn get_float(&mut self) -> f64 {
        self.skip_separator();

        if !self.byte().is_ascii_digit() && self.byte() != b'-' && self.byte() != b'.' {
            tracing::error!("parse error (get_float)");
            return -1.0;
        }

        let mut end = self.pos;
        while matches!(self.byte_at(end), b'0'..=b'9' | b'.' | b'-' | b'+' | b'e' | b'E') {
            end += 1;
        }
        let text = std::str::from_utf8(&self.buf[self.pos..end]).unwrap_or("");
        let value = text.parse::<f64>().unwrap_or(-1.0);
        self.store_object(None);
        value
    }

    pub fn get_int32(&mut self) -> i32 {
        self.get_int() as i32
    }

    pub fn get_bool(&mut self) -> bool {
        self.get_int() != 0
    }

    /// Detects a bare numeric error value (`-N` or `0`), consuming it.
    pub fn numeric_error(&mut self) -> Option<i64> {
        let mut at = self.pos;
        if self.byte_at(at) == b',' {
            at += 1;
        }
        match self.byte_at(at) {
            b'0' => {}
            b'-' if matches!(self.byte_at(at + 1), b'1'..=b'9') => {}
            _ => return None,
        }
        self.pos = at;
        Some(self.get_int())
    }

    /// Tries to enter an array at the cursor.
    pub fn enter_array(&mut self) -> bool {
        self.skip_separator();
        if self.byte() == b'[' {
            self.pos += 1;
            return true;
        }
        false
    }

    /// Leaves an array; the cursor must be at its closing bracket.
    pub fn leave_array(&mut self) -> bool {
        if self.byte() == b']' {
            self.pos += 1;
            return true;
        }
        tracing::error!("parse error (leave_array)");
        false
    }

    /// Tries to enter an object at the cursor.
    pub fn enter_object(&mut self) -> bool {
        if self.byte() == b'}' {
            self.pos += 1;
        }
        if self.byte() == b',' {
            self.pos += 1;
        }
        if self.byte() == b'{' {
            self.pos += 1;
            return true;
        }
        false
    }

    /// Leaves an object, skipping any remaining members.
    pub fn leave_object(&mut self) -> bool {
        loop {
            match self.byte() {
                b':' | b',' | b' ' => self.pos += 1,
                b'"' | b'0'..=b'9' | b'-' | b'[' | b'{' => {
                    if !self.store_object(None) {
                        break;
                    }
                }
                b']' => {
                    tracing::error!("parse error (unexpected ']')");
                    self.pos += 1;
                }
                _ => break,
            }
        }
        if self.byte() == b'}' {
            self.pos += 1;
            return true;
        }
        tracing::error!("parse error (leave_object)");
        false
    }

    /// In-place JSON string unescaping, including `\uXXXX` BMP code points.
    pub fn unescape(s: &mut String) {
        if !s.contains('\\') {
            return;
        }
        let src = std::mem::take(s);
        let bytes = src.as_bytes();
        let mut out = String::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'\\' && i + 1 < bytes.len() {
                match bytes[i + 1] {
                    b'n' => {
                        out.push('\n');
                        i += 2;
                    }
                    b'r' => {
                        out.push('\r');
                        i += 2;
                    }
                    b'b' => {
                        out.push('\u{8}');
                        i += 2;
                    }
                    b'f' => {
                        out.push('\u{c}');
                        i += 2;
                    }
                    b't' => {
                        out.push('\t');
                        i += 2;
                    }
                    b'\\' => {
                        out.push('\\');
                        i += 2;
                    }
                    b'u' if i + 5 < bytes.len()
                        && bytes[i + 2..i + 6].iter().all(u8::is_ascii_hexdigit) =>
                    {
                        let hex = &src[i + 2..i + 6];
                        match u32::from_str_radix(hex, 16).ok().and_then(char::from_u32) {
                            Some(c) => out.push(c),
                            None => out.push('\u{fffd}'),
                        }
                        i += 6;
                    }
                    other => {
                        out.push(other as char);
                        i += 2;
                    }
                }
            } else {
                let c = src[i..].chars().next().unwrap();
                out.push(c);
                i += c.len_utf8();
            }
        }
        *s = out;
    }

    /// Emits a compact copy of `text`, dropping whitespace outside strings.
    pub fn strip_whitespace(text: &str) -> String {
        let mut reader = JsonScanner::new(text.as_bytes());
        let mut result = String::new();
        let mut temp = String::new();

        while reader.byte() != 0 {
            if reader.byte() == b'"' {
                result.push('"');
                if !reader.store_object(Some(&mut temp)) {
                    return result;
                }
                result.push_str(&temp);
                result.push('"');
            } else if (reader.byte() as char).is_ascii_whitespace() {
                reader.pos += 1;
            } else {
                result.push(reader.byte() as char);
                reader.pos += 1;
            }
        }
        result
    }

    /// Extracts the string value for a name anywhere in a JSON string.
    pub fn extract_string_value(json: &str, name: &str) -> Option<String> {
        let pattern = format!("{name}\":\"");
        let at = json.find(&pattern)?;
        let rest = &json[at + pattern.len()..];
        let end = rest.find('"')?;
        Some(rest[..end].to_string())
    }
}
