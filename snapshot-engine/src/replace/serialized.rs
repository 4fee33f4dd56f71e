//! PHP `serialize()` values as a tagged tree.
//!
//! String lengths in the format are byte counts, so any edit to a string
//! leaf has to go through parse, rewrite, serialize rather than a plain text
//! substitution.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    /// Integer digits as written.
    Int(String),
    /// Float text as written (`INF`, `NAN` and exponents included).
    Float(String),
    Str(Vec<u8>),
    Array(Vec<(Value, Value)>),
    Object {
        class: Vec<u8>,
        members: Vec<(Value, Value)>,
    },
    /// `r:` or `R:` back-reference.
    Ref { strong: bool, index: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub offset: usize,
    pub reason: &'static str,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at byte {}", self.reason, self.offset)
    }
}

impl std::error::Error for ParseError {}

/// Cheap shape check before attempting a full parse.
pub fn looks_serialized(data: &str) -> bool {
    let data = data.trim();
    if data == "N;" {
        return true;
    }
    let bytes = data.as_bytes();
    if bytes.len() < 4 || bytes[1] != b':' {
        return false;
    }
    match bytes[0] {
        b'a' | b'O' => data.ends_with('}'),
        b's' => data.ends_with("\";"),
        b'i' | b'd' | b'b' => data.ends_with(';'),
        _ => false,
    }
}

/// Parse a complete serialized value. Trailing bytes are an error.
pub fn parse(input: &[u8]) -> Result<Value, ParseError> {
    let mut parser = Parser { input, pos: 0 };
    let value = parser.value()?;
    if parser.pos != input.len() {
        return Err(parser.error("trailing data"));
    }
    Ok(value)
}

pub fn serialize(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_value(value, &mut out);
    out
}

impl Value {
    /// Replace `from` with `to` in every string leaf. Array keys and member
    /// names are left alone. Returns the number of leaves changed.
    pub fn replace_strings(&mut self, from: &[u8], to: &[u8]) -> usize {
        match self {
            Value::Str(bytes) => match replace_bytes(bytes, from, to) {
                Some(replaced) => {
                    *bytes = replaced;
                    1
                }
                None => 0,
            },
            Value::Array(entries) | Value::Object { members: entries, .. } => entries
                .iter_mut()
                .map(|(_, v)| v.replace_strings(from, to))
                .sum(),
            _ => 0,
        }
    }
}

/// Byte-level replace-all. `None` when `from` does not occur.
pub fn replace_bytes(haystack: &[u8], from: &[u8], to: &[u8]) -> Option<Vec<u8>> {
    if from.is_empty() || haystack.len() < from.len() {
        return None;
    }
    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;
    let mut found = false;
    while i < haystack.len() {
        if haystack[i..].starts_with(from) {
            out.extend_from_slice(to);
            i += from.len();
            found = true;
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    found.then_some(out)
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, reason: &'static str) -> ParseError {
        ParseError {
            offset: self.pos,
            reason,
        }
    }

    fn expect(&mut self, byte: u8) -> Result<(), ParseError> {
        if self.input.get(self.pos) == Some(&byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error("unexpected byte"))
        }
    }

    /// Bytes up to (not including) `terminator`, consuming the terminator.
    fn until(&mut self, terminator: u8) -> Result<&'a [u8], ParseError> {
        let input = self.input;
        let start = self.pos;
        let len = input[start..]
            .iter()
            .position(|b| *b == terminator)
            .ok_or_else(|| self.error("unterminated token"))?;
        self.pos = start + len + 1;
        Ok(&input[start..start + len])
    }

    fn number(&mut self, terminator: u8) -> Result<String, ParseError> {
        let raw = self.until(terminator)?;
        let text = std::str::from_utf8(raw).map_err(|_| self.error("non-ascii number"))?;
        let digits = text.strip_prefix(['-', '+']).unwrap_or(text);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(self.error("invalid integer"));
        }
        Ok(text.to_string())
    }

    fn length(&mut self, terminator: u8) -> Result<usize, ParseError> {
        self.number(terminator)?
            .parse()
            .map_err(|_| self.error("invalid length"))
    }

    fn quoted(&mut self, len: usize) -> Result<Vec<u8>, ParseError> {
        self.expect(b'"')?;
        let end = self.pos + len;
        if end > self.input.len() {
            return Err(self.error("string runs past end"));
        }
        let bytes = self.input[self.pos..end].to_vec();
        self.pos = end;
        self.expect(b'"')?;
        Ok(bytes)
    }

    fn entries(&mut self, count: usize) -> Result<Vec<(Value, Value)>, ParseError> {
        self.expect(b'{')?;
        let mut entries = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let key = self.value()?;
            if !matches!(key, Value::Int(_) | Value::Str(_)) {
                return Err(self.error("invalid array key"));
            }
            let value = self.value()?;
            entries.push((key, value));
        }
        self.expect(b'}')?;
        Ok(entries)
    }

    fn value(&mut self) -> Result<Value, ParseError> {
        let tag = *self
            .input
            .get(self.pos)
            .ok_or_else(|| self.error("unexpected end"))?;
        self.pos += 1;

        if tag == b'N' {
            self.expect(b';')?;
            return Ok(Value::Null);
        }
        self.expect(b':')?;

        match tag {
            b'b' => match self.until(b';')? {
                b"0" => Ok(Value::Bool(false)),
                b"1" => Ok(Value::Bool(true)),
                _ => Err(self.error("invalid boolean")),
            },
            b'i' => Ok(Value::Int(self.number(b';')?)),
            b'd' => {
                let raw = self.until(b';')?;
                let text = std::str::from_utf8(raw).map_err(|_| self.error("invalid float"))?;
                Ok(Value::Float(text.to_string()))
            }
            b's' => {
                let len = self.length(b':')?;
                let bytes = self.quoted(len)?;
                self.expect(b';')?;
                Ok(Value::Str(bytes))
            }
            b'a' => {
                let count = self.length(b':')?;
                Ok(Value::Array(self.entries(count)?))
            }
            b'O' => {
                let len = self.length(b':')?;
                let class = self.quoted(len)?;
                self.expect(b':')?;
                let count = self.length(b':')?;
                Ok(Value::Object {
                    class,
                    members: self.entries(count)?,
                })
            }
            b'r' | b'R' => Ok(Value::Ref {
                strong: tag == b'R',
                index: self.number(b';')?,
            }),
            _ => Err(self.error("unknown type tag")),
        }
    }
}

fn write_entries(entries: &[(Value, Value)], out: &mut Vec<u8>) {
    out.extend_from_slice(format!("{}:{{", entries.len()).as_bytes());
    for (key, value) in entries {
        write_value(key, out);
        write_value(value, out);
    }
    out.push(b'}');
}

fn write_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.extend_from_slice(b"N;"),
        Value::Bool(b) => out.extend_from_slice(if *b { b"b:1;" } else { b"b:0;" }),
        Value::Int(digits) => out.extend_from_slice(format!("i:{digits};").as_bytes()),
        Value::Float(text) => out.extend_from_slice(format!("d:{text};").as_bytes()),
        Value::Str(bytes) => {
            out.extend_from_slice(format!("s:{}:\"", bytes.len()).as_bytes());
            out.extend_from_slice(bytes);
            out.extend_from_slice(b"\";");
        }
        Value::Array(entries) => {
            out.extend_from_slice(b"a:");
            write_entries(entries, out);
        }
        Value::Object { class, members } => {
            out.extend_from_slice(format!("O:{}:\"", class.len()).as_bytes());
            out.extend_from_slice(class);
            out.extend_from_slice(b"\":");
            write_entries(members, out);
        }
        Value::Ref { strong, index } => {
            let tag = if *strong { 'R' } else { 'r' };
            out.extend_from_slice(format!("{tag}:{index};").as_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_serialize_preserve_bytes() {
        let inputs: [&[u8]; 5] = [
            b"a:2:{i:0;s:5:\"hello\";s:3:\"key\";a:1:{i:0;b:1;}}",
            b"O:8:\"stdClass\":2:{s:3:\"url\";s:15:\"http://old.test\";s:1:\"n\";d:0.5;}",
            b"a:2:{i:0;N;i:1;r:1;}",
            b"s:6:\"caf\xc3\xa9!\";",
            b"i:-42;",
        ];
        for input in inputs {
            let value = parse(input).unwrap();
            assert_eq!(serialize(&value), input.to_vec());
        }
    }

    #[test]
    fn test_replace_recomputes_lengths() {
        let mut value =
            parse(b"a:2:{s:4:\"home\";s:15:\"http://old.test\";s:15:\"http://old.test\";i:1;}").unwrap();
        assert_eq!(value.replace_strings(b"http://old.test", b"https://new.example"), 1);
        assert_eq!(
            serialize(&value),
            b"a:2:{s:4:\"home\";s:19:\"https://new.example\";s:15:\"http://old.test\";i:1;}".to_vec()
        );
    }

    #[test]
    fn test_nested_object_leaves_replaced() {
        let input = b"O:8:\"stdClass\":1:{s:5:\"links\";a:2:{i:0;s:16:\"http://old.test/\";i:1;s:3:\"foo\";}}";
        let mut value = parse(input).unwrap();
        assert_eq!(value.replace_strings(b"http://old.test", b"http://n.t"), 1);
        let out = String::from_utf8(serialize(&value)).unwrap();
        assert!(out.contains("s:11:\"http://n.t/\""));
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(parse(b"s:10:\"short\";").is_err());
        assert!(parse(b"a:1:{i:0;s:1:\"x\";").is_err());
        assert!(parse(b"i:1;extra").is_err());
        assert!(parse(b"x:1;").is_err());
    }

    #[test]
    fn test_looks_serialized() {
        assert!(looks_serialized("a:1:{i:0;s:1:\"x\";}"));
        assert!(looks_serialized("N;"));
        assert!(looks_serialized("s:1:\"x\";"));
        assert!(!looks_serialized("http://old.test"));
        assert!(!looks_serialized("a:"));
    }

    #[test]
    fn test_replace_bytes() {
        assert_eq!(replace_bytes(b"aXbX", b"X", b"yy"), Some(b"ayybyy".to_vec()));
        assert_eq!(replace_bytes(b"abc", b"X", b"y"), None);
        assert_eq!(replace_bytes(b"abc", b"", b"y"), None);
    }
}
