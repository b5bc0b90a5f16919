//! Line-protocol parser.
//!
//! Field literals are typed by shape:
//!
//! ```text
//! "..."                              string   (\" and \\ escapes)
//! -?[0-9]+i                          integer
//! t T true True TRUE                 boolean true
//! f F false False FALSE              boolean false
//! any other finite f64 literal       float
//! ```
//!
//! Measurement names, tag keys, tag values and field keys may escape `,`,
//! space and `=` with a backslash. Anything else is a malformed line.

use crate::error::{IngestError, Result};
use crate::protocol::{FieldValue, Measurement};

/// Parses one line without its `\n` terminator.
///
/// A trailing `\r` is ignored. Returns `Ok(None)` for blank lines and
/// `#` comments.
///
/// # Errors
///
/// Returns [`IngestError::MalformedLine`] describing the first problem.
pub fn parse_line(line: &[u8]) -> Result<Option<Measurement>> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let text = std::str::from_utf8(line)
        .map_err(|_| IngestError::MalformedLine("line is not valid UTF-8".to_string()))?;
    let trimmed = text.trim_start();
    if trimmed.trim_end().is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    let mut cursor = Cursor::new(trimmed.as_bytes());

    let (table, stop) = cursor.token(b", ")?;
    if table.is_empty() {
        return Err(malformed("empty measurement name"));
    }

    let mut tags = Vec::new();
    let mut stop = stop;
    while stop == Some(b',') {
        let (key, sep) = cursor.token(b"=, ")?;
        if sep != Some(b'=') || key.is_empty() {
            return Err(malformed(format!("tag {key:?} has no value")));
        }
        let (value, next) = cursor.token(b", =")?;
        if value.is_empty() || next == Some(b'=') {
            return Err(malformed(format!("bad value for tag {key:?}")));
        }
        tags.push((key, value));
        stop = next;
    }
    if stop != Some(b' ') {
        return Err(malformed("missing fields"));
    }

    let mut fields = Vec::new();
    loop {
        let (key, sep) = cursor.token(b"=, ")?;
        if sep != Some(b'=') || key.is_empty() {
            return Err(malformed(format!("field {key:?} has no value")));
        }
        let (value, next) = if cursor.peek() == Some(b'"') {
            let value = cursor.quoted()?;
            let next = cursor.next_byte();
            if !matches!(next, None | Some(b',') | Some(b' ')) {
                return Err(malformed(format!("text after quoted value of {key:?}")));
            }
            (FieldValue::Str(value), next)
        } else {
            let (raw, next) = cursor.token(b", ")?;
            (parse_literal(&key, &raw)?, next)
        };
        fields.push((key, value));
        match next {
            Some(b',') => continue,
            _ => {
                stop = next;
                break;
            }
        }
    }

    let timestamp = if stop == Some(b' ') {
        let rest = cursor.rest().trim();
        if rest.is_empty() {
            None
        } else {
            let nanos = rest
                .parse::<i64>()
                .map_err(|_| malformed(format!("bad timestamp {rest:?}")))?;
            Some(nanos)
        }
    } else {
        None
    };

    Ok(Some(Measurement {
        table,
        tags,
        fields,
        timestamp,
    }))
}

/// Types an unquoted field literal.
fn parse_literal(key: &str, raw: &str) -> Result<FieldValue> {
    match raw {
        "t" | "T" | "true" | "True" | "TRUE" => return Ok(FieldValue::Boolean(true)),
        "f" | "F" | "false" | "False" | "FALSE" => return Ok(FieldValue::Boolean(false)),
        _ => {}
    }

    if let Some(digits) = raw.strip_suffix('i') {
        return digits
            .parse::<i64>()
            .map(FieldValue::Integer)
            .map_err(|_| malformed(format!("bad integer {raw:?} for field {key:?}")));
    }

    let numeric_start = raw
        .bytes()
        .next()
        .is_some_and(|b| b.is_ascii_digit() || matches!(b, b'-' | b'+' | b'.'));
    match raw.parse::<f64>() {
        Ok(v) if numeric_start && v.is_finite() => Ok(FieldValue::Float(v)),
        _ => Err(malformed(format!("bad value {raw:?} for field {key:?}"))),
    }
}

fn malformed(reason: impl Into<String>) -> IngestError {
    IngestError::MalformedLine(reason.into())
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn next_byte(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn rest(&self) -> &'a str {
        // Callers only split at ASCII bytes, so the tail stays valid UTF-8.
        std::str::from_utf8(&self.bytes[self.pos..]).unwrap_or("")
    }

    /// Reads up to the first unescaped byte in `stops` and consumes it.
    ///
    /// Returns the unescaped token and the stop byte, or `None` at the end
    /// of the line.
    fn token(&mut self, stops: &[u8]) -> Result<(String, Option<u8>)> {
        let mut out = Vec::new();
        while let Some(b) = self.next_byte() {
            if stops.contains(&b) {
                return Ok((into_string(out)?, Some(b)));
            }
            if b == b'\\' {
                match self.peek() {
                    Some(next @ (b',' | b' ' | b'=' | b'\\')) => {
                        out.push(next);
                        self.pos += 1;
                    }
                    _ => out.push(b),
                }
            } else {
                out.push(b);
            }
        }
        Ok((into_string(out)?, None))
    }

    /// Reads a double-quoted string starting at the current position.
    fn quoted(&mut self) -> Result<String> {
        self.pos += 1;
        let mut out = Vec::new();
        while let Some(b) = self.next_byte() {
            match b {
                b'"' => return into_string(out),
                b'\\' => match self.peek() {
                    Some(next @ (b'"' | b'\\')) => {
                        out.push(next);
                        self.pos += 1;
                    }
                    _ => out.push(b),
                },
                _ => out.push(b),
            }
        }
        Err(malformed("unterminated string"))
    }
}

fn into_string(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|_| malformed("token is not valid UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Measurement {
        parse_line(line.as_bytes()).unwrap().unwrap()
    }

    fn parse_err(line: &str) -> String {
        match parse_line(line.as_bytes()) {
            Err(IngestError::MalformedLine(reason)) => reason,
            other => panic!("Expected MalformedLine for {:?}, got: {:?}", line, other),
        }
    }

    #[test]
    fn test_parse_weather_record() {
        let m = parse("weather,location=us-midwest temperature=82 1465839830100400200");
        assert_eq!(m.table, "weather");
        assert_eq!(
            m.tags,
            vec![("location".to_string(), "us-midwest".to_string())]
        );
        assert_eq!(
            m.fields,
            vec![("temperature".to_string(), FieldValue::Float(82.0))]
        );
        assert_eq!(m.timestamp, Some(1_465_839_830_100_400_200));
        assert_eq!(m.timestamp_micros(), Some(1_465_839_830_100_400));
    }

    #[test]
    fn test_parse_without_tags_or_timestamp() {
        let m = parse("cpu usage=0.5,cores=8i,ok=t,host=\"a b,c\"");
        assert!(m.tags.is_empty());
        assert_eq!(m.timestamp, None);
        assert_eq!(
            m.fields,
            vec![
                ("usage".to_string(), FieldValue::Float(0.5)),
                ("cores".to_string(), FieldValue::Integer(8)),
                ("ok".to_string(), FieldValue::Boolean(true)),
                ("host".to_string(), FieldValue::Str("a b,c".to_string())),
            ]
        );
    }

    #[test]
    fn test_literal_grammar() {
        let value = |raw: &str| parse(&format!("m v={raw}")).fields[0].1.clone();
        assert_eq!(value("-12i"), FieldValue::Integer(-12));
        assert_eq!(value("1e3"), FieldValue::Float(1000.0));
        assert_eq!(value("-0.5"), FieldValue::Float(-0.5));
        assert_eq!(value(".5"), FieldValue::Float(0.5));
        for t in ["t", "T", "true", "True", "TRUE"] {
            assert_eq!(value(t), FieldValue::Boolean(true));
        }
        for f in ["f", "F", "false", "False", "FALSE"] {
            assert_eq!(value(f), FieldValue::Boolean(false));
        }
        assert_eq!(
            value(r#""say \"hi\" \\ bye""#),
            FieldValue::Str(r#"say "hi" \ bye"#.to_string())
        );

        parse_err("m v=abc");
        parse_err("m v=1.5i");
        parse_err("m v=inf");
        parse_err("m v=NaN");
        parse_err("m v=tru");
    }

    #[test]
    fn test_escapes() {
        let m = parse(r"my\ table,tag\,key=a\ b\=c field\=x=1i");
        assert_eq!(m.table, "my table");
        assert_eq!(m.tags, vec![("tag,key".to_string(), "a b=c".to_string())]);
        assert_eq!(m.fields[0].0, "field=x");
    }

    #[test]
    fn test_crlf_and_blank_lines() {
        let m = parse("weather temperature=1 10\r");
        assert_eq!(m.timestamp, Some(10));
        assert!(parse_line(b"").unwrap().is_none());
        assert!(parse_line(b"\r").unwrap().is_none());
        assert!(parse_line(b"   ").unwrap().is_none());
        assert!(parse_line(b"# comment").unwrap().is_none());
    }

    #[test]
    fn test_malformed_lines() {
        assert!(parse_err("weather").contains("missing fields"));
        assert!(parse_err("weather,location temperature=1").contains("location"));
        assert!(parse_err("weather,location= temperature=1").contains("location"));
        assert!(parse_err("weather temperature").contains("temperature"));
        assert!(parse_err("weather temperature=1 abc").contains("timestamp"));
        assert!(parse_err("weather s=\"open").contains("unterminated"));
        assert!(parse_err("weather s=\"a\"b").contains("quoted"));
        assert!(parse_err(",tag=a v=1").contains("measurement"));
        parse_line(&[b'm', b' ', b'v', b'=', 0xFF]).unwrap_err();
    }
}
