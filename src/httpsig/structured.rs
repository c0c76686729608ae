//! # Structured Field Values (RFC 8941)
//!
//! The subset of the structured-field grammar the message-signature verifier
//! consumes: dictionaries whose members are items or inner lists, with
//! parameters, over the bare item types Boolean, Integer, Decimal, String,
//! Token, and Byte Sequence.
//!
//! Canonical re-encoders are provided so the verifier can rebuild the
//! signature base from the parsed representation rather than the raw header
//! bytes: a signer who submitted sloppy-but-parseable input cannot smuggle
//! unintended bytes into what gets signed.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("malformed structured field at offset {offset}: {reason}")]
pub struct StructuredFieldError {
    pub offset: usize,
    pub reason: String,
}

/// A bare item (RFC 8941 §3.3).
#[derive(Debug, Clone, PartialEq)]
pub enum BareItem {
    Integer(i64),
    Decimal(f64),
    String(String),
    Token(String),
    ByteSequence(Vec<u8>),
    Boolean(bool),
}

impl BareItem {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            BareItem::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            BareItem::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BareItem::ByteSequence(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            BareItem::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

/// Ordered `key → bare item` parameters attached to items and inner lists.
pub type Parameters = Vec<(String, BareItem)>;

/// An item with its parameters (RFC 8941 §3.3).
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub value: BareItem,
    pub params: Parameters,
}

/// A parenthesized inner list with its parameters (RFC 8941 §3.1.1).
#[derive(Debug, Clone, PartialEq)]
pub struct InnerList {
    pub items: Vec<Item>,
    pub params: Parameters,
}

/// A dictionary member value.
#[derive(Debug, Clone, PartialEq)]
pub enum Member {
    Item(Item),
    InnerList(InnerList),
}

/// Ordered dictionary; duplicate keys keep the last occurrence (§4.2).
pub type Dictionary = Vec<(String, Member)>;

/// Parse a `Dictionary` header field value.
pub fn parse_dictionary(input: &str) -> Result<Dictionary, StructuredFieldError> {
    let mut parser = Parser::new(input);
    let dict = parser.parse_dictionary()?;
    Ok(dict)
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            bytes: input.as_bytes(),
            pos: 0,
        }
    }

    fn error(&self, reason: impl Into<String>) -> StructuredFieldError {
        StructuredFieldError {
            offset: self.pos,
            reason: reason.into(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek();
        if b.is_some() {
            self.pos += 1;
        }
        b
    }

    fn skip_sp(&mut self) {
        while self.peek() == Some(b' ') {
            self.pos += 1;
        }
    }

    fn skip_ows(&mut self) {
        while matches!(self.peek(), Some(b' ') | Some(b'\t')) {
            self.pos += 1;
        }
    }

    fn parse_dictionary(&mut self) -> Result<Dictionary, StructuredFieldError> {
        let mut dict: Dictionary = Vec::new();
        self.skip_sp();
        if self.peek().is_none() {
            return Ok(dict);
        }
        loop {
            let key = self.parse_key()?;
            let member = if self.peek() == Some(b'=') {
                self.pos += 1;
                self.parse_item_or_inner_list()?
            } else {
                // Bare key: boolean true with optional parameters.
                let params = self.parse_parameters()?;
                Member::Item(Item {
                    value: BareItem::Boolean(true),
                    params,
                })
            };
            // Duplicate keys: the last occurrence wins.
            dict.retain(|(k, _)| k != &key);
            dict.push((key, member));

            self.skip_ows();
            match self.bump() {
                None => return Ok(dict),
                Some(b',') => {
                    self.skip_ows();
                    if self.peek().is_none() {
                        return Err(self.error("trailing comma"));
                    }
                }
                Some(other) => {
                    return Err(self.error(format!("expected ',' but found {:?}", other as char)))
                }
            }
        }
    }

    fn parse_key(&mut self) -> Result<String, StructuredFieldError> {
        let start = self.pos;
        match self.peek() {
            Some(b'a'..=b'z') | Some(b'*') => self.pos += 1,
            _ => return Err(self.error("key must start with lcalpha or '*'")),
        }
        while let Some(b) = self.peek() {
            match b {
                b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-' | b'.' | b'*' => self.pos += 1,
                _ => break,
            }
        }
        Ok(String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned())
    }

    fn parse_item_or_inner_list(&mut self) -> Result<Member, StructuredFieldError> {
        if self.peek() == Some(b'(') {
            Ok(Member::InnerList(self.parse_inner_list()?))
        } else {
            Ok(Member::Item(self.parse_item()?))
        }
    }

    fn parse_inner_list(&mut self) -> Result<InnerList, StructuredFieldError> {
        self.pos += 1; // consume '('
        let mut items = Vec::new();
        loop {
            self.skip_sp();
            if self.peek() == Some(b')') {
                self.pos += 1;
                let params = self.parse_parameters()?;
                return Ok(InnerList { items, params });
            }
            if self.peek().is_none() {
                return Err(self.error("unterminated inner list"));
            }
            items.push(self.parse_item()?);
            match self.peek() {
                Some(b' ') | Some(b')') => {}
                _ => return Err(self.error("inner list items must be space-separated")),
            }
        }
    }

    fn parse_item(&mut self) -> Result<Item, StructuredFieldError> {
        let value = self.parse_bare_item()?;
        let params = self.parse_parameters()?;
        Ok(Item { value, params })
    }

    fn parse_parameters(&mut self) -> Result<Parameters, StructuredFieldError> {
        let mut params = Vec::new();
        while self.peek() == Some(b';') {
            self.pos += 1;
            self.skip_sp();
            let key = self.parse_key()?;
            let value = if self.peek() == Some(b'=') {
                self.pos += 1;
                self.parse_bare_item()?
            } else {
                BareItem::Boolean(true)
            };
            params.retain(|(k, _): &(String, BareItem)| k != &key);
            params.push((key, value));
        }
        Ok(params)
    }

    fn parse_bare_item(&mut self) -> Result<BareItem, StructuredFieldError> {
        match self.peek() {
            Some(b'-') | Some(b'0'..=b'9') => self.parse_number(),
            Some(b'"') => self.parse_string(),
            Some(b':') => self.parse_byte_sequence(),
            Some(b'?') => self.parse_boolean(),
            Some(b'A'..=b'Z') | Some(b'a'..=b'z') | Some(b'*') => self.parse_token(),
            _ => Err(self.error("invalid bare item")),
        }
    }

    fn parse_number(&mut self) -> Result<BareItem, StructuredFieldError> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        let digits_start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        let int_len = self.pos - digits_start;
        if int_len == 0 {
            return Err(self.error("number must contain a digit"));
        }
        if self.peek() == Some(b'.') {
            if int_len > 12 {
                return Err(self.error("decimal integer component too long"));
            }
            self.pos += 1;
            let frac_start = self.pos;
            while matches!(self.peek(), Some(b'0'..=b'9')) {
                self.pos += 1;
            }
            let frac_len = self.pos - frac_start;
            if frac_len == 0 || frac_len > 3 {
                return Err(self.error("decimal fraction must be 1 to 3 digits"));
            }
            let text = std::str::from_utf8(&self.bytes[start..self.pos])
                .map_err(|_| self.error("invalid number"))?;
            let value: f64 = text.parse().map_err(|_| self.error("invalid decimal"))?;
            Ok(BareItem::Decimal(value))
        } else {
            if int_len > 15 {
                return Err(self.error("integer too long"));
            }
            let text = std::str::from_utf8(&self.bytes[start..self.pos])
                .map_err(|_| self.error("invalid number"))?;
            let value: i64 = text.parse().map_err(|_| self.error("invalid integer"))?;
            Ok(BareItem::Integer(value))
        }
    }

    fn parse_string(&mut self) -> Result<BareItem, StructuredFieldError> {
        self.pos += 1; // consume '"'
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string")),
                Some(b'"') => return Ok(BareItem::String(out)),
                Some(b'\\') => match self.bump() {
                    Some(b'"') => out.push('"'),
                    Some(b'\\') => out.push('\\'),
                    _ => return Err(self.error("invalid string escape")),
                },
                Some(b) if (0x20..=0x7e).contains(&b) => out.push(b as char),
                Some(_) => return Err(self.error("invalid string character")),
            }
        }
    }

    fn parse_token(&mut self) -> Result<BareItem, StructuredFieldError> {
        let start = self.pos;
        self.pos += 1; // first char validated by caller
        while let Some(b) = self.peek() {
            let tchar = b.is_ascii_alphanumeric()
                || matches!(
                    b,
                    b'!' | b'#'
                        | b'$'
                        | b'%'
                        | b'&'
                        | b'\''
                        | b'*'
                        | b'+'
                        | b'-'
                        | b'.'
                        | b'^'
                        | b'_'
                        | b'`'
                        | b'|'
                        | b'~'
                        | b':'
                        | b'/'
                );
            if tchar {
                self.pos += 1;
            } else {
                break;
            }
        }
        Ok(BareItem::Token(
            String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned(),
        ))
    }

    fn parse_byte_sequence(&mut self) -> Result<BareItem, StructuredFieldError> {
        self.pos += 1; // consume ':'
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b == b':' {
                let encoded = &self.bytes[start..self.pos];
                self.pos += 1;
                let text =
                    std::str::from_utf8(encoded).map_err(|_| self.error("invalid base64"))?;
                let decoded = BASE64
                    .decode(text)
                    .map_err(|_| self.error("invalid base64"))?;
                return Ok(BareItem::ByteSequence(decoded));
            }
            if b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'=') {
                self.pos += 1;
            } else {
                return Err(self.error("invalid byte sequence character"));
            }
        }
        Err(self.error("unterminated byte sequence"))
    }

    fn parse_boolean(&mut self) -> Result<BareItem, StructuredFieldError> {
        self.pos += 1; // consume '?'
        match self.bump() {
            Some(b'0') => Ok(BareItem::Boolean(false)),
            Some(b'1') => Ok(BareItem::Boolean(true)),
            _ => Err(self.error("boolean must be ?0 or ?1")),
        }
    }
}

// ---- Canonical serialization (RFC 8941 §4.1) ---------------------------------

pub fn encode_bare_item(item: &BareItem) -> String {
    match item {
        BareItem::Integer(v) => v.to_string(),
        BareItem::Decimal(v) => {
            // Canonical form: at most three fractional digits, at least one.
            let rounded = (v * 1000.0).round() / 1000.0;
            let mut s = format!("{rounded:.3}");
            while s.ends_with('0') && !s.ends_with(".0") {
                s.pop();
            }
            s
        }
        BareItem::String(s) => {
            let mut out = String::with_capacity(s.len() + 2);
            out.push('"');
            for c in s.chars() {
                if c == '"' || c == '\\' {
                    out.push('\\');
                }
                out.push(c);
            }
            out.push('"');
            out
        }
        BareItem::Token(t) => t.clone(),
        BareItem::ByteSequence(b) => format!(":{}:", BASE64.encode(b)),
        BareItem::Boolean(true) => "?1".to_string(),
        BareItem::Boolean(false) => "?0".to_string(),
    }
}

pub fn encode_parameters(params: &Parameters) -> String {
    let mut out = String::new();
    for (key, value) in params {
        out.push(';');
        out.push_str(key);
        if value != &BareItem::Boolean(true) {
            out.push('=');
            out.push_str(&encode_bare_item(value));
        }
    }
    out
}

pub fn encode_item(item: &Item) -> String {
    format!(
        "{}{}",
        encode_bare_item(&item.value),
        encode_parameters(&item.params)
    )
}

pub fn encode_inner_list(list: &InnerList) -> String {
    let items: Vec<String> = list.items.iter().map(encode_item).collect();
    format!("({}){}", items.join(" "), encode_parameters(&list.params))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member<'d>(dict: &'d Dictionary, key: &str) -> &'d Member {
        &dict.iter().find(|(k, _)| k == key).unwrap().1
    }

    #[test]
    fn test_parse_signature_input_shape() {
        let dict = parse_dictionary(
            "sig1=(\"@request-target\" \"@authority\" \"x-api-key\");created=1641013200;nonce=\"abc123\";keyid=\"SGVsbG8h\";alg=\"hmac-sha256\"",
        )
        .unwrap();
        let Member::InnerList(list) = member(&dict, "sig1") else {
            panic!("expected inner list");
        };
        assert_eq!(list.items.len(), 3);
        assert_eq!(
            list.items[0].value,
            BareItem::String("@request-target".into())
        );
        assert_eq!(list.params[0], ("created".into(), BareItem::Integer(1641013200)));
        assert_eq!(
            list.params[3],
            ("alg".into(), BareItem::String("hmac-sha256".into()))
        );
    }

    #[test]
    fn test_parse_signature_byte_sequence() {
        let dict = parse_dictionary("sig1=:SGVsbG8gV29ybGQh:").unwrap();
        let Member::Item(item) = member(&dict, "sig1") else {
            panic!("expected item");
        };
        assert_eq!(item.value.as_bytes(), Some(b"Hello World!".as_slice()));
    }

    #[test]
    fn test_parse_bare_key_and_booleans() {
        let dict = parse_dictionary("a, b=?0, c;x=tok").unwrap();
        assert_eq!(
            member(&dict, "a"),
            &Member::Item(Item {
                value: BareItem::Boolean(true),
                params: vec![]
            })
        );
        let Member::Item(b) = member(&dict, "b") else { panic!() };
        assert_eq!(b.value.as_bool(), Some(false));
        let Member::Item(c) = member(&dict, "c") else { panic!() };
        assert_eq!(c.params[0], ("x".into(), BareItem::Token("tok".into())));
    }

    #[test]
    fn test_duplicate_keys_last_wins() {
        let dict = parse_dictionary("k=1, k=2").unwrap();
        assert_eq!(dict.len(), 1);
        let Member::Item(item) = member(&dict, "k") else { panic!() };
        assert_eq!(item.value.as_integer(), Some(2));
    }

    #[test]
    fn test_parse_rejections() {
        for input in [
            "sig1=",
            "Sig=1",
            "a=1,",
            "a=(\"x\"",
            "a=\"unterminated",
            "a=:badb64?:",
            "a=?2",
            "a=1234567890123456",
            "a=1.2345",
        ] {
            assert!(parse_dictionary(input).is_err(), "accepted {input:?}");
        }
    }

    #[test]
    fn test_encode_round_trip() {
        let input = "sig1=(\"a\";key=\"v\" \"b\");created=12;x=?1";
        let dict = parse_dictionary(input).unwrap();
        let Member::InnerList(list) = member(&dict, "sig1") else { panic!() };
        assert_eq!(
            encode_inner_list(list),
            "(\"a\";key=\"v\" \"b\");created=12;x"
        );
    }

    #[test]
    fn test_encode_bare_items() {
        assert_eq!(encode_bare_item(&BareItem::Integer(-42)), "-42");
        assert_eq!(encode_bare_item(&BareItem::Decimal(1.25)), "1.25");
        assert_eq!(encode_bare_item(&BareItem::Decimal(2.0)), "2.0");
        assert_eq!(
            encode_bare_item(&BareItem::String("a\"b\\c".into())),
            "\"a\\\"b\\\\c\""
        );
        assert_eq!(encode_bare_item(&BareItem::Boolean(false)), "?0");
        assert_eq!(
            encode_bare_item(&BareItem::ByteSequence(b"hi".to_vec())),
            ":aGk=:"
        );
    }

    #[test]
    fn test_whitespace_canonicalized_by_parse() {
        let dict = parse_dictionary("  sig1=( \"a\"   \"b\" );p=1 ,  k=2").unwrap();
        let Member::InnerList(list) = member(&dict, "sig1") else { panic!() };
        assert_eq!(encode_inner_list(list), "(\"a\" \"b\");p=1");
        assert_eq!(dict.len(), 2);
    }
}
