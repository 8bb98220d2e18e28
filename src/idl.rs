//! Compiler for the textual IDL produced by [`SchemaRegistry::generate_schema`].
//!
//! Accepts the proto3 subset the registry emits: `syntax`, `package`,
//! `message` blocks, `repeated`/`optional` labels and bracketed field
//! options (`precision`, `enum`). Comments are `//` and `/* */`.
//!
//! [`SchemaRegistry::generate_schema`]: crate::schema::SchemaRegistry::generate_schema

use crate::error::{Result, SyncError};
use crate::protocol::{FieldNumber, FieldType};
use crate::schema::MAX_FIELD_NUMBER;
use ahash::AHashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledField {
    pub number: FieldNumber,
    pub name: String,
    pub field_type: FieldType,
    pub repeated: bool,
    pub optional: bool,
    pub precision: Option<f64>,
    /// Referenced message for nested message fields.
    pub message_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompiledMessage {
    pub name: String,
    pub full_name: String,
    fields: Vec<CompiledField>,
    by_number: AHashMap<FieldNumber, usize>,
    by_name: AHashMap<String, usize>,
}

impl CompiledMessage {
    fn new(name: String, full_name: String, mut fields: Vec<CompiledField>) -> Self {
        fields.sort_by_key(|f| f.number);
        let by_number = fields.iter().enumerate().map(|(i, f)| (f.number, i)).collect();
        let by_name = fields.iter().enumerate().map(|(i, f)| (f.name.clone(), i)).collect();
        Self {
            name,
            full_name,
            fields,
            by_number,
            by_name,
        }
    }

    /// Fields in ascending number order.
    pub fn fields(&self) -> &[CompiledField] {
        &self.fields
    }

    pub fn field_by_number(&self, number: FieldNumber) -> Option<&CompiledField> {
        self.by_number.get(&number).map(|&i| &self.fields[i])
    }

    pub fn field_by_name(&self, name: &str) -> Option<&CompiledField> {
        self.by_name.get(name).map(|&i| &self.fields[i])
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompiledIdl {
    pub package: Option<String>,
    messages: AHashMap<String, Arc<CompiledMessage>>,
}

impl CompiledIdl {
    pub fn compile(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        let parsed = Parser::new(tokens).parse_file()?;
        parsed.resolve()
    }

    /// Looks up by short name or by `package.Name`.
    pub fn message(&self, name: &str) -> Option<Arc<CompiledMessage>> {
        let short = match &self.package {
            Some(package) => name
                .strip_prefix(package.as_str())
                .and_then(|rest| rest.strip_prefix('.'))
                .unwrap_or(name),
            None => name,
        };
        self.messages.get(short).cloned()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.messages.keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(String),
    Str(String),
    Symbol(char),
}

fn tokenize(source: &str) -> Result<Vec<(Token, usize)>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut line = 1;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c == '\n' {
            line += 1;
            i += 1;
        } else if c.is_whitespace() {
            i += 1;
        } else if c == '/' && chars.get(i + 1) == Some(&'/') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if c == '/' && chars.get(i + 1) == Some(&'*') {
            i += 2;
            while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                if chars[i] == '\n' {
                    line += 1;
                }
                i += 1;
            }
            if i >= chars.len() {
                return Err(idl_error(line, "unterminated block comment"));
            }
            i += 2;
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                i += 1;
            }
            tokens.push((Token::Ident(chars[start..i].iter().collect()), line));
        } else if c.is_ascii_digit() || c == '-' {
            let start = i;
            i += 1;
            while i < chars.len()
                && (chars[i].is_ascii_alphanumeric() || chars[i] == '.' || ((chars[i] == '-' || chars[i] == '+') && matches!(chars[i - 1], 'e' | 'E')))
            {
                i += 1;
            }
            tokens.push((Token::Number(chars[start..i].iter().collect()), line));
        } else if c == '"' {
            let start = i + 1;
            i += 1;
            while i < chars.len() && chars[i] != '"' {
                i += 1;
            }
            if i >= chars.len() {
                return Err(idl_error(line, "unterminated string"));
            }
            tokens.push((Token::Str(chars[start..i].iter().collect()), line));
            i += 1;
        } else if "={}[];,".contains(c) {
            tokens.push((Token::Symbol(c), line));
            i += 1;
        } else {
            return Err(idl_error(line, &format!("unexpected character '{}'", c)));
        }
    }

    Ok(tokens)
}

fn idl_error(line: usize, message: &str) -> SyncError {
    SyncError::Idl {
        line,
        message: message.to_string(),
    }
}

struct RawField {
    line: usize,
    label: Option<String>,
    type_name: String,
    name: String,
    number: FieldNumber,
    precision: Option<f64>,
    is_enum: bool,
}

struct RawMessage {
    line: usize,
    name: String,
    fields: Vec<RawField>,
}

struct ParsedFile {
    package: Option<String>,
    messages: Vec<RawMessage>,
}

impl ParsedFile {
    fn resolve(self) -> Result<CompiledIdl> {
        let mut declared: AHashMap<&str, usize> = AHashMap::new();
        for message in &self.messages {
            if declared.insert(message.name.as_str(), message.line).is_some() {
                return Err(idl_error(message.line, &format!("duplicate message '{}'", message.name)));
            }
        }

        let mut messages = AHashMap::new();
        for message in &self.messages {
            let mut fields = Vec::with_capacity(message.fields.len());
            let mut numbers: AHashMap<FieldNumber, &str> = AHashMap::new();

            for raw in &message.fields {
                if let Some(existing) = numbers.insert(raw.number, raw.name.as_str()) {
                    return Err(idl_error(
                        raw.line,
                        &format!("field number {} used by both '{}' and '{}'", raw.number, existing, raw.name),
                    ));
                }
                fields.push(self.resolve_field(raw, &declared)?);
            }

            let full_name = match &self.package {
                Some(package) => format!("{}.{}", package, message.name),
                None => message.name.clone(),
            };

            messages.insert(
                message.name.clone(),
                Arc::new(CompiledMessage::new(message.name.clone(), full_name, fields)),
            );
        }

        Ok(CompiledIdl {
            package: self.package,
            messages,
        })
    }

    fn resolve_field(&self, raw: &RawField, declared: &AHashMap<&str, usize>) -> Result<CompiledField> {
        let local_name = match &self.package {
            Some(package) => raw
                .type_name
                .strip_prefix(package.as_str())
                .and_then(|rest| rest.strip_prefix('.'))
                .unwrap_or(&raw.type_name),
            None => raw.type_name.as_str(),
        };

        let (field_type, message_type) = match FieldType::from_idl(&raw.type_name) {
            Some(FieldType::Int32) if raw.is_enum => (FieldType::Enum, None),
            Some(scalar) => (scalar, None),
            None if declared.contains_key(local_name) => (FieldType::Message, Some(local_name.to_string())),
            None => {
                return Err(idl_error(raw.line, &format!("unknown type '{}'", raw.type_name)));
            }
        };

        if raw.precision.is_some() && !matches!(field_type, FieldType::Float | FieldType::Double) {
            return Err(idl_error(raw.line, "precision is only valid on float and double fields"));
        }

        Ok(CompiledField {
            number: raw.number,
            name: raw.name.clone(),
            field_type,
            repeated: raw.label.as_deref() == Some("repeated"),
            optional: raw.label.as_deref() == Some("optional"),
            precision: raw.precision,
            message_type,
        })
    }
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<(Token, usize)>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|(_, line)| *line)
            .unwrap_or(1)
    }

    fn next(&mut self) -> Result<Token> {
        let line = self.line();
        let token = self
            .tokens
            .get(self.pos)
            .map(|(t, _)| t.clone())
            .ok_or_else(|| idl_error(line, "unexpected end of input"))?;
        self.pos += 1;
        Ok(token)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn expect_symbol(&mut self, symbol: char) -> Result<()> {
        let line = self.line();
        match self.next()? {
            Token::Symbol(c) if c == symbol => Ok(()),
            other => Err(idl_error(line, &format!("expected '{}', found {:?}", symbol, other))),
        }
    }

    fn expect_ident(&mut self) -> Result<String> {
        let line = self.line();
        match self.next()? {
            Token::Ident(name) => Ok(name),
            other => Err(idl_error(line, &format!("expected identifier, found {:?}", other))),
        }
    }

    fn expect_number(&mut self) -> Result<String> {
        let line = self.line();
        match self.next()? {
            Token::Number(n) => Ok(n),
            other => Err(idl_error(line, &format!("expected number, found {:?}", other))),
        }
    }

    fn parse_file(mut self) -> Result<ParsedFile> {
        let mut package = None;
        let mut messages = Vec::new();

        while self.peek().is_some() {
            let line = self.line();
            match self.expect_ident()?.as_str() {
                "syntax" => {
                    self.expect_symbol('=')?;
                    match self.next()? {
                        Token::Str(s) if s == "proto3" => {}
                        other => return Err(idl_error(line, &format!("unsupported syntax {:?}", other))),
                    }
                    self.expect_symbol(';')?;
                }
                "package" => {
                    package = Some(self.expect_ident()?);
                    self.expect_symbol(';')?;
                }
                "message" => messages.push(self.parse_message(line)?),
                other => return Err(idl_error(line, &format!("unexpected '{}'", other))),
            }
        }

        Ok(ParsedFile { package, messages })
    }

    fn parse_message(&mut self, line: usize) -> Result<RawMessage> {
        let name = self.expect_ident()?;
        self.expect_symbol('{')?;

        let mut fields = Vec::new();
        loop {
            if self.peek() == Some(&Token::Symbol('}')) {
                self.pos += 1;
                break;
            }
            fields.push(self.parse_field()?);
        }

        Ok(RawMessage { line, name, fields })
    }

    fn parse_field(&mut self) -> Result<RawField> {
        let line = self.line();
        let mut first = self.expect_ident()?;

        let label = if first == "repeated" || first == "optional" {
            let label = first;
            first = self.expect_ident()?;
            Some(label)
        } else {
            None
        };

        let name = self.expect_ident()?;
        self.expect_symbol('=')?;
        let raw_number = self.expect_number()?;
        let number: FieldNumber = raw_number
            .parse()
            .map_err(|_| idl_error(line, &format!("invalid field number '{}'", raw_number)))?;
        if number == 0 || number > MAX_FIELD_NUMBER {
            return Err(idl_error(line, &format!("field number {} out of range", number)));
        }

        let mut precision = None;
        let mut is_enum = false;

        if self.peek() == Some(&Token::Symbol('[')) {
            self.pos += 1;
            loop {
                let key = self.expect_ident()?;
                self.expect_symbol('=')?;
                let value = match self.next()? {
                    Token::Number(n) | Token::Ident(n) | Token::Str(n) => n,
                    Token::Symbol(c) => return Err(idl_error(line, &format!("unexpected '{}'", c))),
                };

                match key.as_str() {
                    "precision" => {
                        let step: f64 = value
                            .parse()
                            .map_err(|_| idl_error(line, &format!("invalid precision '{}'", value)))?;
                        if !(step > 0.0 && step.is_finite()) {
                            return Err(idl_error(line, "precision must be positive"));
                        }
                        precision = Some(step);
                    }
                    "enum" => is_enum = value == "true",
                    _ => {}
                }

                match self.next()? {
                    Token::Symbol(',') => continue,
                    Token::Symbol(']') => break,
                    other => return Err(idl_error(line, &format!("expected ',' or ']', found {:?}", other))),
                }
            }
        }

        self.expect_symbol(';')?;

        Ok(RawField {
            line,
            label,
            type_name: first,
            name,
            number,
            precision,
            is_enum,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r#"
syntax = "proto3";
package ecs;

/* block
   comment */
message Transform {
  Vec3 position = 1;
  repeated float weights = 2 [precision = 0.5];
  optional string label = 3; // trailing
  int32 state = 4 [enum = true];
  google.protobuf.Timestamp spawned = 5;
}

message Vec3 {
  float x = 1;
  float y = 2;
  float z = 3;
}
"#;

    #[test]
    fn test_compile_messages() {
        let idl = CompiledIdl::compile(SOURCE).unwrap();
        assert_eq!(idl.package.as_deref(), Some("ecs"));
        assert_eq!(idl.names(), vec!["Transform".to_string(), "Vec3".to_string()]);

        let transform = idl.message("ecs.Transform").unwrap();
        assert_eq!(transform.full_name, "ecs.Transform");

        let position = transform.field_by_number(1).unwrap();
        assert_eq!(position.field_type, FieldType::Message);
        assert_eq!(position.message_type.as_deref(), Some("Vec3"));

        let weights = transform.field_by_name("weights").unwrap();
        assert!(weights.repeated);
        assert_eq!(weights.precision, Some(0.5));

        assert!(transform.field_by_name("label").unwrap().optional);
        assert_eq!(transform.field_by_number(4).unwrap().field_type, FieldType::Enum);
        assert_eq!(transform.field_by_number(5).unwrap().field_type, FieldType::Timestamp);
    }

    #[test]
    fn test_rejects_unknown_type() {
        let err = CompiledIdl::compile("message A { Missing m = 1; }").unwrap_err();
        assert!(matches!(err, SyncError::Idl { line: 1, .. }));
    }

    #[test]
    fn test_rejects_duplicate_numbers() {
        let source = "message A {\n  int32 a = 1;\n  int32 b = 1;\n}";
        let err = CompiledIdl::compile(source).unwrap_err();
        assert!(matches!(err, SyncError::Idl { line: 3, .. }));
    }

    #[test]
    fn test_rejects_bad_precision() {
        let err = CompiledIdl::compile("message A { string s = 1 [precision = 0.1]; }").unwrap_err();
        assert!(matches!(err, SyncError::Idl { .. }));
    }
}
