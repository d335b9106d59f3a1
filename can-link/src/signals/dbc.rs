//! DBC file parser
//!
//! Single pass over trimmed lines. Only `BO_`, `SG_` and `VAL_` lines carry
//! information we use; everything else (`VERSION`, `NS_`, `BU_`, `CM_`,
//! attributes, ...) is skipped. Messages are collected into builders and frozen
//! into `MessageSchema`s once the whole text has been read, so a failure never
//! leaves a partial database behind.

use crate::config::{DatabaseConfig, SignalConvention};
use crate::signals::message::MessageSchema;
use crate::signals::schema::{bit_span, Multiplexer, SignalRole, SignalSchema, ValueDescription};
use crate::types::Result;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::str::FromStr;

/// Bit 31 of a `BO_` identifier marks an extended (29-bit) frame
pub const DBC_EXTENDED_FLAG: u32 = 0x8000_0000;

/// What went wrong while parsing
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DbcErrorKind {
    #[error("bad BO_ line")]
    MalformedMessage,
    #[error("bad SG_ line")]
    MalformedSignal,
    #[error("bad VAL_ line")]
    MalformedValueDescription,
    #[error("duplicate message address")]
    DuplicateAddress,
    #[error("duplicate message name")]
    DuplicateMessageName,
    #[error("duplicate signal name")]
    DuplicateSignalName,
    #[error("signal out of bounds")]
    SignalOutOfBounds,
    #[error("signal size out of range")]
    InvalidSignalSize,
    #[error("signal outside of any message")]
    SignalWithoutMessage,
    #[error("signal violates checksum/counter convention")]
    ConventionViolation,
}

/// A fatal DBC parse failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} on line {line}: {context}")]
pub struct DbcParseError {
    pub kind: DbcErrorKind,
    /// 1-based line number
    pub line: usize,
    pub context: String,
}

impl DbcParseError {
    fn new(kind: DbcErrorKind, line: usize, context: impl Into<String>) -> Self {
        Self {
            kind,
            line,
            context: context.into(),
        }
    }
}

/// Read a DBC file into a string
///
/// DBC files are frequently written in Windows-1252; anything that is not
/// valid UTF-8 is decoded as Latin-1 instead.
pub fn read_dbc_file(path: &Path) -> Result<String> {
    log::info!("Reading DBC file: {:?}", path);
    let bytes = std::fs::read(path)?;
    match String::from_utf8(bytes) {
        Ok(text) => Ok(text),
        Err(err) => {
            log::warn!("DBC file {:?} is not UTF-8, falling back to Latin-1", path);
            Ok(err.into_bytes().iter().map(|&b| b as char).collect())
        }
    }
}

/// Cursor over a single DBC line
struct Tokens<'a> {
    line: &'a str,
    pos: usize,
}

impl<'a> Tokens<'a> {
    fn new(line: &'a str) -> Self {
        Self { line, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.line[self.pos..]
    }

    fn skip_ws(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_ws();
        self.rest().chars().next()
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> Option<&'a str> {
        self.skip_ws();
        let rest = self.rest();
        let len = rest.find(|c: char| !pred(c)).unwrap_or(rest.len());
        if len == 0 {
            return None;
        }
        self.pos += len;
        Some(&rest[..len])
    }

    /// `[A-Za-z0-9_]+`
    fn ident(&mut self) -> Option<&'a str> {
        self.take_while(|c| c.is_ascii_alphanumeric() || c == '_')
    }

    fn number<T: FromStr>(&mut self) -> Option<T> {
        self.take_while(|c| c.is_ascii_digit() || matches!(c, '.' | '+' | '-' | 'e' | 'E'))?
            .parse()
            .ok()
    }

    fn punct(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.pos += expected.len_utf8();
            true
        } else {
            false
        }
    }

    fn next_char(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    /// Text between double quotes, without the quotes
    fn quoted(&mut self) -> Option<&'a str> {
        if !self.punct('"') {
            return None;
        }
        let rest = self.rest();
        let end = rest.find('"')?;
        self.pos += end + 1;
        Some(&rest[..end])
    }
}

fn parse_address(text: &str) -> Option<u32> {
    let raw = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => text.parse().ok()?,
    };
    Some(raw & !DBC_EXTENDED_FLAG)
}

/// Parsed `BO_` header
struct MessageHeader<'a> {
    address: u32,
    name: &'a str,
    size: u32,
    transmitter: Option<&'a str>,
}

fn parse_message_line(line: &str) -> Option<MessageHeader<'_>> {
    let mut tokens = Tokens::new(line);
    if tokens.ident()? != "BO_" {
        return None;
    }
    let address = parse_address(tokens.ident()?)?;
    let name = tokens.ident()?;
    if !tokens.punct(':') {
        return None;
    }
    let size = tokens.number()?;
    let transmitter = tokens.ident();
    Some(MessageHeader {
        address,
        name,
        size,
        transmitter,
    })
}

fn parse_multiplexer(token: &str) -> Option<Multiplexer> {
    if token == "M" {
        return Some(Multiplexer::Multiplexor);
    }
    let value = token.strip_prefix('m')?;
    // `m1M` (extended multiplexing) is both; keep the switch value
    let value = value.strip_suffix('M').unwrap_or(value);
    value.parse().ok().map(Multiplexer::Multiplexed)
}

fn parse_signal_line(line: &str) -> Option<SignalSchema> {
    let mut tokens = Tokens::new(line);
    if tokens.ident()? != "SG_" {
        return None;
    }
    let name = tokens.ident()?;
    let multiplexer = if tokens.peek() == Some(':') {
        None
    } else {
        Some(parse_multiplexer(tokens.ident()?)?)
    };
    if !tokens.punct(':') {
        return None;
    }
    let start_bit: u32 = tokens.number()?;
    if !tokens.punct('|') {
        return None;
    }
    let size: u32 = tokens.number()?;
    if !tokens.punct('@') {
        return None;
    }
    let little_endian = match tokens.next_char()? {
        '1' => true,
        '0' => false,
        _ => return None,
    };
    let is_signed = match tokens.next_char()? {
        '-' => true,
        '+' => false,
        _ => return None,
    };
    if !tokens.punct('(') {
        return None;
    }
    let factor: f64 = tokens.number()?;
    if !tokens.punct(',') {
        return None;
    }
    let offset: f64 = tokens.number()?;
    if !tokens.punct(')') {
        return None;
    }

    let (mut min, mut max) = (0.0, 0.0);
    if tokens.punct('[') {
        min = tokens.number()?;
        if !tokens.punct('|') {
            return None;
        }
        max = tokens.number()?;
        if !tokens.punct(']') {
            return None;
        }
    }
    let unit = tokens.quoted().unwrap_or_default().to_string();
    let receivers = tokens
        .rest()
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect();

    Some(SignalSchema {
        name: name.to_string(),
        start_bit,
        size,
        is_signed,
        factor,
        offset,
        little_endian,
        min,
        max,
        unit,
        receivers,
        multiplexer,
        ..Default::default()
    })
}

/// Parsed `VAL_` line
struct ValueLine<'a> {
    address: u32,
    signal: &'a str,
    definitions: &'a str,
    labels: BTreeMap<i64, String>,
}

fn parse_value_line(line: &str) -> Option<ValueLine<'_>> {
    let mut tokens = Tokens::new(line);
    if tokens.ident()? != "VAL_" {
        return None;
    }
    let address = parse_address(tokens.ident()?)?;
    let signal = tokens.ident()?;
    tokens.skip_ws();
    let body = tokens.rest();
    let definitions = body.split(';').next().unwrap_or(body);

    let mut labels = BTreeMap::new();
    while !matches!(tokens.peek(), None | Some(';')) {
        let value: i64 = tokens.number()?;
        let label = tokens.quoted()?;
        labels.insert(value, label.to_string());
    }
    if labels.is_empty() {
        return None;
    }
    Some(ValueLine {
        address,
        signal,
        definitions,
        labels,
    })
}

/// `3 "Lane keep" 2 "Off"` becomes `3 LANE_KEEP 2 OFF`
fn normalize_definitions(definitions: &str) -> String {
    definitions
        .split('"')
        .map(|word| word.trim().to_uppercase().replace(' ', "_"))
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

struct MessageBuilder {
    name: String,
    size: u32,
    transmitter: Option<String>,
    line: usize,
    signals: Vec<SignalSchema>,
    signal_names: HashSet<String>,
}

fn check_convention(
    signal: &SignalSchema,
    convention: &SignalConvention,
    line: usize,
) -> std::result::Result<(), DbcParseError> {
    convention
        .check(signal.start_bit, signal.size, signal.little_endian)
        .map_err(|reason| {
            DbcParseError::new(
                DbcErrorKind::ConventionViolation,
                line,
                format!("{}: {}", signal.name, reason),
            )
        })
}

/// Parse DBC text into message schemas, ordered by address
pub fn parse_dbc(
    text: &str,
    config: &DatabaseConfig,
) -> std::result::Result<Vec<MessageSchema>, DbcParseError> {
    let mut builders: BTreeMap<u32, MessageBuilder> = BTreeMap::new();
    let mut message_names: HashSet<String> = HashSet::new();
    let mut current: Option<u32> = None;

    for (index, raw_line) in text.lines().enumerate() {
        let line_num = index + 1;
        let line = raw_line.trim();

        if line.starts_with("BO_ ") {
            let header = parse_message_line(line)
                .ok_or_else(|| DbcParseError::new(DbcErrorKind::MalformedMessage, line_num, line))?;

            if builders.contains_key(&header.address) {
                return Err(DbcParseError::new(
                    DbcErrorKind::DuplicateAddress,
                    line_num,
                    format!("0x{:X} ({})", header.address, header.name),
                ));
            }
            if !message_names.insert(header.name.to_string()) && !config.allow_duplicate_message_names {
                return Err(DbcParseError::new(
                    DbcErrorKind::DuplicateMessageName,
                    line_num,
                    header.name,
                ));
            }

            builders.insert(
                header.address,
                MessageBuilder {
                    name: header.name.to_string(),
                    size: header.size,
                    transmitter: header.transmitter.map(str::to_string),
                    line: line_num,
                    signals: Vec::new(),
                    signal_names: HashSet::new(),
                },
            );
            current = Some(header.address);
        } else if line.starts_with("SG_ ") {
            let mut signal = parse_signal_line(line)
                .ok_or_else(|| DbcParseError::new(DbcErrorKind::MalformedSignal, line_num, line))?;

            let builder = current
                .and_then(|address| builders.get_mut(&address))
                .ok_or_else(|| {
                    DbcParseError::new(DbcErrorKind::SignalWithoutMessage, line_num, &signal.name)
                })?;

            if !(1..=64).contains(&signal.size) {
                return Err(DbcParseError::new(
                    DbcErrorKind::InvalidSignalSize,
                    line_num,
                    format!("{} has size {}", signal.name, signal.size),
                ));
            }

            signal.role = match signal.name.as_str() {
                "CHECKSUM" => {
                    check_convention(&signal, &config.checksum, line_num)?;
                    SignalRole::Checksum
                }
                "COUNTER" => {
                    check_convention(&signal, &config.counter, line_num)?;
                    SignalRole::Counter
                }
                _ => SignalRole::Default,
            };

            let (msb, lsb) = bit_span(signal.start_bit, signal.size, signal.little_endian)
                .ok_or_else(|| DbcParseError::new(DbcErrorKind::SignalOutOfBounds, line_num, line))?;
            signal.msb = msb;
            signal.lsb = lsb;
            signal.message_name = builder.name.clone();

            if !builder.signal_names.insert(signal.name.clone()) {
                return Err(DbcParseError::new(
                    DbcErrorKind::DuplicateSignalName,
                    line_num,
                    format!("{} in {}", signal.name, builder.name),
                ));
            }
            builder.signals.push(signal);
        } else if line.starts_with("VAL_ ") {
            let parsed = parse_value_line(line).ok_or_else(|| {
                DbcParseError::new(DbcErrorKind::MalformedValueDescription, line_num, line)
            })?;

            let target = builders
                .get_mut(&parsed.address)
                .and_then(|b| b.signals.iter_mut().find(|s| s.name == parsed.signal));
            match target {
                Some(signal) => {
                    signal.value_description = Some(ValueDescription {
                        signal: parsed.signal.to_string(),
                        address: parsed.address,
                        definitions: normalize_definitions(parsed.definitions),
                        labels: parsed.labels,
                    });
                }
                None => log::warn!(
                    "Line {}: value description for unknown signal {} at 0x{:X}",
                    line_num,
                    parsed.signal,
                    parsed.address
                ),
            }
        }
    }

    let mut messages = Vec::with_capacity(builders.len());
    for (address, builder) in builders {
        let line = builder.line;
        let message = MessageSchema::new(
            builder.name,
            address,
            builder.size,
            builder.transmitter,
            builder.signals,
        )
        .map_err(|e| DbcParseError::new(DbcErrorKind::DuplicateSignalName, line, e.to_string()))?;
        messages.push(message);
    }

    log::debug!("Parsed {} messages from DBC text", messages.len());
    Ok(messages)
}
