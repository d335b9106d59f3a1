//! Signal database
//!
//! Read-only view over every message in a DBC, indexed by address and by name.
//! Built once and shared between threads behind an `Arc`.

use crate::config::DatabaseConfig;
use crate::signals::dbc::{parse_dbc, read_dbc_file};
use crate::signals::message::MessageSchema;
use crate::signals::schema::SignalSchema;
use crate::types::{CanError, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;

/// Payload sizes indexed by CAN FD data length code
pub const DATA_LENGTH_CODE_TO_NUM_BYTES: [u8; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

/// Returned by `buffer_size_to_data_length_code` for sizes with no DLC
pub const INVALID_DATA_LENGTH_CODE: u8 = 255;

/// Data length code for a payload size, or `INVALID_DATA_LENGTH_CODE`
pub fn buffer_size_to_data_length_code(len: usize) -> u8 {
    DATA_LENGTH_CODE_TO_NUM_BYTES
        .iter()
        .position(|&n| usize::from(n) == len)
        .map(|dlc| dlc as u8)
        .unwrap_or(INVALID_DATA_LENGTH_CODE)
}

/// All message schemas of one DBC
#[derive(Debug, Clone, Default)]
pub struct DatabaseSchema {
    messages: BTreeMap<u32, MessageSchema>,
    names: HashMap<String, u32>,
}

impl DatabaseSchema {
    /// Build from already frozen messages
    ///
    /// Messages are indexed by name in ascending address order, so with
    /// duplicate names the highest address wins.
    pub fn from_messages(messages: impl IntoIterator<Item = MessageSchema>) -> Result<Self> {
        let mut by_address = BTreeMap::new();
        for message in messages {
            let address = message.address();
            if by_address.insert(address, message).is_some() {
                return Err(CanError::InvalidParameter(format!(
                    "duplicate message address 0x{:X}",
                    address
                )));
            }
        }
        let names = by_address
            .iter()
            .map(|(&address, message)| (message.name().to_string(), address))
            .collect();
        Ok(Self {
            messages: by_address,
            names,
        })
    }

    /// Parse DBC text
    pub fn parse(text: &str, config: &DatabaseConfig) -> Result<Self> {
        let messages = parse_dbc(text, config)?;
        Self::from_messages(messages)
    }

    /// Read and parse a DBC file
    pub fn from_file(path: impl AsRef<Path>, config: &DatabaseConfig) -> Result<Self> {
        let path = path.as_ref();
        let text = read_dbc_file(path)?;
        let database = Self::parse(&text, config)?;
        let stats = database.stats();
        log::info!(
            "Loaded {} messages ({} signals) from {:?}",
            stats.num_messages,
            stats.num_signals,
            path
        );
        Ok(database)
    }

    pub fn message_by_address(&self, address: u32) -> Option<&MessageSchema> {
        self.messages.get(&address)
    }

    pub fn message_by_name(&self, name: &str) -> Option<&MessageSchema> {
        self.names
            .get(name)
            .and_then(|address| self.messages.get(address))
    }

    pub fn signal_schemas_by_address(&self, address: u32) -> Option<&[SignalSchema]> {
        self.messages.get(&address).map(MessageSchema::signals)
    }

    /// Every known address, ascending
    pub fn addresses(&self) -> Vec<u32> {
        self.messages.keys().copied().collect()
    }

    /// Messages in ascending address order
    pub fn messages(&self) -> impl Iterator<Item = &MessageSchema> {
        self.messages.values()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Get database statistics
    pub fn stats(&self) -> DatabaseStats {
        let signals = || self.messages.values().flat_map(|m| m.signals().iter());
        DatabaseStats {
            num_messages: self.messages.len(),
            num_signals: signals().count(),
            num_value_descriptions: signals().filter(|s| s.value_description.is_some()).count(),
            num_counters: signals().filter(|s| s.is_counter()).count(),
            num_checksums: signals().filter(|s| s.is_checksum()).count(),
        }
    }
}

impl FromStr for DatabaseSchema {
    type Err = CanError;

    fn from_str(text: &str) -> Result<Self> {
        Self::parse(text, &DatabaseConfig::default())
    }
}

/// Database statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatabaseStats {
    /// Total number of messages
    pub num_messages: usize,
    /// Total number of signals across all messages
    pub num_signals: usize,
    /// Signals with a `VAL_` description
    pub num_value_descriptions: usize,
    pub num_counters: usize,
    pub num_checksums: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const DBC: &str = r#"
BO_ 290 ES_LKAS: 8 ES
 SG_ CHECKSUM : 0|8@1+ (1,0) [0|255] "" EPS
 SG_ COUNTER : 8|4@1+ (1,0) [0|15] "" EPS
 SG_ LKAS_Output : 16|13@1- (-1,0) [-8191|8191] "" EPS

BO_ 64 Throttle: 8 ECM
 SG_ Throttle_Pedal : 0|8@1+ (0.392157,0) [0|100] "%" ES
 SG_ Gear : 8|3@1+ (1,0) [0|7] "" ES

VAL_ 64 Gear 0 "P" 1 "R" 2 "N" 3 "D" ;
"#;

    #[test]
    fn test_empty_database() {
        let db = DatabaseSchema::default();
        assert!(db.is_empty());
        assert_eq!(db.stats(), DatabaseStats::default());
        assert!(db.message_by_address(1).is_none());
    }

    #[test]
    fn test_lookup_and_stats() {
        let db: DatabaseSchema = DBC.parse().unwrap();
        assert_eq!(db.addresses(), vec![64, 290]);
        assert_eq!(db.message_by_name("ES_LKAS").unwrap().address(), 290);
        assert_eq!(db.message_by_address(64).unwrap().name(), "Throttle");
        assert_eq!(db.signal_schemas_by_address(290).unwrap().len(), 3);
        assert!(db.signal_schemas_by_address(1).is_none());
        assert!(db.message_by_name("Nope").is_none());

        let stats = db.stats();
        assert_eq!(stats.num_messages, 2);
        assert_eq!(stats.num_signals, 5);
        assert_eq!(stats.num_value_descriptions, 1);
        assert_eq!(stats.num_counters, 1);
        assert_eq!(stats.num_checksums, 1);
    }

    #[test]
    fn test_duplicate_names_last_address_wins() {
        let text = "BO_ 300 Same: 8 X\nBO_ 100 Same: 4 X\n";
        let config = DatabaseConfig::new().with_duplicate_message_names(true);
        let db = DatabaseSchema::parse(text, &config).unwrap();
        assert_eq!(db.len(), 2);
        assert_eq!(db.message_by_name("Same").unwrap().address(), 300);
    }

    #[test]
    fn test_parse_error_is_reported() {
        let err = DatabaseSchema::from_str("BO_ 1 A: 8 X\nBO_ 1 B: 8 X\n").unwrap_err();
        assert!(matches!(err, CanError::DbcParse(_)));
    }

    #[test]
    fn test_data_length_codes() {
        for (dlc, &len) in DATA_LENGTH_CODE_TO_NUM_BYTES.iter().enumerate() {
            assert_eq!(buffer_size_to_data_length_code(len as usize), dlc as u8);
        }
        assert_eq!(buffer_size_to_data_length_code(9), INVALID_DATA_LENGTH_CODE);
        assert_eq!(buffer_size_to_data_length_code(65), INVALID_DATA_LENGTH_CODE);
    }

    #[test]
    fn test_from_file_latin1() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file
            .write_all(b"BO_ 100 Temp: 8 X\n SG_ T : 0|8@1+ (1,-40) [0|0] \"\xB0C\" X\n")
            .unwrap();
        temp_file.flush().unwrap();

        let db = DatabaseSchema::from_file(temp_file.path(), &DatabaseConfig::default()).unwrap();
        let sig = &db.signal_schemas_by_address(100).unwrap()[0];
        assert_eq!(sig.unit, "\u{B0}C");
        assert_eq!(sig.offset, -40.0);
    }

    #[test]
    fn test_from_file_missing() {
        let err = DatabaseSchema::from_file("/nonexistent/file.dbc", &DatabaseConfig::default())
            .unwrap_err();
        assert!(matches!(err, CanError::Io(_)));
    }
}
