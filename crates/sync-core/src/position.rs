//! Binlog coordinates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A position in a MySQL binary log: file name plus byte offset.
///
/// Ordering compares the file name first (binlog file names carry a
/// zero-padded sequence suffix) and the offset second.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogFilePos {
    pub file: String,
    pub pos: u64,
}

impl LogFilePos {
    pub fn new(file: impl Into<String>, pos: u64) -> Self {
        Self {
            file: file.into(),
            pos,
        }
    }
}

impl fmt::Display for LogFilePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.pos)
    }
}

impl FromStr for LogFilePos {
    type Err = String;

    /// Parse `file:pos`, e.g. `mysql-bin.000003:4`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (file, pos) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected 'file:pos', got '{s}'"))?;
        if file.is_empty() {
            return Err(format!("empty binlog file name in '{s}'"));
        }
        let pos = pos
            .parse::<u64>()
            .map_err(|e| format!("invalid binlog offset in '{s}': {e}"))?;
        Ok(Self::new(file, pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_compares_before_offset() {
        let a = LogFilePos::new("mysql-bin.000001", 9_999_999);
        let b = LogFilePos::new("mysql-bin.000002", 4);
        assert!(a < b);
        assert!(LogFilePos::new("mysql-bin.000002", 5) > b);
    }

    #[test]
    fn test_parse() {
        let p: LogFilePos = "mysql-bin.000003:1234".parse().unwrap();
        assert_eq!(p, LogFilePos::new("mysql-bin.000003", 1234));
        assert_eq!(p.to_string(), "mysql-bin.000003:1234");
        assert!("nofile".parse::<LogFilePos>().is_err());
        assert!(":12".parse::<LogFilePos>().is_err());
        assert!("f:-1".parse::<LogFilePos>().is_err());
    }
}
