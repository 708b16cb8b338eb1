use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

lazy_static! {
    static ref MAC_RE: Regex = Regex::new(r"^([0-9A-Fa-f]{2}[:-]?){5}[0-9A-Fa-f]{2}$").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid MAC address: {0:?}")]
pub struct MacParseError(pub String);

/// A device MAC credential, always stored as `XX:XX:XX:XX:XX:XX` in upper case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress(String);

impl MacAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for MacAddress {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if !MAC_RE.is_match(trimmed) {
            return Err(MacParseError(s.to_string()));
        }
        // Mixed separators ("AA:BB-CC...") pass the regex; the hex digits are all that matter.
        let hex: String = trimmed
            .chars()
            .filter(|c| c.is_ascii_hexdigit())
            .map(|c| c.to_ascii_uppercase())
            .collect();
        let normalized = hex
            .as_bytes()
            .chunks(2)
            .map(|pair| std::str::from_utf8(pair).unwrap_or_default())
            .collect::<Vec<_>>()
            .join(":");
        Ok(Self(normalized))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One credential in a portal's pool. Position in the pool is the try-order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacEntry {
    pub mac: MacAddress,
    /// Last expiry string reported by the portal, verbatim.
    #[serde(default)]
    pub expires: Option<String>,
}

impl MacEntry {
    pub fn new(mac: MacAddress) -> Self {
        Self { mac, expires: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_separators_and_case() {
        let a: MacAddress = "00:1a:79:ab:cd:ef".parse().unwrap();
        let b: MacAddress = "00-1A-79-AB-CD-EF".parse().unwrap();
        let c: MacAddress = "001a79abcdef".parse().unwrap();
        assert_eq!(a.as_str(), "00:1A:79:AB:CD:EF");
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<MacAddress>().is_err());
        assert!("00:1A:79:AB:CD".parse::<MacAddress>().is_err());
        assert!("00:1A:79:AB:CD:EG".parse::<MacAddress>().is_err());
        assert!("00:1A:79:AB:CD:EF:01".parse::<MacAddress>().is_err());
    }

    #[test]
    fn deserializes_from_json_string() {
        let entry: MacEntry = serde_json::from_str(r#"{"mac":"aa-bb-cc-dd-ee-ff"}"#).unwrap();
        assert_eq!(entry.mac.to_string(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(entry.expires, None);
    }
}
