//! User attribute records and their TLV wire form.
//!
//! Account-level attributes (`^!authring`-style keyrings, credential entries,
//! preferences) are maps of named byte values, flattened for storage into a
//! TLV sequence: `name NUL length(u16 BE) value`, repeated. Decoding is
//! strict — a missing delimiter or a short value is a [`TlvError`], never a
//! partial map.

use std::collections::BTreeMap;

use crate::error::TlvError;

/// Decoded attribute content: value name → bytes.
pub type ValueMap = BTreeMap<String, Vec<u8>>;

/// Flattens a value map into its TLV byte form.
pub fn value_map_to_tlv(values: &ValueMap) -> Result<Vec<u8>, TlvError> {
    let mut out = Vec::new();
    for (name, value) in values {
        if value.len() > usize::from(u16::MAX) {
            return Err(TlvError::InvalidLength);
        }
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(value);
    }
    Ok(out)
}

/// Parses a TLV sequence back into a value map.
pub fn tlv_to_value_map(tlv: &[u8]) -> Result<ValueMap, TlvError> {
    let mut map = ValueMap::new();
    let mut at = 0;

    while at < tlv.len() {
        let nul = tlv[at..]
            .iter()
            .position(|&b| b == 0)
            .ok_or(TlvError::MissingDelimiter)?;
        let name = String::from_utf8(tlv[at..at + nul].to_vec())
            .map_err(|_| TlvError::MissingDelimiter)?;
        at += nul + 1;

        let len_bytes: [u8; 2] = tlv
            .get(at..at + 2)
            .ok_or(TlvError::InvalidLength)?
            .try_into()
            .unwrap();
        let len = usize::from(u16::from_be_bytes(len_bytes));
        at += 2;

        let value = tlv.get(at..at + len).ok_or(TlvError::InvalidLength)?;
        at += len;

        map.insert(name, value.to_vec());
    }
    Ok(map)
}

/// Versioned cache of a user's attributes.
///
/// Server pushes (`ua` action packets) carry attribute names and new version
/// strings; a version change drops the cached value so the next read fetches
/// fresh content.
#[derive(Debug, Default)]
pub struct UserAttributeStore {
    entries: BTreeMap<String, AttributeEntry>,
}

#[derive(Debug, Default)]
struct AttributeEntry {
    version: String,
    value: Option<ValueMap>,
}

impl UserAttributeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a freshly fetched attribute. Refuses to overwrite an existing
    /// value at the same version.
    pub fn add(
        &mut self,
        name: &str,
        version: &str,
        value: ValueMap,
    ) -> Result<(), TlvError> {
        let entry = self.entries.entry(name.to_string()).or_default();
        if entry.value.is_some() && entry.version == version {
            return Err(TlvError::AttributeExists);
        }
        entry.version = version.to_string();
        entry.value = Some(value);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&ValueMap, TlvError> {
        self.entries
            .get(name)
            .and_then(|e| e.value.as_ref())
            .ok_or(TlvError::ValueNotFound)
    }

    /// Raw TLV form of a cached attribute.
    pub fn get_tlv(&self, name: &str) -> Result<Vec<u8>, TlvError> {
        value_map_to_tlv(self.get(name)?)
    }

    pub fn version(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(|e| e.version.as_str())
    }

    /// Applies a server-side version notification. Returns true when the
    /// cached value was invalidated.
    pub fn note_version(&mut self, name: &str, version: &str) -> bool {
        let entry = self.entries.entry(name.to_string()).or_default();
        if entry.version == version {
            return false;
        }
        entry.version = version.to_string();
        entry.value.take().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ValueMap {
        let mut map = ValueMap::new();
        map.insert("ed".into(), vec![1, 2, 3]);
        map.insert("cu".into(), vec![]);
        map
    }

    #[test]
    fn tlv_roundtrip() {
        let map = sample();
        let tlv = value_map_to_tlv(&map).unwrap();
        assert_eq!(tlv_to_value_map(&tlv).unwrap(), map);
    }

    #[test]
    fn decode_rejects_missing_delimiter() {
        assert_eq!(
            tlv_to_value_map(b"noterminator"),
            Err(TlvError::MissingDelimiter)
        );
    }

    #[test]
    fn decode_rejects_truncated_length_and_value() {
        // name + NUL but only one length byte
        assert_eq!(tlv_to_value_map(b"ed\0\x00"), Err(TlvError::InvalidLength));
        // declared 4 bytes, only 2 present
        assert_eq!(
            tlv_to_value_map(b"ed\0\x00\x04ab"),
            Err(TlvError::InvalidLength)
        );
    }

    #[test]
    fn store_versions_gate_overwrites() {
        let mut store = UserAttributeStore::new();
        store.add("^!authring", "v1", sample()).unwrap();
        assert_eq!(
            store.add("^!authring", "v1", sample()),
            Err(TlvError::AttributeExists)
        );
        // new version replaces freely
        store.add("^!authring", "v2", sample()).unwrap();
        assert_eq!(store.version("^!authring"), Some("v2"));
    }

    #[test]
    fn version_notes_invalidate() {
        let mut store = UserAttributeStore::new();
        store.add("^!keys", "v1", sample()).unwrap();
        assert!(store.note_version("^!keys", "v2"));
        assert_eq!(store.get("^!keys"), Err(TlvError::ValueNotFound));
        // same version again: nothing cached to drop
        assert!(!store.note_version("^!keys", "v2"));
    }
}
