//! Typed views over image group payloads.

use ciborium::Value;

use crate::error::{Result, SmpError};

/// One entry of the `images` array returned by the image state command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImageState {
    pub image: u32,
    pub slot: u32,
    pub version: String,
    pub hash: Vec<u8>,
    pub bootable: bool,
    pub pending: bool,
    pub confirmed: bool,
    pub active: bool,
    pub permanent: bool,
}

/// Response of the image state read command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImageStates {
    pub images: Vec<ImageState>,
    pub split_status: Option<i64>,
}

impl ImageStates {
    pub fn from_value(value: &Value) -> Result<Self> {
        let images = match map_get(value, "images") {
            Some(Value::Array(entries)) => entries
                .iter()
                .map(ImageState::from_value)
                .collect::<Result<Vec<_>>>()?,
            Some(other) => {
                return Err(SmpError::Payload(format!(
                    "`images` is not an array: {other:?}"
                )))
            }
            None => Vec::new(),
        };
        Ok(Self {
            images,
            split_status: map_get(value, "splitStatus").and_then(as_i64),
        })
    }

    /// Slot 0 of image 0, the image the device is running from.
    pub fn primary(&self) -> Option<&ImageState> {
        self.images.iter().find(|s| s.image == 0 && s.slot == 0)
    }

    /// Slot 1 of image 0, where uploads land.
    pub fn secondary(&self) -> Option<&ImageState> {
        self.images.iter().find(|s| s.image == 0 && s.slot == 1)
    }
}

impl ImageState {
    pub fn from_value(value: &Value) -> Result<Self> {
        if !matches!(value, Value::Map(_)) {
            return Err(SmpError::Payload(format!(
                "image state entry is not a map: {value:?}"
            )));
        }
        let flag = |key: &str| {
            map_get(value, key)
                .and_then(Value::as_bool)
                .unwrap_or(false)
        };
        Ok(Self {
            image: map_get(value, "image").and_then(as_i64).unwrap_or(0) as u32,
            slot: map_get(value, "slot").and_then(as_i64).unwrap_or(0) as u32,
            version: map_get(value, "version")
                .and_then(Value::as_text)
                .unwrap_or_default()
                .to_string(),
            hash: map_get(value, "hash")
                .and_then(Value::as_bytes)
                .cloned()
                .unwrap_or_default(),
            bootable: flag("bootable"),
            pending: flag("pending"),
            confirmed: flag("confirmed"),
            active: flag("active"),
            permanent: flag("permanent"),
        })
    }
}

/// Look up a text key in a CBOR map.
pub fn map_get<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    value.as_map().and_then(|entries| {
        entries
            .iter()
            .find(|(k, _)| k.as_text() == Some(key))
            .map(|(_, v)| v)
    })
}

pub fn as_i64(value: &Value) -> Option<i64> {
    value
        .as_integer()
        .and_then(|integer| i64::try_from(i128::from(integer)).ok())
}

/// Build a CBOR map from text keys.
pub fn cbor_map<const N: usize>(entries: [(&str, Value); N]) -> Value {
    Value::Map(
        entries
            .into_iter()
            .map(|(k, v)| (Value::Text(k.to_string()), v))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(slot: u64, version: &str, active: bool) -> Value {
        cbor_map([
            ("image", Value::Integer(0u64.into())),
            ("slot", Value::Integer(slot.into())),
            ("version", Value::Text(version.to_string())),
            ("hash", Value::Bytes(vec![0xaa; 4])),
            ("bootable", Value::Bool(true)),
            ("active", Value::Bool(active)),
            ("confirmed", Value::Bool(active)),
        ])
    }

    #[test]
    fn test_parse_two_slots() {
        let payload = cbor_map([
            (
                "images",
                Value::Array(vec![slot(0, "1.0.0", true), slot(1, "1.1.0", false)]),
            ),
            ("splitStatus", Value::Integer(0u64.into())),
        ]);

        let states = ImageStates::from_value(&payload).unwrap();
        assert_eq!(states.images.len(), 2);
        assert_eq!(states.split_status, Some(0));

        let primary = states.primary().unwrap();
        assert_eq!(primary.version, "1.0.0");
        assert!(primary.active && primary.confirmed);

        let secondary = states.secondary().unwrap();
        assert_eq!(secondary.version, "1.1.0");
        assert_eq!(secondary.hash, vec![0xaa; 4]);
        assert!(!secondary.pending);
    }

    #[test]
    fn test_missing_images_is_empty() {
        let states = ImageStates::from_value(&cbor_map([])).unwrap();
        assert!(states.images.is_empty());
        assert!(states.primary().is_none());
    }
}
