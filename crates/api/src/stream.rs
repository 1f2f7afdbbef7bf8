//! The resource stream's wire format.
//!
//! A stream is a sequence of frames; each frame is a JSON-encoded diff
//! followed by a single carriage-return byte.  There is no length prefix, so
//! readers buffer until they see the delimiter.  The first frame a
//! subscriber receives is a full snapshot carried in the `new` bucket.

use crate::registry::{RegistryError, ResourceRegistry};
use ferry_core::{Resource, ResourceDiff, ResourceMap};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Separates consecutive JSON frames on the wire.
pub const FRAME_DELIMITER: u8 = b'\r';

/// A diff as it appears on the wire: resources are kept as raw JSON values
/// until the receiver decodes them through its registry.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RawDiff {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub new: BTreeMap<String, Vec<Value>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub changed: BTreeMap<String, Vec<Value>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub gone: BTreeMap<String, Vec<Value>>,
}

fn encode_map(map: &ResourceMap) -> serde_json::Result<BTreeMap<String, Vec<Value>>> {
    let mut out = BTreeMap::new();
    for (type_tag, queue) in map.iter() {
        let mut values = Vec::with_capacity(queue.len());
        for r in queue.iter() {
            values.push(r.to_value()?);
        }
        out.insert(type_tag.clone(), values);
    }
    Ok(out)
}

fn decode_map(
    raw: BTreeMap<String, Vec<Value>>,
    registry: &ResourceRegistry,
) -> Result<ResourceMap, RegistryError> {
    let mut map = ResourceMap::new();
    for (_type_tag, values) in raw {
        for value in values {
            map.push(registry.decode(value)?);
        }
    }
    Ok(map)
}

impl RawDiff {
    pub fn encode(diff: &ResourceDiff) -> serde_json::Result<Self> {
        Ok(Self {
            new: encode_map(&diff.new)?,
            changed: encode_map(&diff.changed)?,
            gone: encode_map(&diff.gone)?,
        })
    }

    pub fn decode(self, registry: &ResourceRegistry) -> Result<ResourceDiff, RegistryError> {
        Ok(ResourceDiff {
            new: decode_map(self.new, registry)?,
            changed: decode_map(self.changed, registry)?,
            gone: decode_map(self.gone, registry)?,
        })
    }

    /// Serializes the diff into a delimited wire frame.
    pub fn to_frame(&self) -> serde_json::Result<Vec<u8>> {
        let mut frame = serde_json::to_vec(self)?;
        frame.push(FRAME_DELIMITER);
        Ok(frame)
    }
}

/// Serializes resources into the JSON array body served by the resources
/// endpoint.
pub fn encode_resources(resources: &[Box<dyn Resource>]) -> serde_json::Result<Vec<Value>> {
    resources.iter().map(|r| r.to_value()).collect()
}
