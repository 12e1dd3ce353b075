//! Vendor sub-descriptor and string-descriptor parsing.
//!
//! A device that speaks the multiplex protocol carries a vendor sub-descriptor
//! in its interface descriptor chain:
//!
//! ```text
//! ┌──────────┬──────────┬──────────┬─────────┬───────────┬──────────────┬──────────────────┐
//! │ bLength  │ bDescr   │ UUID     │ iNodeId │ iNodeName │ bNumVersions │ versions          │
//! │ (1B)     │ Type 0x5A│ (16B)    │ (1B)    │ (1B)      │ (1B)         │ (u16 LE × count)  │
//! └──────────┴──────────┴──────────┴─────────┴───────────┴──────────────┴──────────────────┘
//! ```
//!
//! `bLength` must equal `21 + 2·bNumVersions` and the UUID must equal
//! [`DETECTION_UUID`]; anything else marks the device Invalid.

use buslink_backend::ControlRequest;

use crate::error::{ClaimError, Result};

/// Descriptor type of the vendor sub-descriptor.
pub const VENDOR_SUB_DESCRIPTOR_TYPE: u8 = 0x5A;

/// Detection constant a protocol-speaking device embeds in its descriptor.
pub const DETECTION_UUID: [u8; 16] = [
    0xb9, 0xf5, 0xe8, 0xa2, 0x6d, 0x43, 0x4f, 0x2b, 0x9c, 0x1a, 0x7e, 0x85, 0xd0, 0xc4, 0xf3,
    0x18,
];

const FIXED_PART: usize = 21;

const GET_DESCRIPTOR: u8 = 6;
const STRING_TYPE: u8 = 3;

/// Parsed vendor sub-descriptor fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorDescriptor {
    /// String-descriptor index of the declared node identifier (0 = absent).
    pub node_id_index: u8,
    /// String-descriptor index of the declared node name (0 = absent).
    pub node_name_index: u8,
    /// Supported protocol versions in device-preference order.
    pub protocol_versions: Vec<u16>,
}

/// Walk an interface descriptor chain and parse the vendor sub-descriptor.
pub fn find_vendor_descriptor(block: &[u8]) -> Result<VendorDescriptor> {
    let mut offset = 0;
    while offset + 2 <= block.len() {
        let len = block[offset] as usize;
        if len < 2 || offset + len > block.len() {
            return Err(ClaimError::Invalid(format!(
                "malformed descriptor chain at offset {offset}"
            )));
        }
        if block[offset + 1] == VENDOR_SUB_DESCRIPTOR_TYPE {
            return parse_vendor_descriptor(&block[offset..offset + len]);
        }
        offset += len;
    }
    Err(ClaimError::Invalid(
        "no vendor sub-descriptor in interface chain".to_string(),
    ))
}

fn parse_vendor_descriptor(desc: &[u8]) -> Result<VendorDescriptor> {
    if desc.len() < FIXED_PART {
        return Err(ClaimError::Invalid(format!(
            "vendor sub-descriptor too short ({} bytes)",
            desc.len()
        )));
    }
    if desc[2..18] != DETECTION_UUID {
        return Err(ClaimError::Invalid(
            "vendor sub-descriptor UUID mismatch".to_string(),
        ));
    }

    let declared_versions = desc[20] as usize;
    if desc.len() != FIXED_PART + 2 * declared_versions {
        return Err(ClaimError::Invalid(format!(
            "vendor sub-descriptor length {} does not match declared version count {}",
            desc.len(),
            declared_versions
        )));
    }

    let protocol_versions: Vec<u16> = desc[FIXED_PART..]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    if protocol_versions.len() != declared_versions {
        return Err(ClaimError::Invalid(format!(
            "parsed {} protocol versions, descriptor declares {}",
            protocol_versions.len(),
            declared_versions
        )));
    }

    Ok(VendorDescriptor {
        node_id_index: desc[18],
        node_name_index: desc[19],
        protocol_versions,
    })
}

/// Build a vendor sub-descriptor (test scaffolding and device simulators).
pub fn build_vendor_descriptor(
    uuid: &[u8; 16],
    node_id_index: u8,
    node_name_index: u8,
    versions: &[u16],
) -> Vec<u8> {
    let mut desc = Vec::with_capacity(FIXED_PART + 2 * versions.len());
    desc.push((FIXED_PART + 2 * versions.len()) as u8);
    desc.push(VENDOR_SUB_DESCRIPTOR_TYPE);
    desc.extend_from_slice(uuid);
    desc.push(node_id_index);
    desc.push(node_name_index);
    desc.push(versions.len() as u8);
    for v in versions {
        desc.extend_from_slice(&v.to_le_bytes());
    }
    desc
}

/// Control request reading the string-descriptor language table.
pub fn language_table_request() -> ControlRequest {
    ControlRequest {
        request_type: 0x80,
        request: GET_DESCRIPTOR,
        value: (STRING_TYPE as u16) << 8,
        index: 0,
    }
}

/// Control request reading one string descriptor in a given language.
pub fn string_request(index: u8, language: u16) -> ControlRequest {
    ControlRequest {
        request_type: 0x80,
        request: GET_DESCRIPTOR,
        value: ((STRING_TYPE as u16) << 8) | index as u16,
        index: language,
    }
}

/// Pick the first language id out of the language table.
pub fn parse_language_table(bytes: &[u8]) -> Result<u16> {
    if bytes.len() < 4 || bytes[1] != STRING_TYPE {
        return Err(ClaimError::Device(
            "malformed string language table".to_string(),
        ));
    }
    Ok(u16::from_le_bytes([bytes[2], bytes[3]]))
}

/// Decode a UTF-16 string descriptor (header skipped).
pub fn parse_string_descriptor(bytes: &[u8]) -> Result<String> {
    if bytes.len() < 2 || bytes[1] != STRING_TYPE {
        return Err(ClaimError::Device("malformed string descriptor".to_string()));
    }
    let units: Vec<u16> = bytes[2..]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units)
        .map_err(|_| ClaimError::Device("string descriptor is not valid UTF-16".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A plain interface descriptor followed by the vendor sub-descriptor.
    fn chain_with(vendor: Vec<u8>) -> Vec<u8> {
        let mut block = vec![9, 0x04, 0, 0, 2, 0xFF, 0, 0, 0];
        block.extend_from_slice(&vendor);
        block
    }

    #[test]
    fn parses_valid_descriptor() {
        let block = chain_with(build_vendor_descriptor(&DETECTION_UUID, 4, 5, &[2, 1]));
        let vd = find_vendor_descriptor(&block).expect("descriptor should parse");
        assert_eq!(vd.node_id_index, 4);
        assert_eq!(vd.node_name_index, 5);
        assert_eq!(vd.protocol_versions, vec![2, 1]);
    }

    #[test]
    fn missing_descriptor_is_invalid() {
        let block = vec![9, 0x04, 0, 0, 2, 0xFF, 0, 0, 0];
        assert!(matches!(
            find_vendor_descriptor(&block),
            Err(ClaimError::Invalid(_))
        ));
    }

    #[test]
    fn uuid_mismatch_is_invalid() {
        let mut wrong = DETECTION_UUID;
        wrong[0] ^= 0xFF;
        let block = chain_with(build_vendor_descriptor(&wrong, 4, 5, &[1]));
        assert!(matches!(
            find_vendor_descriptor(&block),
            Err(ClaimError::Invalid(_))
        ));
    }

    #[test]
    fn length_count_mismatch_is_invalid() {
        let mut vendor = build_vendor_descriptor(&DETECTION_UUID, 4, 5, &[2, 1]);
        vendor[20] = 3; // declare one more version than present
        // fix bLength to keep the chain walkable but inconsistent with count
        let block = chain_with(vendor);
        assert!(matches!(
            find_vendor_descriptor(&block),
            Err(ClaimError::Invalid(_))
        ));
    }

    #[test]
    fn truncated_chain_is_invalid() {
        let mut block = chain_with(build_vendor_descriptor(&DETECTION_UUID, 4, 5, &[1]));
        block[9] = 200; // vendor bLength overruns the block
        assert!(matches!(
            find_vendor_descriptor(&block),
            Err(ClaimError::Invalid(_))
        ));
    }

    #[test]
    fn zero_versions_allowed_by_codec() {
        let block = chain_with(build_vendor_descriptor(&DETECTION_UUID, 0, 0, &[]));
        let vd = find_vendor_descriptor(&block).expect("empty version list should parse");
        assert!(vd.protocol_versions.is_empty());
    }

    #[test]
    fn language_table_first_entry() {
        let lang = parse_language_table(&[4, 3, 0x09, 0x04]).expect("table should parse");
        assert_eq!(lang, 0x0409);
        assert!(parse_language_table(&[2, 3]).is_err());
        assert!(parse_language_table(&[4, 2, 0x09, 0x04]).is_err());
    }

    #[test]
    fn string_descriptor_roundtrip() {
        let mut bytes = vec![0u8, STRING_TYPE];
        for unit in "robot-7".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        bytes[0] = bytes.len() as u8;
        assert_eq!(
            parse_string_descriptor(&bytes).expect("string should parse"),
            "robot-7"
        );
    }

    #[test]
    fn string_descriptor_wrong_type() {
        assert!(parse_string_descriptor(&[4, 2, 0, 0]).is_err());
    }

    #[test]
    fn request_builders() {
        let lang = language_table_request();
        assert_eq!(lang.value, 0x0300);
        assert_eq!(lang.index, 0);

        let req = string_request(4, 0x0409);
        assert_eq!(req.value, 0x0304);
        assert_eq!(req.index, 0x0409);
    }
}
