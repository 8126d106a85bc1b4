//! Response Payload Parsing
//!
//! Decodes the two JSON payloads the state machine actually consumes:
//! the tag resolution reply (a single JSON string holding the tip layer
//! id) and the ancestry array. Validation is strict: anything that is
//! not exactly the expected shape is a protocol error, and the ancestry
//! is bounded so a hostile registry cannot make the engine chase an
//! unreasonable layer chain.

use crate::registry::{PullError, Result};
use crate::utils::constants::LAYERS_MAX;
use crate::utils::validation::layer_id_is_valid;

fn check_payload(payload: &[u8]) -> Result<()> {
    if payload.is_empty() {
        return Err(PullError::Protocol("empty payload".to_string()));
    }
    if payload.contains(&0) {
        return Err(PullError::Protocol("NUL byte in payload".to_string()));
    }
    Ok(())
}

/// Parse a tag resolution reply: a JSON document holding one string,
/// the tip layer id.
pub fn parse_id(payload: &[u8]) -> Result<String> {
    check_payload(payload)?;

    let id: String = serde_json::from_slice(payload)
        .map_err(|e| PullError::Protocol(format!("malformed id reply: {}", e)))?;

    if !layer_id_is_valid(&id) {
        return Err(PullError::Protocol(format!("invalid layer id: {:?}", id)));
    }

    Ok(id)
}

/// Parse an ancestry reply: a JSON array of layer ids, tip first on the
/// wire. The returned list is reversed to parent-first order, so the
/// base layer is at index 0 and the tip is last.
pub fn parse_ancestry(payload: &[u8]) -> Result<Vec<String>> {
    check_payload(payload)?;

    let mut layers: Vec<String> = serde_json::from_slice(payload)
        .map_err(|e| PullError::Protocol(format!("malformed ancestry reply: {}", e)))?;

    if layers.is_empty() {
        return Err(PullError::Protocol("empty ancestry".to_string()));
    }

    if layers.len() > LAYERS_MAX {
        return Err(PullError::TooManyLayers {
            count: layers.len(),
            limit: LAYERS_MAX,
        });
    }

    for id in &layers {
        if !layer_id_is_valid(id) {
            return Err(PullError::Protocol(format!("invalid layer id: {:?}", id)));
        }
    }

    for (n, id) in layers.iter().enumerate() {
        if layers[..n].contains(id) {
            return Err(PullError::Protocol(format!("duplicate layer id: {}", id)));
        }
    }

    layers.reverse();
    Ok(layers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex_id(byte: u8) -> String {
        format!("{:02x}", byte).repeat(32)
    }

    #[test]
    fn test_parse_id() {
        let id = hex_id(0xab);
        let parsed = parse_id(format!("\"{}\"", id).as_bytes()).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_parse_id_rejects_bad_input() {
        let id = hex_id(0xab);

        // Empty and NUL-carrying payloads.
        assert!(parse_id(b"").is_err());
        assert!(parse_id(b"\"abc\0def\"").is_err());

        // Trailing garbage after a valid document.
        assert!(parse_id(format!("\"{}\" x", id).as_bytes()).is_err());

        // Wrong JSON shape.
        assert!(parse_id(format!("[\"{}\"]", id).as_bytes()).is_err());
        assert!(parse_id(b"42").is_err());

        // Bad id grammar.
        assert!(parse_id(b"\"nothex\"").is_err());
        assert!(parse_id(format!("\"{}\"", id.to_uppercase()).as_bytes()).is_err());
    }

    #[test]
    fn test_parse_ancestry_reverses_wire_order() {
        let tip = hex_id(0x02);
        let base = hex_id(0x01);
        let payload = format!("[\"{}\", \"{}\"]", tip, base);

        let layers = parse_ancestry(payload.as_bytes()).unwrap();
        assert_eq!(layers, vec![base, tip]);
    }

    #[test]
    fn test_parse_ancestry_single_layer() {
        let id = hex_id(0x03);
        let layers = parse_ancestry(format!("[\"{}\"]", id).as_bytes()).unwrap();
        assert_eq!(layers, vec![id]);
    }

    #[test]
    fn test_parse_ancestry_rejects_bad_input() {
        let id = hex_id(0x01);

        assert!(parse_ancestry(b"").is_err());
        assert!(parse_ancestry(b"[]").is_err());
        assert!(parse_ancestry(b"{}").is_err());
        assert!(parse_ancestry(format!("\"{}\"", id).as_bytes()).is_err());

        // Duplicates.
        let dup = format!("[\"{}\", \"{}\"]", id, id);
        assert!(parse_ancestry(dup.as_bytes()).is_err());

        // Invalid member id.
        assert!(parse_ancestry(b"[\"tooshort\"]").is_err());
    }

    #[test]
    fn test_parse_ancestry_layer_limit() {
        let at_limit: Vec<String> = (0..LAYERS_MAX).map(|i| format!("{:064x}", i)).collect();
        let payload = serde_json::to_vec(&at_limit).unwrap();
        assert_eq!(parse_ancestry(&payload).unwrap().len(), LAYERS_MAX);

        let over: Vec<String> = (0..LAYERS_MAX + 1).map(|i| format!("{:064x}", i)).collect();
        let payload = serde_json::to_vec(&over).unwrap();
        assert!(matches!(
            parse_ancestry(&payload),
            Err(PullError::TooManyLayers { .. })
        ));
    }

    #[test]
    fn test_parse_ancestry_round_trip() {
        for len in [1usize, 2, 7, 64] {
            let parent_first: Vec<String> = (0..len).map(|i| format!("{:064x}", i)).collect();
            let mut wire = parent_first.clone();
            wire.reverse();
            let payload = serde_json::to_vec(&wire).unwrap();
            assert_eq!(parse_ancestry(&payload).unwrap(), parent_first);
        }
    }
}
