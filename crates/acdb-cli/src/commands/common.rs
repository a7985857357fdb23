//! Shared CLI helpers used across multiple commands.

use acdb_core::{KeyValue, SubgraphId};

/// Parses a `key=value` string of `u32`s for clap's `value_parser`, used to
/// build GKV/CKV/TKV pairs from the command line (e.g. `--gkv 10=100,11=1`).
pub fn parse_key_value_u32(s: &str) -> Result<KeyValue, String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid key=value pair '{s}'"))?;
    let key: u32 = key.trim().parse().map_err(|_| format!("invalid key '{key}'"))?;
    let value: u32 = value
        .trim()
        .parse()
        .map_err(|_| format!("invalid value '{value}'"))?;
    Ok(KeyValue::new(key, value))
}

/// Parses a comma-separated list of `key=value` pairs into a vector of
/// [`KeyValue`]s.
pub fn parse_key_vector(s: &str) -> Result<Vec<KeyValue>, String> {
    if s.trim().is_empty() {
        return Ok(Vec::new());
    }
    s.split(',').map(parse_key_value_u32).collect()
}

/// Parses a comma-separated list of subgraph IDs, accepting both decimal and
/// `0x`-prefixed hexadecimal.
pub fn parse_sg_ids(s: &str) -> Result<Vec<SubgraphId>, String> {
    s.split(',')
        .map(|part| parse_sg_id(part.trim()))
        .collect()
}

/// Parses a single subgraph ID, accepting both decimal and `0x`-prefixed
/// hexadecimal.
pub fn parse_sg_id(s: &str) -> Result<SubgraphId, String> {
    let raw = s.trim();
    let value = if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|_| format!("invalid subgraph id '{s}'"))?
    } else {
        raw.parse().map_err(|_| format!("invalid subgraph id '{s}'"))?
    };
    Ok(SubgraphId(value))
}
