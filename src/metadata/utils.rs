pub const USER_PREFIX: &[u8] = b"#user#";
pub const NODE_PREFIX: &[u8] = b"#node#";
pub const MAX_NODE_ID_KEY: &[u8] = b"#max_node_id";
/// Holds the big-endian applied index; written in the same batch as every apply.
pub const APPLIED_KEY: &[u8] = b"#applied";

/// Helper that turns a u64 into an 8-byte big-endian array
pub fn u64be_bytes(x: u64) -> [u8; 8] {
    x.to_be_bytes()
}

pub fn be_to_u64(b: &[u8]) -> Option<u64> {
    let arr: [u8; 8] = b.try_into().ok()?;
    Some(u64::from_be_bytes(arr))
}

/// Build a user key that looks like `#user#alice`
pub fn kv_user_key<S: AsRef<str>>(user_id: S) -> Vec<u8> {
    let s = user_id.as_ref();
    let mut v = Vec::with_capacity(USER_PREFIX.len() + s.len());
    v.extend_from_slice(USER_PREFIX);
    v.extend_from_slice(s.as_bytes());
    v
}

/// Node keys embed the big-endian id so prefix scans come back in id order.
pub fn kv_node_key(id: u64) -> Vec<u8> {
    let mut v = Vec::with_capacity(NODE_PREFIX.len() + 8);
    v.extend_from_slice(NODE_PREFIX);
    v.extend_from_slice(&u64be_bytes(id));
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_keys_sort_by_id() {
        let mut keys = vec![kv_node_key(300), kv_node_key(2), kv_node_key(17)];
        keys.sort();
        assert_eq!(keys, vec![kv_node_key(2), kv_node_key(17), kv_node_key(300)]);
        assert!(kv_node_key(1).starts_with(NODE_PREFIX));
    }

    #[test]
    fn test_be_roundtrip() {
        assert_eq!(be_to_u64(&u64be_bytes(42)), Some(42));
        assert_eq!(be_to_u64(b"short"), None);
    }
}
