use super::Value;

/// encodes `value` in canonical form (dictionary keys in byte order).
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_into(value, &mut buf);
    buf
}

fn encode_bytes(bytes: &[u8], buf: &mut Vec<u8>) {
    buf.extend_from_slice(bytes.len().to_string().as_bytes());
    buf.push(b':');
    buf.extend_from_slice(bytes);
}

fn encode_into(value: &Value, buf: &mut Vec<u8>) {
    match value {
        Value::Integer(i) => {
            buf.push(b'i');
            buf.extend_from_slice(i.to_string().as_bytes());
            buf.push(b'e');
        }
        Value::Bytes(bytes) => encode_bytes(bytes, buf),
        Value::List(list) => {
            buf.push(b'l');
            list.iter().for_each(|item| encode_into(item, buf));
            buf.push(b'e');
        }
        Value::Dict(dict) => {
            buf.push(b'd');
            // BTreeMap iteration is already in byte-lexicographic key order.
            for (key, item) in dict {
                encode_bytes(key, buf);
                encode_into(item, buf);
            }
            buf.push(b'e');
        }
    }
}
