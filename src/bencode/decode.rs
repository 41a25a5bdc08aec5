use super::{CodecError, Dict, Value};
use std::collections::BTreeSet;
use std::ops::Range;
use tokio_util::bytes::Bytes;

const MAX_DEPTH: usize = 64;

/// decodes exactly one value spanning all of `data`.
pub fn decode(data: &[u8]) -> Result<Value, CodecError> {
    let mut decoder = Decoder { data, pos: 0 };
    let value = decoder.value(0)?;
    decoder.finish()?;
    Ok(value)
}

/// byte range of the value stored under `key` in the top level dictionary of `data`.
///
/// the whole input is checked like `decode` does. the range points into `data` as it was
/// received, so hashing it matches what the sender hashed even when its keys were not sorted.
pub fn dict_value_span(
    data: &[u8],
    key: &[u8],
) -> Result<Option<Range<usize>>, CodecError> {
    let mut decoder = Decoder { data, pos: 0 };
    match decoder.peek()? {
        b'd' => {}
        byte => return Err(CodecError::UnexpectedByte { byte, pos: 0 }),
    }

    let mut span = None;
    decoder.dict_entries(0, |name, _, range| {
        if &name[..] == key {
            span = Some(range);
        }
    })?;
    decoder.finish()?;
    Ok(span)
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn finish(&self) -> Result<(), CodecError> {
        if self.pos != self.data.len() {
            return Err(CodecError::TrailingData(self.pos));
        }
        Ok(())
    }

    fn peek(&self) -> Result<u8, CodecError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(CodecError::UnexpectedEof(self.pos))
    }

    fn value(&mut self, depth: usize) -> Result<Value, CodecError> {
        if depth > MAX_DEPTH {
            return Err(CodecError::NestingTooDeep(MAX_DEPTH));
        }

        match self.peek()? {
            b'i' => self.integer().map(Value::Integer),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => self.bytes().map(Value::Bytes),
            byte => Err(CodecError::UnexpectedByte {
                byte,
                pos: self.pos,
            }),
        }
    }

    /// reads bytes up to (not including) `terminator`, leaving `pos` just past it.
    fn digits_until(&mut self, terminator: u8) -> Result<&'a [u8], CodecError> {
        let start = self.pos;
        let len = self.data[start..]
            .iter()
            .position(|&b| b == terminator)
            .ok_or(CodecError::UnexpectedEof(self.data.len()))?;

        self.pos = start + len + 1;
        Ok(&self.data[start..start + len])
    }

    fn integer(&mut self) -> Result<i64, CodecError> {
        let start = self.pos;
        self.pos += 1; // 'i'
        let raw = self.digits_until(b'e')?;

        let digits = raw.strip_prefix(b"-").unwrap_or(raw);
        let canonical = match digits {
            [] => false,
            [b'0'] => raw.len() == 1, // "-0" is not canonical
            [b'0', ..] => false,
            _ => digits.iter().all(u8::is_ascii_digit),
        };
        if !canonical {
            return Err(CodecError::InvalidInteger(start));
        }

        // all ascii digits (and maybe a '-') so this is valid utf8.
        std::str::from_utf8(raw)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(CodecError::InvalidInteger(start))
    }

    fn bytes(&mut self) -> Result<Bytes, CodecError> {
        let start = self.pos;
        let raw = self.digits_until(b':')?;

        let canonical = match raw {
            [] => false,
            [b'0'] => true,
            [b'0', ..] => false,
            _ => raw.iter().all(u8::is_ascii_digit),
        };
        if !canonical {
            return Err(CodecError::InvalidLength(start));
        }

        let len: usize = std::str::from_utf8(raw)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(CodecError::InvalidLength(start))?;

        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(CodecError::UnexpectedEof(self.data.len()))?;

        let bytes = Bytes::copy_from_slice(&self.data[self.pos..end]);
        self.pos = end;
        Ok(bytes)
    }

    fn list(&mut self, depth: usize) -> Result<Value, CodecError> {
        self.pos += 1; // 'l'
        let mut list = Vec::new();

        while self.peek()? != b'e' {
            list.push(self.value(depth + 1)?);
        }
        self.pos += 1;

        Ok(Value::List(list))
    }

    fn dict(&mut self, depth: usize) -> Result<Value, CodecError> {
        let mut dict = Dict::new();
        self.dict_entries(depth, |key, value, _| {
            dict.insert(key, value);
        })?;
        Ok(Value::Dict(dict))
    }

    /// walks a `d...e` dictionary. keys may come in any order but must be unique byte strings,
    /// `on_entry` also gets the range of the input each value was decoded from.
    fn dict_entries(
        &mut self,
        depth: usize,
        mut on_entry: impl FnMut(Bytes, Value, Range<usize>),
    ) -> Result<(), CodecError> {
        self.pos += 1; // 'd'
        let mut keys = BTreeSet::new();

        while self.peek()? != b'e' {
            let key_pos = self.pos;
            if !self.peek()?.is_ascii_digit() {
                return Err(CodecError::NonStringKey(key_pos));
            }
            let key = self.bytes()?;
            if !keys.insert(key.clone()) {
                return Err(CodecError::DuplicateKey(key_pos));
            }

            let start = self.pos;
            let value = self.value(depth + 1)?;
            on_entry(key, value, start..self.pos);
        }
        self.pos += 1;

        Ok(())
    }
}
