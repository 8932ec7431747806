//! HPACK (RFC 7541) for the client side.
//!
//! The request path uses an in-tree encoder: a static-table lookup plus a
//! dynamic table whose maximum size tracks the peer's HEADER_TABLE_SIZE
//! setting, with the required table-size-update emitted at the start of the
//! next header block after a change. Literals are emitted without Huffman
//! coding. Response header blocks are decoded with `fluke-hpack`, which
//! handles Huffman-coded literals.
//!
//! The encoder owns mutable dynamic-table state tied to the wire order of
//! header blocks, so access to it is serialized by the connection.

use std::collections::VecDeque;

use bytes::{BufMut, BytesMut};

use super::frame::HeaderField;

/// RFC 7541 Appendix A.
static STATIC_TABLE: &[(&[u8], &[u8])] = &[
    (b":authority", b""),
    (b":method", b"GET"),
    (b":method", b"POST"),
    (b":path", b"/"),
    (b":path", b"/index.html"),
    (b":scheme", b"http"),
    (b":scheme", b"https"),
    (b":status", b"200"),
    (b":status", b"204"),
    (b":status", b"206"),
    (b":status", b"304"),
    (b":status", b"400"),
    (b":status", b"404"),
    (b":status", b"500"),
    (b"accept-charset", b""),
    (b"accept-encoding", b"gzip, deflate"),
    (b"accept-language", b""),
    (b"accept-ranges", b""),
    (b"accept", b""),
    (b"access-control-allow-origin", b""),
    (b"age", b""),
    (b"allow", b""),
    (b"authorization", b""),
    (b"cache-control", b""),
    (b"content-disposition", b""),
    (b"content-encoding", b""),
    (b"content-language", b""),
    (b"content-length", b""),
    (b"content-location", b""),
    (b"content-range", b""),
    (b"content-type", b""),
    (b"cookie", b""),
    (b"date", b""),
    (b"etag", b""),
    (b"expect", b""),
    (b"expires", b""),
    (b"from", b""),
    (b"host", b""),
    (b"if-match", b""),
    (b"if-modified-since", b""),
    (b"if-none-match", b""),
    (b"if-range", b""),
    (b"if-unmodified-since", b""),
    (b"last-modified", b""),
    (b"link", b""),
    (b"location", b""),
    (b"max-forwards", b""),
    (b"proxy-authenticate", b""),
    (b"proxy-authorization", b""),
    (b"range", b""),
    (b"referer", b""),
    (b"refresh", b""),
    (b"retry-after", b""),
    (b"server", b""),
    (b"set-cookie", b""),
    (b"strict-transport-security", b""),
    (b"transfer-encoding", b""),
    (b"user-agent", b""),
    (b"vary", b""),
    (b"via", b""),
    (b"www-authenticate", b""),
];

/// Fields whose values must never enter a compression table.
fn is_sensitive(name: &[u8]) -> bool {
    name == b"authorization" || name == b"cookie" || name == b"set-cookie"
}

fn entry_size(name: &[u8], value: &[u8]) -> usize {
    name.len() + value.len() + 32
}

#[derive(Debug)]
struct DynamicTable {
    entries: VecDeque<(Vec<u8>, Vec<u8>)>,
    size: usize,
    max_size: usize,
}

impl DynamicTable {
    fn new(max_size: usize) -> DynamicTable {
        DynamicTable {
            entries: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    fn resize(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.evict();
    }

    fn insert(&mut self, name: Vec<u8>, value: Vec<u8>) {
        let added = entry_size(&name, &value);
        if added > self.max_size {
            // An entry larger than the table empties it.
            self.entries.clear();
            self.size = 0;
            return;
        }
        self.size += added;
        self.entries.push_front((name, value));
        self.evict();
    }

    fn evict(&mut self) {
        while self.size > self.max_size {
            if let Some((name, value)) = self.entries.pop_back() {
                self.size -= entry_size(&name, &value);
            } else {
                break;
            }
        }
    }

    /// Finds an entry by name, preferring one whose value matches too.
    /// The returned index is zero-based within the dynamic table.
    fn search(&self, name: &[u8], value: &[u8]) -> Option<(usize, bool)> {
        let mut name_only = None;
        for (idx, (n, v)) in self.entries.iter().enumerate() {
            if n != name {
                continue;
            }
            if v == value {
                return Some((idx, true));
            }
            if name_only.is_none() {
                name_only = Some((idx, false));
            }
        }
        name_only
    }
}

/// Request-header block encoder.
#[derive(Debug)]
pub(crate) struct Encoder {
    table: DynamicTable,
    /// A table-size change requested via SETTINGS, emitted as a dynamic
    /// table size update at the start of the next block.
    pending_resize: Option<usize>,
}

impl Encoder {
    pub(crate) fn new(max_table_size: u32) -> Encoder {
        Encoder {
            table: DynamicTable::new(max_table_size as usize),
            pending_resize: None,
        }
    }

    /// Records the peer's new HEADER_TABLE_SIZE. Takes effect at the start
    /// of the next encoded block, where RFC 7541 requires the size update
    /// to appear.
    pub(crate) fn update_max_table_size(&mut self, size: u32) {
        if size as usize != self.table.max_size {
            self.pending_resize = Some(size as usize);
        }
    }

    /// Encodes one header block. `fields` must already be in wire order
    /// (pseudo-headers first).
    pub(crate) fn encode_block<'a, I>(&mut self, fields: I) -> BytesMut
    where
        I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
    {
        let mut dst = BytesMut::new();

        if let Some(size) = self.pending_resize.take() {
            self.table.resize(size);
            encode_int(&mut dst, size as u64, 5, 0x20);
        }

        for (name, value) in fields {
            self.encode_field(&mut dst, name, value);
        }

        dst
    }

    fn encode_field(&mut self, dst: &mut BytesMut, name: &[u8], value: &[u8]) {
        if is_sensitive(name) {
            let name_idx = self.find_name(name);
            encode_int(dst, name_idx.unwrap_or(0) as u64, 4, 0x10);
            if name_idx.is_none() {
                encode_str(dst, name);
            }
            encode_str(dst, value);
            return;
        }

        // Exact match: a single indexed field.
        if let Some(idx) = self.find_exact(name, value) {
            encode_int(dst, idx as u64, 7, 0x80);
            return;
        }

        let name_idx = self.find_name(name);

        // An entry that could never fit the table is not worth evicting
        // everything for; send it as a plain literal.
        if entry_size(name, value) > self.table.max_size {
            encode_int(dst, name_idx.unwrap_or(0) as u64, 4, 0x00);
            if name_idx.is_none() {
                encode_str(dst, name);
            }
            encode_str(dst, value);
            return;
        }

        // Literal with incremental indexing, name possibly indexed.
        encode_int(dst, name_idx.unwrap_or(0) as u64, 6, 0x40);
        if name_idx.is_none() {
            encode_str(dst, name);
        }
        encode_str(dst, value);
        self.table.insert(name.to_vec(), value.to_vec());
    }

    fn find_exact(&self, name: &[u8], value: &[u8]) -> Option<usize> {
        for (idx, (n, v)) in STATIC_TABLE.iter().enumerate() {
            if *n == name && *v == value {
                return Some(idx + 1);
            }
        }
        match self.table.search(name, value) {
            Some((idx, true)) => Some(STATIC_TABLE.len() + 1 + idx),
            _ => None,
        }
    }

    fn find_name(&self, name: &[u8]) -> Option<usize> {
        for (idx, (n, _)) in STATIC_TABLE.iter().enumerate() {
            if *n == name {
                return Some(idx + 1);
            }
        }
        self.table
            .search(name, b"")
            .map(|(idx, _)| STATIC_TABLE.len() + 1 + idx)
    }
}

/// Prefixed integer representation (RFC 7541 section 5.1).
fn encode_int(dst: &mut BytesMut, mut value: u64, prefix_bits: u8, pattern: u8) {
    let limit = (1u64 << prefix_bits) - 1;
    if value < limit {
        dst.put_u8(pattern | value as u8);
        return;
    }
    dst.put_u8(pattern | limit as u8);
    value -= limit;
    while value >= 128 {
        dst.put_u8((value % 128 + 128) as u8);
        value /= 128;
    }
    dst.put_u8(value as u8);
}

/// String literal, raw octets (H bit clear).
fn encode_str(dst: &mut BytesMut, raw: &[u8]) {
    encode_int(dst, raw.len() as u64, 7, 0);
    dst.put_slice(raw);
}

/// Response header block decoder. Wraps `fluke-hpack`, which maintains the
/// dynamic table sized by our advertised HEADER_TABLE_SIZE default.
pub(crate) struct Decoder {
    inner: fluke_hpack::Decoder<'static>,
}

impl std::fmt::Debug for Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decoder").finish()
    }
}

impl Decoder {
    pub(crate) fn new() -> Decoder {
        Decoder {
            inner: fluke_hpack::Decoder::new(),
        }
    }

    pub(crate) fn decode(&mut self, block: &[u8]) -> Result<Vec<HeaderField>, String> {
        let pairs = self
            .inner
            .decode(block)
            .map_err(|e| format!("hpack decode error: {e:?}"))?;
        Ok(pairs
            .into_iter()
            .map(|(name, value)| HeaderField {
                name: String::from_utf8_lossy(&name).into_owned(),
                value: String::from_utf8_lossy(&value).into_owned(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(block: &[u8]) -> Vec<HeaderField> {
        Decoder::new().decode(block).unwrap()
    }

    #[test]
    fn static_indexed_field() {
        let mut enc = Encoder::new(4096);
        let block = enc.encode_block(vec![(b":method".as_ref(), b"GET".as_ref())]);
        // :method: GET is static entry 2
        assert_eq!(&block[..], &[0x82]);
    }

    #[test]
    fn literal_roundtrips_through_decoder() {
        let mut enc = Encoder::new(4096);
        let block = enc.encode_block(vec![
            (b":method".as_ref(), b"GET".as_ref()),
            (b":path".as_ref(), b"/search?q=1".as_ref()),
            (b"x-trace".as_ref(), b"abc123".as_ref()),
        ]);
        let fields = decode_all(&block);
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[0].name, ":method");
        assert_eq!(fields[0].value, "GET");
        assert_eq!(fields[1].value, "/search?q=1");
        assert_eq!(fields[2].name, "x-trace");
        assert_eq!(fields[2].value, "abc123");
    }

    #[test]
    fn repeated_field_uses_dynamic_table() {
        let mut enc = Encoder::new(4096);
        let first = enc.encode_block(vec![(b"x-custom".as_ref(), b"v1".as_ref())]);
        let second = enc.encode_block(vec![(b"x-custom".as_ref(), b"v1".as_ref())]);
        // The second block is a single indexed reference to the first
        // dynamic entry (index 62).
        assert!(second.len() < first.len());
        assert_eq!(&second[..], &[0x80 | 62]);
    }

    #[test]
    fn sensitive_fields_are_never_indexed() {
        let mut enc = Encoder::new(4096);
        let first = enc.encode_block(vec![(b"authorization".as_ref(), b"Bearer t".as_ref())]);
        let second = enc.encode_block(vec![(b"authorization".as_ref(), b"Bearer t".as_ref())]);
        // No dynamic entry was created, so the encoding never shrinks.
        assert_eq!(first, second);
        // Never-indexed pattern on the first octet.
        assert_eq!(first[0] & 0xf0, 0x10);
    }

    #[test]
    fn table_resize_emitted_once_at_block_start() {
        let mut enc = Encoder::new(4096);
        enc.update_max_table_size(0);
        let block = enc.encode_block(vec![(b"x-a".as_ref(), b"1".as_ref())]);
        // 0x20 pattern with value 0
        assert_eq!(block[0], 0x20);

        // Sized-zero table means nothing is retained across blocks.
        let again = enc.encode_block(vec![(b"x-a".as_ref(), b"1".as_ref())]);
        assert_ne!(again[0] & 0x80, 0x80);
    }

    #[test]
    fn eviction_keeps_size_bounded() {
        let mut table = DynamicTable::new(100);
        table.insert(b"aaaa".to_vec(), b"bbbb".to_vec()); // 40
        table.insert(b"cccc".to_vec(), b"dddd".to_vec()); // 40
        table.insert(b"eeee".to_vec(), b"ffff".to_vec()); // 40, evicts oldest
        assert!(table.size <= 100);
        assert_eq!(table.entries.len(), 2);
        assert_eq!(table.entries.back().unwrap().0, b"cccc".to_vec());
    }

    #[test]
    fn prefixed_integer_encoding() {
        let mut dst = BytesMut::new();
        encode_int(&mut dst, 1337, 5, 0);
        assert_eq!(&dst[..], &[0x1f, 0x9a, 0x0a]);
    }
}
