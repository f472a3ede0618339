//! RESP wire protocol: limits, shared reply fragments, and the
//! restartable request parser.

pub mod parser;

use bytes::Bytes;
use std::sync::OnceLock;

/// Max size of an inline request or a length line.
pub const PROTO_INLINE_MAX_SIZE: usize = 64 * 1024;
/// Read chunk per readable event.
pub const PROTO_IOBUF_LEN: usize = 16 * 1024;
/// Reply spill blocks are allocated at least this large.
pub const PROTO_REPLY_CHUNK_BYTES: usize = 16 * 1024;
/// Bulk arguments at least this large take the zero-copy path.
pub const PROTO_MBULK_BIG_ARG: usize = 32 * 1024;
/// Upper bound on the element count of a multi-bulk request.
pub const PROTO_MAX_MULTIBULK_LEN: i64 = 1024 * 1024;
/// Soft cap on bytes written per writable event.
pub const NET_MAX_WRITES_PER_EVENT: usize = 64 * 1024;

pub const CRLF: &[u8] = b"\r\n";

/// Small aggregate/bulk headers (`*0\r\n` .. `$31\r\n`) are shared
/// constants so the formatters never re-render them.
pub const SHARED_BULKHDR_LEN: i64 = 32;

pub struct SharedHeaders {
    mbulk: Vec<Bytes>,
    bulk: Vec<Bytes>,
}

impl SharedHeaders {
    pub fn mbulk(&self, n: i64) -> &Bytes {
        &self.mbulk[n as usize]
    }

    pub fn bulk(&self, n: i64) -> &Bytes {
        &self.bulk[n as usize]
    }
}

pub fn shared() -> &'static SharedHeaders {
    static SHARED: OnceLock<SharedHeaders> = OnceLock::new();
    SHARED.get_or_init(|| SharedHeaders {
        mbulk: (0..SHARED_BULKHDR_LEN)
            .map(|n| Bytes::from(format!("*{n}\r\n")))
            .collect(),
        bulk: (0..SHARED_BULKHDR_LEN)
            .map(|n| Bytes::from(format!("${n}\r\n")))
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_headers_render() {
        assert_eq!(&shared().mbulk(0)[..], b"*0\r\n");
        assert_eq!(&shared().mbulk(31)[..], b"*31\r\n");
        assert_eq!(&shared().bulk(5)[..], b"$5\r\n");
    }
}
