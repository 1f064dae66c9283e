use base64::prelude::*;

// A valid empty RDB file, sent verbatim as the full-resync snapshot.
const EMPTY_RDB_BASE64: &[u8] = b"UkVESVMwMDEx+glyZWRpcy12ZXIFNy4yLjD6CnJlZGlzLWJpdHPAQPoFY3RpbWXCbQi8ZfoIdXNlZC1tZW3CsMQQAPoIYW9mLWJhc2XAAP/wbjv+wP9aog==";

pub fn empty_rdb() -> Vec<u8> {
    BASE64_STANDARD
        .decode(EMPTY_RDB_BASE64)
        .expect("embedded RDB payload is valid base64")
}
