//! Connection header sent to every client before any video payload
//!
//! | Offset | Size | Content                          |
//! |--------|------|----------------------------------|
//! | 0      | 4    | ASCII `jsmp`                     |
//! | 4      | 2    | width, big-endian unsigned 16    |
//! | 6      | 2    | height, big-endian unsigned 16   |

use bytes::{BufMut, Bytes, BytesMut};

pub const HEADER_MAGIC: &[u8; 4] = b"jsmp";
pub const HEADER_LEN: usize = 8;

/// Encode the header for the given geometry
pub fn encode_header(width: u16, height: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN);
    buf.put_slice(HEADER_MAGIC);
    buf.put_u16(width);
    buf.put_u16(height);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_unknown_geometry_header() {
        assert_eq!(
            &encode_header(0, 0)[..],
            &[0x6a, 0x73, 0x6d, 0x70, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_hd_header() {
        assert_eq!(
            &encode_header(1280, 720)[..],
            &[0x6a, 0x73, 0x6d, 0x70, 0x05, 0x00, 0x02, 0xd0]
        );
    }

    proptest! {
        #[test]
        fn prop_header_layout(width in any::<u16>(), height in any::<u16>()) {
            let header = encode_header(width, height);
            prop_assert_eq!(header.len(), HEADER_LEN);
            prop_assert_eq!(&header[..4], HEADER_MAGIC);
            prop_assert_eq!(&header[4..6], &width.to_be_bytes());
            prop_assert_eq!(&header[6..8], &height.to_be_bytes());
        }
    }
}
