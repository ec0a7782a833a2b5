//! Body Codec (C3): layered decode/encode for `content-encoding` tokens.
//!
//! Per §4.3/§9, `decode` walks the `content-encoding` header's comma-
//! separated list left to right, treating the first token as the outermost
//! layer. `encode` walks the same list in reverse so the layers are peeled
//! back on in the order they were applied, reproducing the original byte
//! layout exactly (S4).

use crate::error::ProxyError;

/// Parse a `content-encoding` header value into its ordered list of tokens,
/// trimmed and lower-cased.
pub fn parse_content_encoding(header_value: &str) -> Vec<String> {
    header_value
        .split(',')
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty() && s != "identity")
        .collect()
}

fn decode_one(codec: &str, data: &[u8]) -> Result<Vec<u8>, ProxyError> {
    use std::io::Read;
    match codec {
        "gzip" | "x-gzip" => {
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| ProxyError::UnsupportedEncoding(format!("gzip: {}", e)))?;
            Ok(out)
        }
        "deflate" => {
            let mut out = Vec::new();
            flate2::read::DeflateDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| ProxyError::UnsupportedEncoding(format!("deflate: {}", e)))?;
            Ok(out)
        }
        "br" => {
            let mut out = Vec::new();
            brotli::BrotliDecompress(&mut std::io::Cursor::new(data), &mut out)
                .map_err(|e| ProxyError::UnsupportedEncoding(format!("br: {}", e)))?;
            Ok(out)
        }
        other => Err(ProxyError::UnsupportedEncoding(other.to_string())),
    }
}

fn encode_one(codec: &str, data: &[u8]) -> Result<Vec<u8>, ProxyError> {
    use std::io::Write;
    match codec {
        "gzip" | "x-gzip" => {
            let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(data)
                .map_err(|e| ProxyError::UnsupportedEncoding(format!("gzip: {}", e)))?;
            encoder
                .finish()
                .map_err(|e| ProxyError::UnsupportedEncoding(format!("gzip: {}", e)))
        }
        "deflate" => {
            let mut encoder =
                flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(data)
                .map_err(|e| ProxyError::UnsupportedEncoding(format!("deflate: {}", e)))?;
            encoder
                .finish()
                .map_err(|e| ProxyError::UnsupportedEncoding(format!("deflate: {}", e)))
        }
        "br" => {
            let params = brotli::enc::BrotliEncoderParams::default();
            let mut out = Vec::new();
            brotli::BrotliCompress(&mut std::io::Cursor::new(data), &mut out, &params)
                .map_err(|e| ProxyError::UnsupportedEncoding(format!("br: {}", e)))?;
            Ok(out)
        }
        other => Err(ProxyError::UnsupportedEncoding(other.to_string())),
    }
}

/// Decode `body` by applying each codec in `content_encoding` in header
/// order (outermost layer first, per the module doc comment above).
pub fn decode(content_encoding: &[String], body: &[u8]) -> Result<Vec<u8>, ProxyError> {
    let mut current = body.to_vec();
    for codec in content_encoding {
        current = decode_one(codec, &current)?;
    }
    Ok(current)
}

/// Re-encode `body` by applying each codec in `content_encoding` in reverse
/// header order, so the result is layered identically to the original
/// payload.
pub fn encode(content_encoding: &[String], body: &[u8]) -> Result<Vec<u8>, ProxyError> {
    let mut current = body.to_vec();
    for codec in content_encoding.iter().rev() {
        current = encode_one(codec, &current)?;
    }
    Ok(current)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    pub fn gzip_round_trips() {
        let encoding = parse_content_encoding("gzip");
        let original = b"Hello World !".to_vec();
        let encoded = encode(&encoding, &original).unwrap();
        let decoded = decode(&encoding, &encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    pub fn layered_encoding_round_trips_in_header_order() {
        let encoding = parse_content_encoding("GZip, BR, Deflate");
        let original = b"...go back to the main page at https://www.test.info/test/index.html".to_vec();
        let encoded = encode(&encoding, &original).unwrap();
        let decoded = decode(&encoding, &encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    pub fn unknown_codec_errors() {
        let encoding = parse_content_encoding("zstd");
        assert!(matches!(
            decode(&encoding, b"abc"),
            Err(ProxyError::UnsupportedEncoding(_))
        ));
    }

    #[test]
    pub fn identity_is_a_no_op() {
        let encoding = parse_content_encoding("identity");
        assert!(encoding.is_empty());
        let body = b"same bytes".to_vec();
        assert_eq!(decode(&encoding, &body).unwrap(), body);
    }

    #[test]
    pub fn whitespace_and_case_are_normalized() {
        let encoding = parse_content_encoding(" GZip , Deflate ");
        assert_eq!(encoding, vec!["gzip".to_string(), "deflate".to_string()]);
    }
}
