//! Minimal FastCGI/1.0 responder client over TCP
//!
//! Speaks just enough of the protocol for gateway dispatch: one BEGIN_REQUEST,
//! the CGI params, the buffered request body as STDIN, then STDOUT collected
//! until END_REQUEST. The CGI response header block is parsed for `Status:`
//! and the remaining headers.

use axum::http::HeaderMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{GatewayError, Result};

const FCGI_VERSION: u8 = 1;
const FCGI_BEGIN_REQUEST: u8 = 1;
const FCGI_END_REQUEST: u8 = 3;
const FCGI_PARAMS: u8 = 4;
const FCGI_STDIN: u8 = 5;
const FCGI_STDOUT: u8 = 6;
const FCGI_STDERR: u8 = 7;

const FCGI_RESPONDER: u16 = 1;
const REQUEST_ID: u16 = 1;

/// Request data handed to the FastCGI dispatcher
pub struct FcgiRequest<'a> {
    /// Absolute script path on the FastCGI server
    pub script_filename: String,
    pub method: &'a str,
    pub path: &'a str,
    pub query: &'a str,
    pub remote_addr: &'a str,
    pub server_name: &'a str,
    pub headers: &'a HeaderMap,
    pub body: &'a [u8],
}

/// Parsed CGI response
#[derive(Debug)]
pub struct FcgiResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Run one request against a FastCGI server at `destination` (host:port)
pub async fn request(destination: &str, req: FcgiRequest<'_>) -> Result<FcgiResponse> {
    let mut stream = TcpStream::connect(destination)
        .await
        .map_err(|e| GatewayError::Dial {
            destination: destination.to_string(),
            source: e,
        })?;

    let mut payload = Vec::with_capacity(req.body.len() + 1024);

    // BEGIN_REQUEST: responder role, no keep-alive
    let mut begin_body = Vec::with_capacity(8);
    begin_body.extend_from_slice(&FCGI_RESPONDER.to_be_bytes());
    begin_body.push(0);
    begin_body.extend_from_slice(&[0u8; 5]);
    payload.extend_from_slice(&build_record(FCGI_BEGIN_REQUEST, REQUEST_ID, &begin_body));

    // PARAMS, then the empty terminator record
    let params = build_params(&req);
    let mut params_body = Vec::new();
    for (name, value) in &params {
        encode_name_value(&mut params_body, name.as_bytes(), value.as_bytes());
    }
    for chunk in params_body.chunks(0xFFFF) {
        payload.extend_from_slice(&build_record(FCGI_PARAMS, REQUEST_ID, chunk));
    }
    payload.extend_from_slice(&build_record(FCGI_PARAMS, REQUEST_ID, &[]));

    // STDIN, then the empty terminator record
    for chunk in req.body.chunks(0xFFFF) {
        payload.extend_from_slice(&build_record(FCGI_STDIN, REQUEST_ID, chunk));
    }
    payload.extend_from_slice(&build_record(FCGI_STDIN, REQUEST_ID, &[]));

    stream
        .write_all(&payload)
        .await
        .map_err(|e| GatewayError::Upstream(format!("fastcgi write: {}", e)))?;

    // Collect STDOUT until END_REQUEST
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    loop {
        let mut header = [0u8; 8];
        if let Err(e) = stream.read_exact(&mut header).await {
            return Err(GatewayError::Upstream(format!("fastcgi read: {}", e)));
        }
        let record_type = header[1];
        let content_length = u16::from_be_bytes([header[4], header[5]]) as usize;
        let padding_length = header[6] as usize;

        let mut content = vec![0u8; content_length + padding_length];
        if content_length + padding_length > 0 {
            stream
                .read_exact(&mut content)
                .await
                .map_err(|e| GatewayError::Upstream(format!("fastcgi read: {}", e)))?;
        }
        content.truncate(content_length);

        match record_type {
            FCGI_STDOUT => stdout.extend_from_slice(&content),
            FCGI_STDERR => stderr.extend_from_slice(&content),
            FCGI_END_REQUEST => break,
            _ => {}
        }
    }

    if !stderr.is_empty() {
        tracing::debug!(
            stderr = %String::from_utf8_lossy(&stderr),
            "fastcgi stderr output"
        );
    }

    Ok(parse_cgi_response(&stdout))
}

fn build_params(req: &FcgiRequest<'_>) -> Vec<(String, String)> {
    let mut params = vec![
        ("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string()),
        ("REQUEST_METHOD".to_string(), req.method.to_string()),
        ("SCRIPT_FILENAME".to_string(), req.script_filename.clone()),
        ("SCRIPT_NAME".to_string(), req.path.to_string()),
        ("QUERY_STRING".to_string(), req.query.to_string()),
        (
            "REQUEST_URI".to_string(),
            if req.query.is_empty() {
                req.path.to_string()
            } else {
                format!("{}?{}", req.path, req.query)
            },
        ),
        ("DOCUMENT_URI".to_string(), req.path.to_string()),
        ("SERVER_PROTOCOL".to_string(), "HTTP/1.1".to_string()),
        ("REMOTE_ADDR".to_string(), req.remote_addr.to_string()),
        ("SERVER_NAME".to_string(), req.server_name.to_string()),
        (
            "CONTENT_LENGTH".to_string(),
            req.body.len().to_string(),
        ),
    ];
    if let Some(content_type) = req.headers.get("content-type").and_then(|v| v.to_str().ok()) {
        params.push(("CONTENT_TYPE".to_string(), content_type.to_string()));
    }
    for (name, value) in req.headers.iter() {
        if let Ok(value_str) = value.to_str() {
            let cgi_name = format!(
                "HTTP_{}",
                name.as_str().to_ascii_uppercase().replace('-', "_")
            );
            params.push((cgi_name, value_str.to_string()));
        }
    }
    params
}

/// Frame one FastCGI record
fn build_record(record_type: u8, request_id: u16, content: &[u8]) -> Vec<u8> {
    debug_assert!(content.len() <= 0xFFFF);
    let mut record = Vec::with_capacity(8 + content.len());
    record.push(FCGI_VERSION);
    record.push(record_type);
    record.extend_from_slice(&request_id.to_be_bytes());
    record.extend_from_slice(&(content.len() as u16).to_be_bytes());
    record.push(0); // padding length
    record.push(0); // reserved
    record.extend_from_slice(content);
    record
}

/// Name-value pair encoding: one length byte below 128, four with the high
/// bit set otherwise
fn encode_name_value(out: &mut Vec<u8>, name: &[u8], value: &[u8]) {
    encode_length(out, name.len());
    encode_length(out, value.len());
    out.extend_from_slice(name);
    out.extend_from_slice(value);
}

fn encode_length(out: &mut Vec<u8>, len: usize) {
    if len < 128 {
        out.push(len as u8);
    } else {
        out.extend_from_slice(&((len as u32) | 0x8000_0000).to_be_bytes());
    }
}

/// Split the CGI response into status, headers and body. `Status:` defaults
/// to 200 when absent.
fn parse_cgi_response(stdout: &[u8]) -> FcgiResponse {
    let (header_block, body) = match find_header_end(stdout) {
        Some((end, skip)) => (&stdout[..end], &stdout[end + skip..]),
        None => (&stdout[..0], stdout),
    };

    let mut status = 200u16;
    let mut headers = Vec::new();
    for line in String::from_utf8_lossy(header_block).lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("status") {
            if let Some(code) = value.split_whitespace().next() {
                status = code.parse().unwrap_or(200);
            }
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    FcgiResponse {
        status,
        headers,
        body: body.to_vec(),
    }
}

fn find_header_end(data: &[u8]) -> Option<(usize, usize)> {
    data.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| (i, 4))
        .or_else(|| data.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_framing() {
        let record = build_record(FCGI_STDIN, 1, b"hello");
        assert_eq!(record[0], FCGI_VERSION);
        assert_eq!(record[1], FCGI_STDIN);
        assert_eq!(u16::from_be_bytes([record[2], record[3]]), 1);
        assert_eq!(u16::from_be_bytes([record[4], record[5]]), 5);
        assert_eq!(&record[8..], b"hello");
    }

    #[test]
    fn test_name_value_encoding_short() {
        let mut out = Vec::new();
        encode_name_value(&mut out, b"NAME", b"value");
        assert_eq!(out[0], 4);
        assert_eq!(out[1], 5);
        assert_eq!(&out[2..6], b"NAME");
        assert_eq!(&out[6..], b"value");
    }

    #[test]
    fn test_name_value_encoding_long() {
        let long_value = vec![b'x'; 300];
        let mut out = Vec::new();
        encode_name_value(&mut out, b"K", &long_value);
        assert_eq!(out[0], 1);
        // Long form: four bytes, high bit set
        assert_eq!(out[1] & 0x80, 0x80);
        let len = u32::from_be_bytes([out[1] & 0x7F, out[2], out[3], out[4]]);
        assert_eq!(len, 300);
    }

    #[test]
    fn test_parse_cgi_response_with_status() {
        let raw = b"Status: 404 Not Found\r\nContent-Type: text/html\r\n\r\nmissing";
        let resp = parse_cgi_response(raw);
        assert_eq!(resp.status, 404);
        assert_eq!(
            resp.headers,
            vec![("Content-Type".to_string(), "text/html".to_string())]
        );
        assert_eq!(resp.body, b"missing");
    }

    #[test]
    fn test_parse_cgi_response_defaults_to_200() {
        let raw = b"Content-Type: text/plain\r\n\r\nok";
        let resp = parse_cgi_response(raw);
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"ok");
    }

    #[test]
    fn test_parse_cgi_response_headerless() {
        let resp = parse_cgi_response(b"raw body only");
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"raw body only");
    }
}
