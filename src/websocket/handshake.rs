//! WebSocket opening handshake, RFC 6455 §4.

use std::collections::HashMap;
use std::io::{Read, Write};

use log::trace;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::utils::{base64_encode, random_string};

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const MAX_HTTP_HEAD: usize = 8 * 1024;

pub(crate) fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64_encode(&hasher.finalize())
}

/// Reads from the stream until the end of the HTTP head.
fn read_http_head(stream: &mut dyn Read) -> Result<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HTTP_HEAD {
            return Err(Error::ErrProtocol("HTTP head too large".to_string()));
        }
        stream.read_exact(&mut byte)?;
        head.push(byte[0]);
    }
    String::from_utf8(head).map_err(|_| Error::ErrProtocol("HTTP head is not UTF-8".to_string()))
}

fn parse_headers(head: &str) -> (String, HashMap<String, String>) {
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default().to_string();
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_lowercase(), value.trim().to_string());
        }
    }
    (request_line, headers)
}

/// Client side: upgrade request plus validation of the accept key.
/// Returns the sub-protocol the server selected, if any.
pub(crate) fn client_handshake(
    stream: &mut (impl Read + Write),
    host: &str,
    path: &str,
    protocols: &[String],
) -> Result<Option<String>> {
    let key = base64_encode(random_string(16).as_bytes());

    let mut request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: {key}\r\n"
    );
    if !protocols.is_empty() {
        request.push_str(&format!(
            "Sec-WebSocket-Protocol: {}\r\n",
            protocols.join(", ")
        ));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes())?;
    stream.flush()?;

    let head = read_http_head(stream)?;
    let (status_line, headers) = parse_headers(&head);
    trace!("WebSocket handshake response: {status_line}");

    if !status_line.starts_with("HTTP/1.1 101") {
        return Err(Error::ErrProtocol(format!(
            "unexpected handshake status: {status_line}"
        )));
    }
    match headers.get("sec-websocket-accept") {
        Some(accept) if *accept == accept_key(&key) => {}
        _ => {
            return Err(Error::ErrProtocol(
                "invalid Sec-WebSocket-Accept".to_string(),
            ))
        }
    }

    let protocol = headers.get("sec-websocket-protocol").cloned();
    if let Some(protocol) = &protocol {
        if !protocols.iter().any(|p| p == protocol) {
            return Err(Error::ErrProtocol(format!(
                "server selected an unrequested protocol: {protocol}"
            )));
        }
    }
    Ok(protocol)
}

/// Server side: validates the upgrade request and answers 101.
/// Returns the request path and the first offered sub-protocol we accept.
pub(crate) fn server_handshake(
    stream: &mut (impl Read + Write),
    supported_protocols: &[String],
) -> Result<(String, Option<String>)> {
    let head = read_http_head(stream)?;
    let (request_line, headers) = parse_headers(&head);
    trace!("WebSocket handshake request: {request_line}");

    let mut parts = request_line.split(' ');
    let method = parts.next().unwrap_or_default();
    let path = parts.next().unwrap_or("/").to_string();
    if method != "GET" {
        return Err(Error::ErrProtocol(format!("unexpected method: {method}")));
    }
    if !headers
        .get("upgrade")
        .map(|u| u.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
    {
        return Err(Error::ErrProtocol("not a WebSocket upgrade".to_string()));
    }
    let key = headers
        .get("sec-websocket-key")
        .ok_or_else(|| Error::ErrProtocol("missing Sec-WebSocket-Key".to_string()))?;

    let protocol = headers.get("sec-websocket-protocol").and_then(|offered| {
        offered
            .split(',')
            .map(str::trim)
            .find(|candidate| {
                supported_protocols.is_empty()
                    || supported_protocols.iter().any(|p| p == candidate)
            })
            .map(str::to_string)
    });

    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Accept: {}\r\n",
        accept_key(key)
    );
    if let Some(protocol) = &protocol {
        response.push_str(&format!("Sec-WebSocket-Protocol: {protocol}\r\n"));
    }
    response.push_str("\r\n");
    stream.write_all(response.as_bytes())?;
    stream.flush()?;

    Ok((path, protocol))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_accept_key_rfc_example() {
        // RFC 6455 §1.3
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_parse_headers() {
        let head = "GET /chat HTTP/1.1\r\nHost: example.com\r\nUpgrade: websocket\r\n\r\n";
        let (request_line, headers) = parse_headers(head);
        assert_eq!(request_line, "GET /chat HTTP/1.1");
        assert_eq!(headers.get("host").unwrap(), "example.com");
        assert_eq!(headers.get("upgrade").unwrap(), "websocket");
    }
}
