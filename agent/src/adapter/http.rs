//! HTTP CONNECT tunnels and transparent HTTP forwarding

use super::{AdapterError, ConnectRequest, Handshake};

/// Upper bound on the buffered request head.
const MAX_HEAD: usize = 64 * 1024;

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

pub fn advance(buf: &mut Vec<u8>, tunnel: &mut bool) -> Result<Handshake, AdapterError> {
    let Some(head_end) = find_head_end(buf) else {
        if buf.len() > MAX_HEAD {
            return Err(AdapterError::Malformed("request head too large"));
        }
        return Ok(Handshake::NeedMoreData);
    };

    let head = std::str::from_utf8(&buf[..head_end])
        .map_err(|_| AdapterError::Malformed("request head is not utf-8"))?;
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return Err(AdapterError::Malformed("bad request line"));
    };

    if method.eq_ignore_ascii_case("CONNECT") {
        *tunnel = true;
        let (host, port) = split_host_port(target, 443)?;
        let remainder = buf[head_end + 4..].to_vec();
        buf.clear();
        return Ok(Handshake::Connect(ConnectRequest { host, port, remainder }));
    }

    // Transparent forwarding. The authority comes from an absolute-form
    // request target when present, otherwise from the Host header, and the
    // head is rewritten to origin form before it is sent onward.
    let headers: Vec<&str> = lines.collect();
    let host_header = headers.iter().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim().eq_ignore_ascii_case("host").then(|| value.trim())
    });

    let (host, port, path) = if let Some(rest) = strip_scheme(target) {
        let (authority, path) = match rest.find('/') {
            Some(slash) => (&rest[..slash], &rest[slash..]),
            None => (rest, "/"),
        };
        let (host, port) = split_host_port(authority, 80)?;
        (host, port, path)
    } else {
        let authority = host_header.ok_or(AdapterError::Malformed("missing host header"))?;
        let (host, port) = split_host_port(authority, 80)?;
        (host, port, target)
    };

    let mut rebuilt = format!("{method} {path} {version}\r\n").into_bytes();
    if host_header.is_none() {
        let authority = authority_string(&host, port, 80);
        rebuilt.extend_from_slice(format!("Host: {authority}\r\n").as_bytes());
    }
    for line in &headers {
        rebuilt.extend_from_slice(line.as_bytes());
        rebuilt.extend_from_slice(b"\r\n");
    }
    rebuilt.extend_from_slice(b"\r\n");
    rebuilt.extend_from_slice(&buf[head_end + 4..]);

    buf.clear();
    Ok(Handshake::Connect(ConnectRequest {
        host,
        port,
        remainder: rebuilt,
    }))
}

pub fn reply(tunnel: bool, success: bool) -> Vec<u8> {
    match (tunnel, success) {
        (true, true) => CONNECT_ESTABLISHED.to_vec(),
        // The target's own response serves as the success reply.
        (false, true) => Vec::new(),
        (_, false) => BAD_GATEWAY.to_vec(),
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

fn strip_scheme(target: &str) -> Option<&str> {
    if target.len() >= 7 && target[..7].eq_ignore_ascii_case("http://") {
        Some(&target[7..])
    } else {
        None
    }
}

/// Split `host[:port]`, honoring bracketed IPv6 literals.
fn split_host_port(authority: &str, default_port: u16) -> Result<(String, u16), AdapterError> {
    let (host, port_part) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or(AdapterError::Malformed("unclosed ipv6 literal"))?;
        (host, after.strip_prefix(':'))
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(AdapterError::Malformed("empty host"));
    }
    let port = match port_part {
        Some(port) => port
            .parse()
            .map_err(|_| AdapterError::Malformed("bad port"))?,
        None => default_port,
    };
    Ok((host.to_string(), port))
}

/// Render `host[:port]` for a Host header, omitting the default port and
/// bracketing IPv6 literals.
fn authority_string(host: &str, port: u16, default_port: u16) -> String {
    let host = if host.contains(':') {
        format!("[{host}]")
    } else {
        host.to_string()
    };
    if port == default_port {
        host
    } else {
        format!("{host}:{port}")
    }
}
