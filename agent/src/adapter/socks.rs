//! SOCKS4/4a and SOCKS5 handshake parsing

use super::{AdapterError, ConnectRequest, Handshake};
use std::net::{Ipv4Addr, Ipv6Addr};

pub const SOCKS4_VERSION: u8 = 0x04;
pub const SOCKS5_VERSION: u8 = 0x05;

const CMD_CONNECT: u8 = 0x01;

const SOCKS4_REP_GRANTED: u8 = 0x5a;
const SOCKS4_REP_REJECTED: u8 = 0x5b;

const AUTH_NO_AUTH: u8 = 0x00;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_HOST_UNREACHABLE: u8 = 0x04;

/// Hard limit on the SOCKS4 userid (and 4a hostname) fields.
const MAX_SOCKS4_FIELD: usize = 512;

#[derive(Debug)]
pub enum Socks5State {
    Greeting,
    Request,
}

/// SOCKS4 request: VER CMD DSTPORT(2) DSTIP(4) USERID NUL, with the 4a
/// extension carrying a NUL-terminated hostname after the userid when the
/// destination IP is 0.0.0.x (x nonzero).
pub fn advance_socks4(buf: &mut Vec<u8>) -> Result<Handshake, AdapterError> {
    if buf.len() < 2 {
        return Ok(Handshake::NeedMoreData);
    }
    if buf[0] != SOCKS4_VERSION {
        return Err(AdapterError::UnsupportedVersion(buf[0]));
    }
    if buf[1] != CMD_CONNECT {
        return Err(AdapterError::UnsupportedCommand(buf[1]));
    }
    if buf.len() < 9 {
        return Ok(Handshake::NeedMoreData);
    }

    let port = u16::from_be_bytes([buf[2], buf[3]]);
    let ip = [buf[4], buf[5], buf[6], buf[7]];

    let Some(userid_end) = find_nul(&buf[8..], 8)? else {
        return Ok(Handshake::NeedMoreData);
    };

    let is_socks4a = ip[0] == 0 && ip[1] == 0 && ip[2] == 0 && ip[3] != 0;
    let (host, consumed) = if is_socks4a {
        let host_start = userid_end + 1;
        let Some(host_end) = find_nul(&buf[host_start..], host_start)? else {
            return Ok(Handshake::NeedMoreData);
        };
        let host = String::from_utf8(buf[host_start..host_end].to_vec())
            .map_err(|_| AdapterError::Malformed("hostname is not utf-8"))?;
        if host.is_empty() {
            return Err(AdapterError::Malformed("empty hostname"));
        }
        (host, host_end + 1)
    } else {
        (Ipv4Addr::from(ip).to_string(), userid_end + 1)
    };

    let remainder = buf.split_off(consumed);
    buf.clear();
    Ok(Handshake::Connect(ConnectRequest { host, port, remainder }))
}

/// Locate a NUL within the field limit. `slice` starts at the field, so
/// `offset` translates the found position back to buffer coordinates.
fn find_nul(slice: &[u8], offset: usize) -> Result<Option<usize>, AdapterError> {
    match slice.iter().position(|&b| b == 0) {
        Some(pos) => Ok(Some(offset + pos)),
        None if slice.len() > MAX_SOCKS4_FIELD => {
            Err(AdapterError::Malformed("unterminated field"))
        }
        None => Ok(None),
    }
}

pub fn socks4_reply(success: bool) -> Vec<u8> {
    let code = if success {
        SOCKS4_REP_GRANTED
    } else {
        SOCKS4_REP_REJECTED
    };
    vec![0x00, code, 0, 0, 0, 0, 0, 0]
}

pub fn advance_socks5(
    state: &mut Socks5State,
    buf: &mut Vec<u8>,
) -> Result<Handshake, AdapterError> {
    match state {
        Socks5State::Greeting => {
            if buf.len() < 2 {
                return Ok(Handshake::NeedMoreData);
            }
            if buf[0] != SOCKS5_VERSION {
                return Err(AdapterError::UnsupportedVersion(buf[0]));
            }
            let method_count = buf[1] as usize;
            if buf.len() < 2 + method_count {
                return Ok(Handshake::NeedMoreData);
            }
            let methods = &buf[2..2 + method_count];
            if !methods.contains(&AUTH_NO_AUTH) {
                return Err(AdapterError::NoAcceptableAuth);
            }
            buf.drain(..2 + method_count);
            *state = Socks5State::Request;
            Ok(Handshake::Reply(vec![SOCKS5_VERSION, AUTH_NO_AUTH]))
        }
        Socks5State::Request => {
            if buf.len() < 4 {
                return Ok(Handshake::NeedMoreData);
            }
            if buf[0] != SOCKS5_VERSION {
                return Err(AdapterError::UnsupportedVersion(buf[0]));
            }
            if buf[1] != CMD_CONNECT {
                return Err(AdapterError::UnsupportedCommand(buf[1]));
            }

            let (host, addr_end) = match buf[3] {
                ATYP_IPV4 => {
                    if buf.len() < 8 {
                        return Ok(Handshake::NeedMoreData);
                    }
                    let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
                    (ip.to_string(), 8)
                }
                ATYP_DOMAIN => {
                    if buf.len() < 5 {
                        return Ok(Handshake::NeedMoreData);
                    }
                    let len = buf[4] as usize;
                    if buf.len() < 5 + len {
                        return Ok(Handshake::NeedMoreData);
                    }
                    let host = String::from_utf8(buf[5..5 + len].to_vec())
                        .map_err(|_| AdapterError::Malformed("hostname is not utf-8"))?;
                    if host.is_empty() {
                        return Err(AdapterError::Malformed("empty hostname"));
                    }
                    (host, 5 + len)
                }
                ATYP_IPV6 => {
                    if buf.len() < 20 {
                        return Ok(Handshake::NeedMoreData);
                    }
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(&buf[4..20]);
                    (Ipv6Addr::from(octets).to_string(), 20)
                }
                _ => {
                    return Err(AdapterError::Malformed("unknown address type"));
                }
            };

            if buf.len() < addr_end + 2 {
                return Ok(Handshake::NeedMoreData);
            }
            let port = u16::from_be_bytes([buf[addr_end], buf[addr_end + 1]]);

            let remainder = buf.split_off(addr_end + 2);
            buf.clear();
            Ok(Handshake::Connect(ConnectRequest { host, port, remainder }))
        }
    }
}

/// Reply with a zeroed IPv4 bind address; clients only inspect the code.
pub fn socks5_reply(success: bool) -> Vec<u8> {
    let code = if success { REP_SUCCESS } else { REP_HOST_UNREACHABLE };
    vec![SOCKS5_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
}
