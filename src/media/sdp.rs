//! Answer-SDP rewriting for the relay-only connectivity policy
//!
//! Only the relay port range is reachable from outside, so the answer must
//! not tempt browsers with host or server-reflexive candidates, and any
//! internal address the ICE stack wrote into the SDP has to be replaced with
//! the advertised public address. Because the local stack embeds candidates
//! in the SDP while browsers expect discrete trickle events, each surviving
//! relay candidate is also extracted into a message of its own.

use serde::Serialize;
use std::net::Ipv4Addr;

/// One extracted candidate, shaped the way browsers expect trickle events
#[derive(Debug, Clone, Serialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u32,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: String,
}

/// Rewritten answer plus the candidates extracted from it
#[derive(Debug)]
pub struct RewrittenAnswer {
    pub sdp: String,
    pub candidates: Vec<IceCandidate>,
}

/// Apply the connectivity policy to an answer SDP:
/// - drop every non-relay candidate line
/// - substitute `public_ip` for internal addresses in the surviving
///   candidate lines and in `c=` connection lines
/// - collect the surviving candidates as discrete messages
pub fn rewrite_answer(sdp: &str, public_ip: &str) -> RewrittenAnswer {
    let mut out_lines: Vec<String> = Vec::new();
    let mut candidates = Vec::new();

    // m-line bookkeeping for sdpMLineIndex / sdpMid on extracted candidates
    let mut mline_index: i64 = -1;
    let mut current_mid = String::new();

    for line in sdp.lines() {
        if line.starts_with("m=") {
            mline_index += 1;
            current_mid = mline_index.to_string(); // until a=mid overrides
        }
        if let Some(mid) = line.strip_prefix("a=mid:") {
            current_mid = mid.trim().to_string();
        }

        if let Some(body) = line.strip_prefix("a=candidate:") {
            if !is_relay_candidate(body) {
                continue; // host / srflx: stripped
            }
            let rewritten = rewrite_candidate(body, public_ip);
            candidates.push(IceCandidate {
                candidate: format!("candidate:{rewritten}"),
                sdp_mline_index: mline_index.max(0) as u32,
                sdp_mid: current_mid.clone(),
            });
            out_lines.push(format!("a=candidate:{rewritten}"));
            continue;
        }

        if let Some(rest) = line.strip_prefix("c=IN IP4 ") {
            let addr = rest.trim();
            if is_internal_address(addr) {
                out_lines.push(format!("c=IN IP4 {public_ip}"));
                continue;
            }
        }

        out_lines.push(line.to_string());
    }

    RewrittenAnswer {
        sdp: out_lines.join("\r\n") + "\r\n",
        candidates,
    }
}

/// `typ relay` test on a candidate body (everything after `a=candidate:`)
fn is_relay_candidate(body: &str) -> bool {
    let tokens: Vec<&str> = body.split_whitespace().collect();
    tokens
        .windows(2)
        .any(|w| w[0] == "typ" && w[1] == "relay")
}

/// Substitute internal addresses in a candidate body.
///
/// Token layout: `foundation component transport priority address port typ
/// type [raddr addr rport port ...]`; both the connection address and any
/// `raddr` value are rewritten when internal.
fn rewrite_candidate(body: &str, public_ip: &str) -> String {
    let mut tokens: Vec<String> = body.split_whitespace().map(str::to_string).collect();

    if tokens.len() > 4 && is_internal_address(&tokens[4]) {
        tokens[4] = public_ip.to_string();
    }
    let mut i = 0;
    while i + 1 < tokens.len() {
        if tokens[i] == "raddr" && is_internal_address(&tokens[i + 1]) {
            tokens[i + 1] = public_ip.to_string();
        }
        i += 1;
    }

    tokens.join(" ")
}

/// Addresses that are meaningless outside this host's network
fn is_internal_address(addr: &str) -> bool {
    if addr == "localhost" {
        return true;
    }
    match addr.parse::<Ipv4Addr>() {
        Ok(ip) => {
            ip.is_private() || ip.is_loopback() || ip.is_link_local() || ip.is_unspecified()
        }
        // mDNS .local names and IPv6 are internal for our purposes
        Err(_) => addr.ends_with(".local") || addr.contains(':'),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ANSWER: &str = "v=0\r\n\
        o=- 123 2 IN IP4 127.0.0.1\r\n\
        s=-\r\n\
        c=IN IP4 192.168.1.50\r\n\
        t=0 0\r\n\
        m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
        a=mid:0\r\n\
        a=candidate:1 1 udp 2130706431 192.168.1.50 52000 typ host generation 0\r\n\
        a=candidate:2 1 udp 1694498815 203.0.113.9 52001 typ srflx raddr 192.168.1.50 rport 52000\r\n\
        a=candidate:3 1 udp 16777215 10.0.0.7 10111 typ relay raddr 192.168.1.50 rport 52000\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
        a=mid:1\r\n\
        a=candidate:4 1 udp 16777215 10.0.0.7 10112 typ relay raddr 192.168.1.50 rport 52002\r\n";

    #[test]
    fn only_relay_candidates_survive() {
        let rewritten = rewrite_answer(ANSWER, "198.51.100.20");
        assert!(!rewritten.sdp.contains("typ host"));
        assert!(!rewritten.sdp.contains("typ srflx"));
        assert_eq!(rewritten.sdp.matches("typ relay").count(), 2);
        assert_eq!(rewritten.candidates.len(), 2);
    }

    #[test]
    fn internal_addresses_are_substituted() {
        let rewritten = rewrite_answer(ANSWER, "198.51.100.20");
        assert!(!rewritten.sdp.contains("10.0.0.7"));
        assert!(!rewritten.sdp.contains("192.168.1.50"));
        assert!(rewritten.sdp.contains("c=IN IP4 198.51.100.20"));
        for candidate in &rewritten.candidates {
            assert!(candidate.candidate.contains("198.51.100.20"));
            assert!(candidate.candidate.contains("typ relay"));
        }
    }

    #[test]
    fn candidates_carry_mline_and_mid() {
        let rewritten = rewrite_answer(ANSWER, "198.51.100.20");
        assert_eq!(rewritten.candidates[0].sdp_mline_index, 0);
        assert_eq!(rewritten.candidates[0].sdp_mid, "0");
        assert_eq!(rewritten.candidates[1].sdp_mline_index, 1);
        assert_eq!(rewritten.candidates[1].sdp_mid, "1");
    }

    #[test]
    fn public_addresses_pass_through() {
        // srflx stripped, but a relay already on a public addr is untouched
        let sdp = "m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
            a=mid:0\r\n\
            a=candidate:1 1 udp 16777215 203.0.113.9 10111 typ relay\r\n";
        let rewritten = rewrite_answer(sdp, "198.51.100.20");
        assert!(rewritten.sdp.contains("203.0.113.9"));
    }

    #[test]
    fn internal_address_classification() {
        assert!(is_internal_address("10.1.2.3"));
        assert!(is_internal_address("192.168.0.1"));
        assert!(is_internal_address("172.20.1.1"));
        assert!(is_internal_address("127.0.0.1"));
        assert!(is_internal_address("0.0.0.0"));
        assert!(is_internal_address("host.local"));
        assert!(!is_internal_address("203.0.113.9"));
        assert!(!is_internal_address("8.8.8.8"));
    }
}
