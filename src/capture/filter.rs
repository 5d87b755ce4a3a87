//! Capture filter expressions.
//!
//! A user-space evaluator for the commonly used subset of BPF filter syntax:
//!
//! ```text
//! host 192.168.1.11 and (tcp port 8080 or icmp)
//! not port 22 && src net 10.0.0.0/8
//! ```
//!
//! Primitives: `host`, `net`, `port` (each optionally qualified by `src`/`dst`
//! and, for `port`, by `tcp`/`udp`), plus `tcp`, `udp`, `icmp`, `ip`, `ip6`.
//! Combinators: `and`/`&&`, `or`/`||`, `not`/`!`, parentheses.

use std::fmt;
use std::net::IpAddr;

use crate::capture::packet::PacketHeaders;
use crate::core::TransportLayer;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("filter ends unexpectedly")]
    UnexpectedEnd,
    #[error("unexpected token {0:?} in filter")]
    UnexpectedToken(String),
    #[error("invalid address {0:?} in filter")]
    InvalidAddress(String),
    #[error("invalid network {0:?} in filter")]
    InvalidNet(String),
    #[error("invalid port {0:?} in filter")]
    InvalidPort(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Either,
    Src,
    Dst,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Host(Side, IpAddr),
    Net(Side, IpAddr, u8),
    Port(Side, Option<TransportLayer>, u16),
    Layer(TransportLayer),
    Ipv4,
    Ipv6,
}

/// A parsed, ready-to-evaluate capture filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFilter {
    source: String,
    expr: Expr,
}

impl CaptureFilter {
    pub fn parse(source: &str) -> Result<Self, FilterError> {
        let tokens = tokenize(source);
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.or()?;
        if let Some(extra) = parser.peek() {
            return Err(FilterError::UnexpectedToken(extra.to_string()));
        }
        Ok(Self {
            source: source.trim().to_string(),
            expr,
        })
    }

    /// Filter matching all traffic to or from `addr`.
    pub fn host(addr: IpAddr) -> Self {
        Self {
            source: format!("host {addr}"),
            expr: Expr::Host(Side::Either, addr),
        }
    }

    pub fn matches(&self, headers: &PacketHeaders) -> bool {
        eval(&self.expr, headers)
    }
}

impl fmt::Display for CaptureFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn eval(expr: &Expr, h: &PacketHeaders) -> bool {
    let side = |side: Side, test: &dyn Fn(&IpAddr) -> bool| match side {
        Side::Either => test(&h.src) || test(&h.dst),
        Side::Src => test(&h.src),
        Side::Dst => test(&h.dst),
    };
    match expr {
        Expr::And(a, b) => eval(a, h) && eval(b, h),
        Expr::Or(a, b) => eval(a, h) || eval(b, h),
        Expr::Not(e) => !eval(e, h),
        Expr::Host(s, addr) => side(*s, &|ip: &IpAddr| ip == addr),
        Expr::Net(s, net, prefix) => side(*s, &|ip: &IpAddr| in_network(ip, net, *prefix)),
        Expr::Port(s, layer, port) => {
            if layer.is_some_and(|l| l != h.layer) {
                return false;
            }
            match s {
                Side::Either => h.src_port == Some(*port) || h.dst_port == Some(*port),
                Side::Src => h.src_port == Some(*port),
                Side::Dst => h.dst_port == Some(*port),
            }
        }
        Expr::Layer(layer) => h.layer == *layer,
        Expr::Ipv4 => h.src.is_ipv4(),
        Expr::Ipv6 => h.src.is_ipv6(),
    }
}

fn in_network(ip: &IpAddr, net: &IpAddr, prefix: u8) -> bool {
    match (ip, net) {
        (IpAddr::V4(ip), IpAddr::V4(net)) => {
            let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
            u32::from(*ip) & mask == u32::from(*net) & mask
        }
        (IpAddr::V6(ip), IpAddr::V6(net)) => {
            let mask = u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0);
            u128::from(*ip) & mask == u128::from(*net) & mask
        }
        _ => false,
    }
}

fn tokenize(source: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let flush = |current: &mut String, tokens: &mut Vec<String>| {
        if !current.is_empty() {
            tokens.push(std::mem::take(current));
        }
    };
    let mut chars = source.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '(' | ')' => {
                flush(&mut current, &mut tokens);
                tokens.push(c.to_string());
            }
            '!' => {
                flush(&mut current, &mut tokens);
                tokens.push("not".into());
            }
            '&' if chars.peek() == Some(&'&') => {
                chars.next();
                flush(&mut current, &mut tokens);
                tokens.push("and".into());
            }
            '|' if chars.peek() == Some(&'|') => {
                chars.next();
                flush(&mut current, &mut tokens);
                tokens.push("or".into());
            }
            c if c.is_whitespace() => flush(&mut current, &mut tokens),
            c => current.push(c),
        }
    }
    flush(&mut current, &mut tokens);
    tokens
}

struct Parser {
    tokens: Vec<String>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&str> {
        self.tokens.get(self.pos).map(String::as_str)
    }

    fn next(&mut self) -> Result<String, FilterError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(FilterError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn eat(&mut self, word: &str) -> bool {
        if self.peek().is_some_and(|t| t.eq_ignore_ascii_case(word)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn or(&mut self) -> Result<Expr, FilterError> {
        let mut lhs = self.and()?;
        while self.eat("or") {
            lhs = Expr::Or(Box::new(lhs), Box::new(self.and()?));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, FilterError> {
        let mut lhs = self.not()?;
        while self.eat("and") {
            lhs = Expr::And(Box::new(lhs), Box::new(self.not()?));
        }
        Ok(lhs)
    }

    fn not(&mut self) -> Result<Expr, FilterError> {
        if self.eat("not") {
            return Ok(Expr::Not(Box::new(self.not()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, FilterError> {
        if self.eat("(") {
            let inner = self.or()?;
            if !self.eat(")") {
                return Err(match self.peek() {
                    Some(t) => FilterError::UnexpectedToken(t.to_string()),
                    None => FilterError::UnexpectedEnd,
                });
            }
            return Ok(inner);
        }

        let word = self.next()?.to_ascii_lowercase();
        match word.as_str() {
            "tcp" | "udp" => {
                let layer = if word == "tcp" { TransportLayer::Tcp } else { TransportLayer::Udp };
                match self.peek().map(str::to_ascii_lowercase).as_deref() {
                    Some("port" | "src" | "dst") => {
                        let side = self.side();
                        self.expect("port")?;
                        Ok(Expr::Port(side, Some(layer), self.port()?))
                    }
                    _ => Ok(Expr::Layer(layer)),
                }
            }
            "icmp" | "icmp6" => Ok(Expr::Layer(TransportLayer::Icmp)),
            "ip" => Ok(Expr::Ipv4),
            "ip6" => Ok(Expr::Ipv6),
            "src" | "dst" => {
                let side = if word == "src" { Side::Src } else { Side::Dst };
                self.qualified(side)
            }
            "host" | "net" | "port" => {
                self.pos -= 1;
                self.qualified(Side::Either)
            }
            _ => Err(FilterError::UnexpectedToken(word)),
        }
    }

    fn side(&mut self) -> Side {
        if self.eat("src") {
            Side::Src
        } else if self.eat("dst") {
            Side::Dst
        } else {
            Side::Either
        }
    }

    fn expect(&mut self, word: &str) -> Result<(), FilterError> {
        if self.eat(word) {
            return Ok(());
        }
        Err(match self.peek() {
            Some(t) => FilterError::UnexpectedToken(t.to_string()),
            None => FilterError::UnexpectedEnd,
        })
    }

    /// `host A`, `net N/L`, `port P`, or a bare address after `src`/`dst`.
    fn qualified(&mut self, side: Side) -> Result<Expr, FilterError> {
        if self.eat("host") {
            return Ok(Expr::Host(side, self.addr()?));
        }
        if self.eat("net") {
            let (net, prefix) = self.net()?;
            return Ok(Expr::Net(side, net, prefix));
        }
        if self.eat("port") {
            return Ok(Expr::Port(side, None, self.port()?));
        }
        Ok(Expr::Host(side, self.addr()?))
    }

    fn addr(&mut self) -> Result<IpAddr, FilterError> {
        let token = self.next()?;
        token.parse().map_err(|_| FilterError::InvalidAddress(token))
    }

    fn port(&mut self) -> Result<u16, FilterError> {
        let token = self.next()?;
        token.parse().map_err(|_| FilterError::InvalidPort(token))
    }

    fn net(&mut self) -> Result<(IpAddr, u8), FilterError> {
        let token = self.next()?;
        let invalid = || FilterError::InvalidNet(token.clone());
        let (addr, prefix) = match token.split_once('/') {
            Some((addr, prefix)) => {
                let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
                let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
                (addr, prefix)
            }
            None => {
                let addr: IpAddr = token.parse().map_err(|_| invalid())?;
                (addr, if addr.is_ipv4() { 32 } else { 128 })
            }
        };
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(invalid());
        }
        Ok((addr, prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(
        src: &str,
        dst: &str,
        layer: TransportLayer,
        sport: u16,
        dport: u16,
    ) -> PacketHeaders {
        let ports = !matches!(layer, TransportLayer::Icmp);
        PacketHeaders {
            src: src.parse().unwrap(),
            dst: dst.parse().unwrap(),
            layer,
            src_port: ports.then_some(sport),
            dst_port: ports.then_some(dport),
        }
    }

    #[test]
    fn test_host_matches_either_side() {
        let f = CaptureFilter::parse("host 10.0.0.1").unwrap();
        assert!(f.matches(&headers("10.0.0.1", "10.0.0.9", TransportLayer::Tcp, 1, 2)));
        assert!(f.matches(&headers("10.0.0.9", "10.0.0.1", TransportLayer::Tcp, 1, 2)));
        assert!(!f.matches(&headers("10.0.0.8", "10.0.0.9", TransportLayer::Tcp, 1, 2)));
    }

    #[test]
    fn test_default_host_filter_equivalent_to_parsed() {
        let addr: IpAddr = "192.168.1.11".parse().unwrap();
        assert_eq!(CaptureFilter::host(addr), CaptureFilter::parse("host 192.168.1.11").unwrap());
    }

    #[test]
    fn test_compound_expression_with_parentheses() {
        let f = CaptureFilter::parse("host 192.168.1.11 and (tcp port 8080 or icmp)").unwrap();
        assert!(f.matches(&headers("192.168.1.11", "10.0.0.2", TransportLayer::Tcp, 8080, 5000)));
        assert!(f.matches(&headers("10.0.0.2", "192.168.1.11", TransportLayer::Icmp, 0, 0)));
        assert!(!f.matches(&headers("10.0.0.2", "192.168.1.11", TransportLayer::Udp, 8080, 5000)));
        assert!(!f.matches(&headers("10.0.0.2", "10.0.0.3", TransportLayer::Tcp, 8080, 5000)));
    }

    #[test]
    fn test_src_dst_qualifiers() {
        let f = CaptureFilter::parse("src host 10.0.0.1 && dst port 53").unwrap();
        assert!(f.matches(&headers("10.0.0.1", "8.8.8.8", TransportLayer::Udp, 4000, 53)));
        assert!(!f.matches(&headers("8.8.8.8", "10.0.0.1", TransportLayer::Udp, 53, 4000)));
    }

    #[test]
    fn test_not_and_bang() {
        let f = CaptureFilter::parse("!port 22").unwrap();
        assert!(!f.matches(&headers("1.1.1.1", "2.2.2.2", TransportLayer::Tcp, 22, 5000)));
        let g = CaptureFilter::parse("not tcp").unwrap();
        assert!(g.matches(&headers("1.1.1.1", "2.2.2.2", TransportLayer::Udp, 1, 2)));
    }

    #[test]
    fn test_net_prefix() {
        let f = CaptureFilter::parse("src net 10.0.0.0/8").unwrap();
        assert!(f.matches(&headers("10.200.3.4", "1.1.1.1", TransportLayer::Tcp, 1, 2)));
        assert!(!f.matches(&headers("11.0.0.1", "1.1.1.1", TransportLayer::Tcp, 1, 2)));
        let all = CaptureFilter::parse("net 0.0.0.0/0").unwrap();
        assert!(all.matches(&headers("11.0.0.1", "1.1.1.1", TransportLayer::Tcp, 1, 2)));
    }

    #[test]
    fn test_bare_address_after_direction() {
        let f = CaptureFilter::parse("dst 10.0.0.1").unwrap();
        assert!(f.matches(&headers("1.1.1.1", "10.0.0.1", TransportLayer::Tcp, 1, 2)));
    }

    #[test]
    fn test_ip_version_primitives() {
        let f = CaptureFilter::parse("ip6").unwrap();
        assert!(f.matches(&headers("::1", "::2", TransportLayer::Tcp, 1, 2)));
        assert!(!f.matches(&headers("1.1.1.1", "2.2.2.2", TransportLayer::Tcp, 1, 2)));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(CaptureFilter::parse("host"), Err(FilterError::UnexpectedEnd));
        assert_eq!(
            CaptureFilter::parse("host 300.1.1.1"),
            Err(FilterError::InvalidAddress("300.1.1.1".into()))
        );
        assert_eq!(CaptureFilter::parse("port http"), Err(FilterError::InvalidPort("http".into())));
        assert!(matches!(CaptureFilter::parse("(tcp"), Err(FilterError::UnexpectedEnd)));
        assert!(matches!(CaptureFilter::parse("tcp udp"), Err(FilterError::UnexpectedToken(_))));
        assert!(matches!(CaptureFilter::parse("net 10.0.0.0/40"), Err(FilterError::InvalidNet(_))));
        assert!(matches!(CaptureFilter::parse("vlan 3"), Err(FilterError::UnexpectedToken(_))));
    }

    #[test]
    fn test_display_is_source_text() {
        let f = CaptureFilter::parse("  tcp port 80 ").unwrap();
        assert_eq!(f.to_string(), "tcp port 80");
    }
}
