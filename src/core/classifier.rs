//! Maps a transport layer and its ports to a human-readable protocol label.

use std::fmt;

/// Transport layer carried by an IP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportLayer {
    Tcp,
    Udp,
    Icmp,
    Other,
}

impl TransportLayer {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportLayer::Tcp => "TCP",
            TransportLayer::Udp => "UDP",
            TransportLayer::Icmp => "ICMP",
            TransportLayer::Other => "OTHER",
        }
    }
}

impl fmt::Display for TransportLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Well-known service ports. 443, 53 and 123 are resolved before this table
/// is consulted.
const WELL_KNOWN_PORTS: &[(u16, &str)] = &[
    (20, "FTP-DATA"),
    (21, "FTP"),
    (22, "SSH"),
    (23, "Telnet"),
    (25, "SMTP"),
    (80, "HTTP"),
    (110, "POP3"),
    (143, "IMAP"),
    (465, "SMTPS"),
    (587, "SMTP"),
    (993, "IMAPS"),
    (995, "POP3S"),
    (2121, "FTP"),
    (3306, "MySQL"),
    (3389, "RDP"),
    (5432, "Postgres"),
    (6379, "Redis"),
    (8080, "HTTP"),
    (27017, "MongoDB"),
];

fn well_known(port: u16) -> Option<&'static str> {
    WELL_KNOWN_PORTS
        .iter()
        .find(|(p, _)| *p == port)
        .map(|(_, label)| *label)
}

/// Classify a packet into a protocol label.
///
/// Port `0` is treated the same as an absent port.
pub fn classify(layer: TransportLayer, src_port: Option<u16>, dst_port: Option<u16>) -> String {
    if layer == TransportLayer::Icmp {
        return "ICMP".to_string();
    }

    let sport = src_port.filter(|p| *p != 0);
    let dport = dst_port.filter(|p| *p != 0);
    let either = |port: u16| sport == Some(port) || dport == Some(port);

    if either(443) {
        let label = if layer == TransportLayer::Udp { "QUIC" } else { "HTTPS" };
        return label.to_string();
    }
    if either(53) {
        return "DNS".to_string();
    }
    if either(123) {
        return "NTP".to_string();
    }

    match dport.or(sport) {
        Some(port) => match well_known(port) {
            Some(label) => label.to_string(),
            None => format!("{layer}:{port}"),
        },
        None => layer.as_str().to_string(),
    }
}
