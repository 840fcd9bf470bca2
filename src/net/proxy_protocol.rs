//! PROXY protocol v1 header.
//!
//! ```text
//! PROXY TCP4 <client ip> <server ip> <client port> <server port>\r\n
//! ```
//! Mixed address families are sent as TCP6 with the IPv4 side mapped.

use std::net::{IpAddr, SocketAddr};

/// Render the v1 header for a client connected to `local`.
pub fn header_v1(client: SocketAddr, local: SocketAddr) -> String {
    let (family, src, dst) = match (client.ip(), local.ip()) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => ("TCP4", IpAddr::V4(src), IpAddr::V4(dst)),
        (src, dst) => ("TCP6", IpAddr::V6(to_v6(src)), IpAddr::V6(to_v6(dst))),
    };
    format!(
        "PROXY {} {} {} {} {}\r\n",
        family,
        src,
        dst,
        client.port(),
        local.port()
    )
}

fn to_v6(ip: IpAddr) -> std::net::Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_header() {
        let h = header_v1(
            "192.168.1.10:51000".parse().unwrap(),
            "10.0.0.1:443".parse().unwrap(),
        );
        assert_eq!(h, "PROXY TCP4 192.168.1.10 10.0.0.1 51000 443\r\n");
    }

    #[test]
    fn ipv6_header() {
        let h = header_v1("[2001:db8::1]:4000".parse().unwrap(), "[::1]:80".parse().unwrap());
        assert_eq!(h, "PROXY TCP6 2001:db8::1 ::1 4000 80\r\n");
    }

    #[test]
    fn mixed_families_map_to_v6() {
        let h = header_v1("1.2.3.4:4000".parse().unwrap(), "[::1]:80".parse().unwrap());
        assert_eq!(h, "PROXY TCP6 ::ffff:1.2.3.4 ::1 4000 80\r\n");
    }
}
