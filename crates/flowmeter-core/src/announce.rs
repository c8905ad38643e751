//! Network announcement so clients can find the device without mDNS

use alloc::format;
use alloc::string::String;
use core::net::Ipv4Addr;

/// UDP port of the HTTP API and the announcement; spells "AQUA" on a phone keypad
pub const ANNOUNCE_PORT: u16 = 2782;

/// Seconds between two announcements
pub const ANNOUNCE_INTERVAL_SECS: u64 = 30;

/// Directed broadcast address of the subnet `ip` lives in.
pub fn broadcast_address(ip: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    let mask = u32::from(netmask);
    Ipv4Addr::from((u32::from(ip) & mask) | !mask)
}

/// Datagram payload advertising the API endpoint.
pub fn announcement(hostname: &str, ip: Ipv4Addr, port: u16) -> String {
    format!("{hostname} running on http://{ip}:{port}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_of_class_c_subnet() {
        assert_eq!(
            broadcast_address(Ipv4Addr::new(192, 168, 1, 37), Ipv4Addr::new(255, 255, 255, 0)),
            Ipv4Addr::new(192, 168, 1, 255)
        );
    }

    #[test]
    fn broadcast_of_odd_sized_subnet() {
        assert_eq!(
            broadcast_address(Ipv4Addr::new(10, 0, 17, 9), Ipv4Addr::new(255, 255, 240, 0)),
            Ipv4Addr::new(10, 0, 31, 255)
        );
    }

    #[test]
    fn announcement_names_host_and_endpoint() {
        assert_eq!(
            announcement("watermeter", Ipv4Addr::new(192, 168, 1, 37), ANNOUNCE_PORT),
            "watermeter running on http://192.168.1.37:2782"
        );
    }
}
