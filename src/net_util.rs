//! Network helpers: MTU probing, outgoing-interface discovery via netlink,
//! interface address enumeration and clock utilities.
//!
//! The netlink and ioctl paths are Linux-only; on other platforms callers
//! must supply an explicit MTU and local address.

use std::net::IpAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::error::{E2sarError, Result};

/// Microseconds since the UNIX epoch.
#[inline]
pub fn unix_time_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_micros() as u64
}

/// Nanoseconds since the UNIX epoch.
#[inline]
pub fn unix_time_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos() as u64
}

/// Busy-wait until `usecs` microseconds have elapsed past `start`.
/// Used for rate shaping where sleep granularity is too coarse.
#[inline]
pub fn busy_wait_micros(start: Instant, usecs: u64) {
    let deadline = Duration::from_micros(usecs);
    while start.elapsed() < deadline {
        std::hint::spin_loop();
    }
}

/// Shannon entropy (bits) of the low byte of the microsecond clock, sampled
/// `total_tests` times at `sleep_ms` intervals. The LB keys off the low bits
/// of the tick, so a coarse clock needs a PRNG supplement.
pub fn clock_entropy_test(total_tests: usize, sleep_ms: u64) -> f32 {
    let mut bins = [0u32; 256];
    for _ in 0..total_tests {
        let now = unix_time_micros();
        bins[(now & 0xff) as usize] += 1;
        std::thread::sleep(Duration::from_millis(sleep_ms));
    }
    let mut entropy = 0.0f32;
    for count in bins {
        if count == 0 {
            continue;
        }
        let prob = count as f32 / total_tests as f32;
        entropy -= prob * prob.log2();
    }
    entropy
}

/// MTU of a named interface via `SIOCGIFMTU`, defaulting to 1500 when the
/// ioctl is unavailable. Loopback reports 65536.
#[cfg(target_os = "linux")]
pub fn mtu_of_interface(name: &str) -> u32 {
    use std::os::unix::io::AsRawFd;
    let sock = match std::net::UdpSocket::bind("0.0.0.0:0") {
        Ok(s) => s,
        Err(_) => return 1500,
    };
    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    let bytes = name.as_bytes();
    if bytes.len() >= ifr.ifr_name.len() {
        return 1500;
    }
    for (i, b) in bytes.iter().enumerate() {
        ifr.ifr_name[i] = *b as libc::c_char;
    }
    let ret = unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFMTU, &mut ifr) };
    if ret == 0 {
        unsafe { ifr.ifr_ifru.ifru_mtu.max(0) as u32 }
    } else {
        1500
    }
}

#[cfg(not(target_os = "linux"))]
pub fn mtu_of_interface(_name: &str) -> u32 {
    1500
}

// Netlink message arithmetic (the NLMSG_*/RTA_* macros, 4-byte alignment).
#[cfg(target_os = "linux")]
mod netlink {
    pub const fn align(len: usize) -> usize {
        (len + 3) & !3
    }
    pub const NLMSG_HDRLEN: usize = align(std::mem::size_of::<libc::nlmsghdr>());
    pub const RTA_HDRLEN: usize = align(std::mem::size_of::<libc::rtattr>());

    // struct rtmsg from <linux/rtnetlink.h>; not exposed by the libc crate.
    #[repr(C)]
    #[derive(Copy, Clone)]
    pub struct rtmsg {
        pub rtm_family: u8,
        pub rtm_dst_len: u8,
        pub rtm_src_len: u8,
        pub rtm_tos: u8,
        pub rtm_table: u8,
        pub rtm_protocol: u8,
        pub rtm_scope: u8,
        pub rtm_type: u8,
        pub rtm_flags: u32,
    }
}

/// Query the kernel routing table for the interface that packets to `dest`
/// would leave through, returning `(interface name, MTU)`.
#[cfg(target_os = "linux")]
pub fn interface_and_mtu(dest: IpAddr) -> Result<(String, u32)> {
    use netlink::{align, NLMSG_HDRLEN, RTA_HDRLEN};

    let sock = unsafe { libc::socket(libc::AF_NETLINK, libc::SOCK_RAW, libc::NETLINK_ROUTE) };
    if sock < 0 {
        return Err(E2sarError::last_os_socket_error("netlink socket"));
    }
    // ensure the fd is closed on every exit path
    struct Fd(libc::c_int);
    impl Drop for Fd {
        fn drop(&mut self) {
            unsafe { libc::close(self.0) };
        }
    }
    let sock = Fd(sock);

    // request: nlmsghdr + rtmsg + RTA_DST attribute carrying the address
    let mut req = [0u8; 512];
    let rtmsg_len = std::mem::size_of::<netlink::rtmsg>();
    let (addr_bytes, family, dst_len): (Vec<u8>, u8, u8) = match dest {
        IpAddr::V4(a) => (a.octets().to_vec(), libc::AF_INET as u8, 32),
        IpAddr::V6(a) => (a.octets().to_vec(), libc::AF_INET6 as u8, 128),
    };
    let rta_offset = align(NLMSG_HDRLEN + rtmsg_len);
    let rta_len = RTA_HDRLEN + addr_bytes.len();
    let total_len = rta_offset + align(rta_len);

    unsafe {
        let nlh = req.as_mut_ptr() as *mut libc::nlmsghdr;
        (*nlh).nlmsg_len = total_len as u32;
        (*nlh).nlmsg_type = libc::RTM_GETROUTE;
        (*nlh).nlmsg_flags = libc::NLM_F_REQUEST as u16;

        let rtm = req.as_mut_ptr().add(NLMSG_HDRLEN) as *mut netlink::rtmsg;
        (*rtm).rtm_family = family;
        (*rtm).rtm_dst_len = dst_len;

        let rta = req.as_mut_ptr().add(rta_offset) as *mut libc::rtattr;
        (*rta).rta_type = libc::RTA_DST;
        (*rta).rta_len = rta_len as u16;
        std::ptr::copy_nonoverlapping(
            addr_bytes.as_ptr(),
            req.as_mut_ptr().add(rta_offset + RTA_HDRLEN),
            addr_bytes.len(),
        );

        let mut sa: libc::sockaddr_nl = std::mem::zeroed();
        sa.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        if libc::sendto(
            sock.0,
            req.as_ptr() as *const libc::c_void,
            total_len,
            0,
            &sa as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        ) < 0
        {
            return Err(E2sarError::last_os_socket_error("netlink sendto"));
        }
    }

    let mut reply = [0u8; 4096];
    let len = unsafe {
        libc::recv(
            sock.0,
            reply.as_mut_ptr() as *mut libc::c_void,
            reply.len(),
            0,
        )
    };
    if len < 0 {
        return Err(E2sarError::last_os_socket_error("netlink recv"));
    }
    let mut remaining = len as usize;
    let mut offset = 0usize;

    while remaining >= NLMSG_HDRLEN {
        let nlh = unsafe { &*(reply.as_ptr().add(offset) as *const libc::nlmsghdr) };
        let msg_len = nlh.nlmsg_len as usize;
        if msg_len < NLMSG_HDRLEN || msg_len > remaining {
            break;
        }
        match nlh.nlmsg_type as libc::c_int {
            libc::NLMSG_DONE => break,
            libc::NLMSG_ERROR => {
                return Err(E2sarError::Socket("netlink error reply".to_string()))
            }
            _ => {}
        }

        // walk the route attributes looking for the outgoing interface index
        let mut rta_off = offset + netlink::align(NLMSG_HDRLEN + std::mem::size_of::<netlink::rtmsg>());
        let msg_end = offset + msg_len;
        while rta_off + RTA_HDRLEN <= msg_end {
            let rta = unsafe { &*(reply.as_ptr().add(rta_off) as *const libc::rtattr) };
            let rlen = rta.rta_len as usize;
            if rlen < RTA_HDRLEN || rta_off + rlen > msg_end {
                break;
            }
            if rta.rta_type == libc::RTA_OIF {
                let ifindex =
                    unsafe { *(reply.as_ptr().add(rta_off + RTA_HDRLEN) as *const i32) };
                let mut name_buf = [0u8; libc::IF_NAMESIZE];
                let name_ptr = unsafe {
                    libc::if_indextoname(ifindex as libc::c_uint, name_buf.as_mut_ptr() as *mut _)
                };
                if name_ptr.is_null() {
                    return Err(E2sarError::last_os_socket_error("if_indextoname"));
                }
                let name = unsafe { std::ffi::CStr::from_ptr(name_ptr) }
                    .to_string_lossy()
                    .into_owned();
                let mtu = mtu_of_interface(&name);
                return Ok((name, mtu));
            }
            rta_off += netlink::align(rlen);
        }

        offset += netlink::align(msg_len);
        remaining -= netlink::align(msg_len).min(remaining);
    }

    Err(E2sarError::Socket(format!(
        "no route to {} found in netlink reply",
        dest
    )))
}

#[cfg(not(target_os = "linux"))]
pub fn interface_and_mtu(_dest: IpAddr) -> Result<(String, u32)> {
    Err(E2sarError::Socket(
        "outgoing interface detection requires netlink (Linux only)".to_string(),
    ))
}

/// IP addresses of a named interface, v4 or v6.
#[cfg(target_os = "linux")]
pub fn interface_ips(interface: &str, v6: bool) -> Result<Vec<IpAddr>> {
    use std::ffi::CStr;
    use std::ptr::null_mut;

    let mut out = Vec::new();
    unsafe {
        let mut addrs: *mut libc::ifaddrs = null_mut();
        if libc::getifaddrs(&mut addrs) != 0 {
            return Err(E2sarError::last_os_socket_error("getifaddrs"));
        }
        let mut current = addrs;
        while !current.is_null() {
            let ifa = &*current;
            if !ifa.ifa_name.is_null() && !ifa.ifa_addr.is_null() {
                let name = CStr::from_ptr(ifa.ifa_name).to_str().unwrap_or("");
                if name == interface {
                    let family = (*ifa.ifa_addr).sa_family as libc::c_int;
                    if !v6 && family == libc::AF_INET {
                        let sin = &*(ifa.ifa_addr as *const libc::sockaddr_in);
                        out.push(IpAddr::V4(u32::from_be(sin.sin_addr.s_addr).into()));
                    } else if v6 && family == libc::AF_INET6 {
                        let sin6 = &*(ifa.ifa_addr as *const libc::sockaddr_in6);
                        out.push(IpAddr::V6(sin6.sin6_addr.s6_addr.into()));
                    }
                }
            }
            current = ifa.ifa_next;
        }
        libc::freeifaddrs(addrs);
    }
    if out.is_empty() {
        return Err(E2sarError::NotFound(format!(
            "no {} addresses on interface {}",
            if v6 { "IPv6" } else { "IPv4" },
            interface
        )));
    }
    Ok(out)
}

#[cfg(not(target_os = "linux"))]
pub fn interface_ips(_interface: &str, _v6: bool) -> Result<Vec<IpAddr>> {
    Err(E2sarError::System(
        "interface address enumeration not available on this platform".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_entropy_bounds() {
        // a quick run; entropy of any byte distribution is within [0, 8]
        let e = clock_entropy_test(50, 0);
        assert!((0.0..=8.0).contains(&e));
    }

    #[test]
    fn test_busy_wait_elapses() {
        let start = Instant::now();
        busy_wait_micros(start, 200);
        assert!(start.elapsed() >= Duration::from_micros(200));
    }

    #[test]
    fn test_unix_clocks_are_consistent() {
        let us = unix_time_micros();
        let ns = unix_time_nanos();
        // within a second of each other
        assert!(ns / 1000 >= us);
        assert!(ns / 1000 - us < 1_000_000);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_loopback_route() {
        let (name, mtu) = interface_and_mtu("127.0.0.1".parse().unwrap()).unwrap();
        assert_eq!(name, "lo");
        assert!(mtu >= 1500);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_loopback_ips() {
        let ips = interface_ips("lo", false).unwrap();
        assert!(ips.contains(&"127.0.0.1".parse().unwrap()));
    }
}
