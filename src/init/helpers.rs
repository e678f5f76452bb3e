//! Reusable fragment builders for bootstrap programs.
//!
//! Checked helpers share one error slot and one fatal label: every
//! failure assigns the raw result to `errno`, prints a diagnostic and jumps
//! to `fatal`. Unchecked helpers discard their results.

use std::net::Ipv4Addr;

use crate::ir::linux::*;
use crate::ir::{Expr, Fragment, Label, Syscall, SyscallCall, Var};

/// `errno=0x%x` diagnostic followed by a jump to the fatal label.
fn fail(message: &str, errno: &Var, fatal: &Label) -> Vec<Fragment> {
    vec![
        Fragment::printf(
            format!("guestinit: {message}: errno=0x%x\n"),
            [Expr::errno_of(errno)],
        ),
        Fragment::goto(fatal),
    ]
}

/// Assigns `value` to `errno` and bails out to `fatal` if it is negative.
pub fn checked(value: Expr, message: &str, errno: &Var, fatal: &Label) -> Fragment {
    Fragment::block(vec![
        Fragment::assign(errno, value),
        Fragment::when(Expr::is_negative(errno), fail(message, errno, fatal)),
    ])
}

/// Writes one line to the kernel log ring. Silently skipped if `/dev/kmsg`
/// cannot be opened.
pub fn log_kmsg(message: impl Into<String>) -> Fragment {
    let message = message.into();
    let fd = Var::new("kmsg_fd");
    let len = message.len() as i64;
    Fragment::block(vec![
        Fragment::assign(
            &fd,
            Expr::syscall(
                Syscall::Openat,
                [
                    Expr::int(AT_FDCWD),
                    "/dev/kmsg".into(),
                    Expr::int(O_WRONLY),
                    Expr::int(0),
                ],
            ),
        ),
        Fragment::when(
            Expr::is_greater_or_equal(&fd, 0),
            vec![
                Fragment::syscall(Syscall::Write, [(&fd).into(), message.into(), Expr::int(len)]),
                Fragment::syscall(Syscall::Close, [(&fd).into()]),
            ],
        ),
    ])
}

/// Unchecked `mkdirat(AT_FDCWD, path, mode)`.
pub fn mkdir(path: &str, mode: i64) -> Fragment {
    Fragment::syscall(
        Syscall::Mkdirat,
        [Expr::int(AT_FDCWD), path.into(), Expr::int(mode)],
    )
}

fn mount_call(source: &str, target: &str, fstype: &str, data: &str) -> SyscallCall {
    SyscallCall::new(
        Syscall::Mount,
        [
            source.into(),
            target.into(),
            fstype.into(),
            Expr::int(0),
            data.into(),
        ],
    )
}

/// `mount(source, target, fstype, 0, data)` as an expression.
pub fn mount(source: &str, target: &str, fstype: &str, data: &str) -> Expr {
    mount_call(source, target, fstype, data).into()
}

/// Unchecked mount.
pub fn mount_unchecked(source: &str, target: &str, fstype: &str, data: &str) -> Fragment {
    Fragment::Syscall(mount_call(source, target, fstype, data))
}

pub fn chdir(path: &str) -> Expr {
    Expr::syscall(Syscall::Chdir, [path.into()])
}

pub fn set_hostname(name: &str, errno: &Var, fatal: &Label) -> Fragment {
    checked(
        Expr::syscall(
            Syscall::Sethostname,
            [
                Expr::Bytes(name.as_bytes().to_vec()),
                Expr::int(name.len() as i64),
            ],
        ),
        "failed to set hostname",
        errno,
        fatal,
    )
}

// =============================================================================
// Networking
// =============================================================================

fn ifreq_header(ifname: &str) -> [u8; IFREQ_SIZE] {
    let mut req = [0u8; IFREQ_SIZE];
    let name = ifname.as_bytes();
    let n = name.len().min(IFNAMSIZ - 1);
    req[..n].copy_from_slice(&name[..n]);
    req
}

/// `struct ifreq` carrying an `AF_INET` `sockaddr_in`.
pub fn ifreq_addr(ifname: &str, addr: Ipv4Addr) -> Vec<u8> {
    let mut req = ifreq_header(ifname);
    req[16..18].copy_from_slice(&(AF_INET as u16).to_le_bytes());
    req[20..24].copy_from_slice(&addr.octets());
    req.to_vec()
}

/// `struct ifreq` carrying interface flags.
pub fn ifreq_flags(ifname: &str, flags: u16) -> Vec<u8> {
    let mut req = ifreq_header(ifname);
    req[16..18].copy_from_slice(&flags.to_le_bytes());
    req.to_vec()
}

/// `RTM_NEWROUTE` request for a default route via `gateway`.
pub fn default_route_message(gateway: Ipv4Addr) -> Vec<u8> {
    let mut msg = vec![0u8; 36];
    // nlmsghdr
    msg[0..4].copy_from_slice(&36u32.to_le_bytes());
    msg[4..6].copy_from_slice(&RTM_NEWROUTE.to_le_bytes());
    let flags = NLM_F_REQUEST | NLM_F_CREATE | NLM_F_EXCL | NLM_F_ACK;
    msg[6..8].copy_from_slice(&flags.to_le_bytes());
    // rtmsg
    msg[16] = AF_INET as u8;
    msg[20] = RT_TABLE_MAIN;
    msg[21] = RTPROT_BOOT;
    msg[22] = RT_SCOPE_UNIVERSE;
    msg[23] = RTN_UNICAST;
    // RTA_GATEWAY
    msg[28..30].copy_from_slice(&8u16.to_le_bytes());
    msg[30..32].copy_from_slice(&RTA_GATEWAY.to_le_bytes());
    msg[32..36].copy_from_slice(&gateway.octets());
    msg
}

/// Assigns a static address and netmask to `ifname` and brings it up.
pub fn configure_interface(
    ifname: &str,
    address: Ipv4Addr,
    netmask: Ipv4Addr,
    errno: &Var,
    fatal: &Label,
) -> Fragment {
    let fd = Var::new("net_fd");
    let mut body = vec![
        Fragment::assign(
            &fd,
            Expr::syscall(
                Syscall::Socket,
                [Expr::int(AF_INET), Expr::int(SOCK_DGRAM), Expr::int(0)],
            ),
        ),
        checked((&fd).into(), "failed to open interface socket", errno, fatal),
    ];

    let requests = [
        (SIOCSIFADDR, ifreq_addr(ifname, address), "failed to set address"),
        (SIOCSIFNETMASK, ifreq_addr(ifname, netmask), "failed to set netmask"),
        (
            SIOCSIFFLAGS,
            ifreq_flags(ifname, IFF_UP | IFF_RUNNING),
            "failed to bring interface up",
        ),
    ];
    for (request, ifreq, message) in requests {
        let mut on_error = vec![Fragment::syscall(Syscall::Close, [(&fd).into()])];
        on_error.extend(fail(message, errno, fatal));
        body.push(Fragment::assign(
            errno,
            Expr::syscall(
                Syscall::Ioctl,
                [(&fd).into(), Expr::int(request), Expr::Bytes(ifreq)],
            ),
        ));
        body.push(Fragment::when(Expr::is_negative(errno), on_error));
    }

    body.push(Fragment::syscall(Syscall::Close, [(&fd).into()]));
    Fragment::block(body)
}

/// Installs a default route through a netlink socket.
pub fn add_default_route(gateway: Ipv4Addr, errno: &Var, fatal: &Label) -> Fragment {
    let fd = Var::new("nl_fd");
    let msg = default_route_message(gateway);
    let len = msg.len() as i64;
    Fragment::block(vec![
        Fragment::assign(
            &fd,
            Expr::syscall(
                Syscall::Socket,
                [
                    Expr::int(AF_NETLINK),
                    Expr::int(SOCK_RAW),
                    Expr::int(NETLINK_ROUTE),
                ],
            ),
        ),
        checked((&fd).into(), "failed to open netlink socket", errno, fatal),
        Fragment::assign(
            errno,
            Expr::syscall(
                Syscall::Sendto,
                [
                    (&fd).into(),
                    Expr::Bytes(msg),
                    Expr::int(len),
                    Expr::int(0),
                    Expr::int(0),
                    Expr::int(0),
                ],
            ),
        ),
        Fragment::syscall(Syscall::Close, [(&fd).into()]),
        Fragment::when(
            Expr::is_negative(errno),
            fail("failed to add default route", errno, fatal),
        ),
    ])
}

/// Writes `/etc/resolv.conf` with a single nameserver.
pub fn set_resolv_conf(nameserver: Ipv4Addr, errno: &Var, fatal: &Label) -> Fragment {
    let fd = Var::new("resolv_fd");
    let contents = format!("nameserver {nameserver}\n");
    let len = contents.len() as i64;
    Fragment::block(vec![
        Fragment::assign(
            &fd,
            Expr::syscall(
                Syscall::Openat,
                [
                    Expr::int(AT_FDCWD),
                    "/etc/resolv.conf".into(),
                    Expr::int(O_WRONLY | O_CREAT | O_TRUNC | O_CLOEXEC),
                    Expr::int(0o644),
                ],
            ),
        ),
        checked((&fd).into(), "failed to open resolv.conf", errno, fatal),
        Fragment::assign(
            errno,
            Expr::syscall(Syscall::Write, [(&fd).into(), contents.into(), Expr::int(len)]),
        ),
        Fragment::syscall(Syscall::Close, [(&fd).into()]),
        Fragment::when(
            Expr::is_negative(errno),
            fail("failed to write resolv.conf", errno, fatal),
        ),
    ])
}

// =============================================================================
// Process Launch
// =============================================================================

/// Target of the final launch.
#[derive(Debug, Clone)]
pub struct LaunchSpec<'a> {
    pub path: &'a str,
    /// Full argv, including `argv[0]`.
    pub argv: &'a [String],
    pub envp: &'a [String],
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

fn execve(spec: &LaunchSpec<'_>) -> SyscallCall {
    SyscallCall::new(
        Syscall::Execve,
        [
            spec.path.into(),
            Expr::StrArray(spec.argv.to_vec()),
            Expr::StrArray(spec.envp.to_vec()),
        ],
    )
}

/// Drops supplementary groups, then switches gid and uid, each checked.
fn switch_identity(
    spec: &LaunchSpec<'_>,
    on_error: impl Fn(&str) -> Vec<Fragment>,
    errno: &Var,
) -> Vec<Fragment> {
    let mut out = Vec::new();
    if let Some(gid) = spec.gid {
        out.push(Fragment::syscall(Syscall::Setgroups, [Expr::int(0), Expr::int(0)]));
        out.push(Fragment::assign(
            errno,
            Expr::syscall(Syscall::Setgid, [Expr::from(gid)]),
        ));
        out.push(Fragment::when(Expr::is_negative(errno), on_error("failed to set gid")));
    }
    if let Some(uid) = spec.uid {
        out.push(Fragment::assign(
            errno,
            Expr::syscall(Syscall::Setuid, [Expr::from(uid)]),
        ));
        out.push(Fragment::when(Expr::is_negative(errno), on_error("failed to set uid")));
    }
    out
}

/// Replaces PID 1 with the container command. Does not return on success.
pub fn exec(spec: &LaunchSpec<'_>, errno: &Var, fatal: &Label) -> Fragment {
    let mut body = switch_identity(spec, |m| fail(m, errno, fatal), errno);
    body.push(checked(execve(spec).into(), "failed to execute command", errno, fatal));
    Fragment::block(body)
}

/// Forks, execs the command in the child and waits for it.
///
/// Leaves the child's exit code in `errno`: `(status >> 8) & 0xff`, or
/// `128 + signal` when the child was killed. A child that cannot switch
/// identity exits 1; one that cannot exec exits 127.
pub fn fork_exec_wait(spec: &LaunchSpec<'_>, errno: &Var, fatal: &Label) -> Fragment {
    let pid = Var::new("child_pid");
    let status_ptr = Var::new("wait_status_ptr");
    let status = Var::new("wait_status");
    let signal = Var::new("wait_signal");
    let exit_code = Var::new("wait_exit_code");

    let exit_with = |code: i64| Fragment::syscall(Syscall::Exit, [Expr::int(code)]);

    let mut child = switch_identity(spec, |_| vec![exit_with(1)], errno);
    child.push(Fragment::Syscall(execve(spec)));
    child.push(exit_with(127));

    let mut clone_failed = vec![Fragment::assign(errno, &pid)];
    clone_failed.extend(fail("failed to fork", errno, fatal));

    Fragment::block(vec![
        Fragment::assign(
            &pid,
            Expr::syscall(
                Syscall::Clone,
                [
                    Expr::int(SIGCHLD),
                    Expr::int(0),
                    Expr::int(0),
                    Expr::int(0),
                    Expr::int(0),
                ],
            ),
        ),
        Fragment::when(Expr::is_negative(&pid), clone_failed),
        Fragment::when(Expr::is_zero(&pid), child),
        Fragment::assign(&status_ptr, Expr::Buffer(8)),
        checked(
            Expr::syscall(
                Syscall::Wait4,
                [(&pid).into(), (&status_ptr).into(), Expr::int(0), Expr::int(0)],
            ),
            "failed to wait for command",
            errno,
            fatal,
        ),
        Fragment::assign(&status, Expr::load32(&status_ptr)),
        Fragment::assign(&signal, Expr::and(&status, WAIT_SIGNAL_MASK)),
        Fragment::assign(&exit_code, Expr::and(Expr::shr(&status, 8), 0xff)),
        Fragment::when(
            Expr::is_not_equal(&signal, 0),
            vec![Fragment::assign(
                &exit_code,
                Expr::add(&signal, SIGNAL_EXIT_BASE),
            )],
        ),
        Fragment::assign(errno, &exit_code),
    ])
}

/// Terminal power action for a fatal boot error.
pub fn shutdown(restart: bool) -> Fragment {
    let cmd = if restart {
        LINUX_REBOOT_CMD_RESTART
    } else {
        LINUX_REBOOT_CMD_POWER_OFF
    };
    Fragment::syscall(
        Syscall::Reboot,
        [
            Expr::int(LINUX_REBOOT_MAGIC1),
            Expr::int(LINUX_REBOOT_MAGIC2),
            Expr::int(cmd),
            Expr::int(0),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ifreq_layout() {
        let req = ifreq_addr("eth0", Ipv4Addr::new(10, 42, 0, 2));
        assert_eq!(req.len(), IFREQ_SIZE);
        assert_eq!(&req[..5], b"eth0\0");
        assert_eq!(&req[16..18], &[2, 0]);
        assert_eq!(&req[20..24], &[10, 42, 0, 2]);

        let flags = ifreq_flags("eth0", IFF_UP | IFF_RUNNING);
        assert_eq!(u16::from_le_bytes([flags[16], flags[17]]), 0x41);
    }

    #[test]
    fn test_route_message_layout() {
        let msg = default_route_message(Ipv4Addr::new(10, 42, 0, 1));
        assert_eq!(msg.len(), 36);
        assert_eq!(u32::from_le_bytes([msg[0], msg[1], msg[2], msg[3]]), 36);
        assert_eq!(u16::from_le_bytes([msg[4], msg[5]]), RTM_NEWROUTE);
        assert_eq!(u16::from_le_bytes([msg[6], msg[7]]), 0x605);
        assert_eq!(&msg[32..36], &[10, 42, 0, 1]);
    }

    #[test]
    fn test_long_interface_name_truncated() {
        let req = ifreq_flags("a-very-long-interface-name", IFF_UP);
        assert_eq!(req[IFNAMSIZ - 1], 0);
    }
}
