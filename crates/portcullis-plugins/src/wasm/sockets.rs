//! WASI socket extension.
//!
//! Guests built against the socket extension import `sock_open`,
//! `sock_bind`, `sock_connect` and friends from `wasi_snapshot_preview1`.
//! Those calls are served by a host-side [`SocketTable`] holding real
//! sockets; `sock_accept`, `sock_recv`, `sock_send` and `sock_shutdown` are
//! shadowed so they also work on extension sockets.
//!
//! Addresses cross the boundary as a pointer to `{buf: u32, buf_len: u32}`
//! where `buf` holds 4 (IPv4) or 16 (IPv6) address bytes; ports travel as
//! separate `u32` values.
//!
//! Host sockets are non-blocking: `sock_accept`, `sock_recv` and `sock_send`
//! return `EAGAIN` instead of parking the calling thread, and outbound
//! connects give up after [`CONNECT_TIMEOUT`].

use super::host::{HostState, check_range, read_bytes, write_bytes};
use super::{WasmError, WasmResult};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{
    IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket,
};
use std::time::Duration;
use wasmtime::{Caller, Linker, Module};

const WASI_MODULE: &str = "wasi_snapshot_preview1";

/// Imports that identify a guest built against the socket extension.
pub const SOCKET_IMPORTS: &[&str] = &[
    "sock_open",
    "sock_bind",
    "sock_connect",
    "sock_listen",
    "sock_getlocaladdr",
    "sock_getpeeraddr",
    "sock_getaddrinfo",
    "sock_setsockopt",
    "sock_getsockopt",
];

pub fn uses_socket_extension(module: &Module) -> bool {
    module
        .imports()
        .any(|import| import.module() == WASI_MODULE && SOCKET_IMPORTS.contains(&import.name()))
}

type Errno = i32;
type SockResult<T> = Result<T, Errno>;

const SUCCESS: Errno = 0;
const EACCES: Errno = 2;
const EADDRINUSE: Errno = 3;
const EAGAIN: Errno = 6;
const EBADF: Errno = 8;
const ECONNREFUSED: Errno = 14;
const EINVAL: Errno = 28;
const EIO: Errno = 29;
const ENOTCONN: Errno = 53;
const ENOTSUP: Errno = 58;

/// Extension descriptors live far above anything WASI hands out.
const FD_BASE: u32 = 0x4000_0000;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Stream,
    Datagram,
}

#[derive(Debug)]
enum HostSocket {
    Pending {
        kind: Kind,
        v6: bool,
        bound: Option<SocketAddr>,
    },
    Listener(TcpListener),
    Stream(TcpStream),
    Datagram(UdpSocket),
}

fn errno(err: &io::Error) -> Errno {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => ECONNREFUSED,
        io::ErrorKind::AddrInUse => EADDRINUSE,
        io::ErrorKind::WouldBlock => EAGAIN,
        io::ErrorKind::PermissionDenied => EACCES,
        io::ErrorKind::NotConnected => ENOTCONN,
        io::ErrorKind::InvalidInput => EINVAL,
        _ => EIO,
    }
}

/// Host sockets owned by one guest instance.
#[derive(Debug, Default)]
pub(crate) struct SocketTable {
    next: u32,
    sockets: HashMap<u32, HostSocket>,
}

impl SocketTable {
    fn insert(&mut self, socket: HostSocket) -> u32 {
        let fd = FD_BASE + self.next;
        self.next += 1;
        self.sockets.insert(fd, socket);
        fd
    }

    fn get(&mut self, fd: u32) -> SockResult<&mut HostSocket> {
        self.sockets.get_mut(&fd).ok_or(EBADF)
    }

    pub(crate) fn contains(&self, fd: u32) -> bool {
        self.sockets.contains_key(&fd)
    }

    /// `family`: 0 or 1 for IPv4, 2 for IPv6. `socktype`: 1 datagram,
    /// 0 or 2 stream.
    pub(crate) fn open(&mut self, family: i32, socktype: i32) -> SockResult<u32> {
        let v6 = match family {
            0 | 1 => false,
            2 => true,
            _ => return Err(EINVAL),
        };
        let kind = match socktype {
            0 | 2 => Kind::Stream,
            1 => Kind::Datagram,
            _ => return Err(EINVAL),
        };
        Ok(self.insert(HostSocket::Pending {
            kind,
            v6,
            bound: None,
        }))
    }

    pub(crate) fn bind(&mut self, fd: u32, addr: SocketAddr) -> SockResult<()> {
        let socket = self.get(fd)?;
        match socket {
            HostSocket::Pending {
                kind: Kind::Datagram,
                ..
            } => {
                let udp = UdpSocket::bind(addr).map_err(|e| errno(&e))?;
                udp.set_nonblocking(true).map_err(|e| errno(&e))?;
                *socket = HostSocket::Datagram(udp);
                Ok(())
            }
            HostSocket::Pending {
                kind: Kind::Stream,
                bound,
                ..
            } => {
                *bound = Some(addr);
                Ok(())
            }
            _ => Err(EINVAL),
        }
    }

    pub(crate) fn listen(&mut self, fd: u32) -> SockResult<()> {
        let socket = self.get(fd)?;
        let HostSocket::Pending {
            kind: Kind::Stream,
            bound: Some(addr),
            ..
        } = socket
        else {
            return Err(EINVAL);
        };
        let listener = TcpListener::bind(*addr).map_err(|e| errno(&e))?;
        listener.set_nonblocking(true).map_err(|e| errno(&e))?;
        *socket = HostSocket::Listener(listener);
        Ok(())
    }

    pub(crate) fn connect(&mut self, fd: u32, addr: SocketAddr) -> SockResult<()> {
        let socket = self.get(fd)?;
        match socket {
            HostSocket::Pending {
                kind: Kind::Stream,
                ..
            } => {
                let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(|e| errno(&e))?;
                stream.set_nonblocking(true).map_err(|e| errno(&e))?;
                *socket = HostSocket::Stream(stream);
                Ok(())
            }
            HostSocket::Pending {
                kind: Kind::Datagram,
                v6,
                ..
            } => {
                let local: IpAddr = if *v6 {
                    Ipv6Addr::UNSPECIFIED.into()
                } else {
                    Ipv4Addr::UNSPECIFIED.into()
                };
                let udp = UdpSocket::bind((local, 0)).map_err(|e| errno(&e))?;
                udp.set_nonblocking(true).map_err(|e| errno(&e))?;
                udp.connect(addr).map_err(|e| errno(&e))?;
                *socket = HostSocket::Datagram(udp);
                Ok(())
            }
            HostSocket::Datagram(udp) => udp.connect(addr).map_err(|e| errno(&e)),
            _ => Err(EINVAL),
        }
    }

    pub(crate) fn accept(&mut self, fd: u32) -> SockResult<u32> {
        let HostSocket::Listener(listener) = self.get(fd)? else {
            return Err(EINVAL);
        };
        let (stream, _) = listener.accept().map_err(|e| errno(&e))?;
        stream.set_nonblocking(true).map_err(|e| errno(&e))?;
        Ok(self.insert(HostSocket::Stream(stream)))
    }

    pub(crate) fn recv(&mut self, fd: u32, buf: &mut [u8]) -> SockResult<usize> {
        match self.get(fd)? {
            HostSocket::Stream(stream) => stream.read(buf).map_err(|e| errno(&e)),
            HostSocket::Datagram(udp) => udp.recv(buf).map_err(|e| errno(&e)),
            _ => Err(ENOTCONN),
        }
    }

    pub(crate) fn send(&mut self, fd: u32, data: &[u8]) -> SockResult<usize> {
        match self.get(fd)? {
            HostSocket::Stream(stream) => stream.write(data).map_err(|e| errno(&e)),
            HostSocket::Datagram(udp) => udp.send(data).map_err(|e| errno(&e)),
            _ => Err(ENOTCONN),
        }
    }

    /// `how` uses WASI sdflags: 1 read, 2 write.
    pub(crate) fn shutdown(&mut self, fd: u32, how: i32) -> SockResult<()> {
        let how = match how {
            1 => Shutdown::Read,
            2 => Shutdown::Write,
            3 => Shutdown::Both,
            _ => return Err(EINVAL),
        };
        match self.get(fd)? {
            HostSocket::Stream(stream) => stream.shutdown(how).map_err(|e| errno(&e)),
            _ => Err(ENOTCONN),
        }
    }

    pub(crate) fn local_addr(&mut self, fd: u32) -> SockResult<SocketAddr> {
        match self.get(fd)? {
            HostSocket::Listener(l) => l.local_addr().map_err(|e| errno(&e)),
            HostSocket::Stream(s) => s.local_addr().map_err(|e| errno(&e)),
            HostSocket::Datagram(u) => u.local_addr().map_err(|e| errno(&e)),
            HostSocket::Pending { bound, .. } => bound.ok_or(EINVAL),
        }
    }

    pub(crate) fn peer_addr(&mut self, fd: u32) -> SockResult<SocketAddr> {
        match self.get(fd)? {
            HostSocket::Stream(s) => s.peer_addr().map_err(|e| errno(&e)),
            HostSocket::Datagram(u) => u.peer_addr().map_err(|e| errno(&e)),
            _ => Err(ENOTCONN),
        }
    }
}

fn status(result: wasmtime::Result<SockResult<()>>) -> wasmtime::Result<i32> {
    result.map(|r| r.err().unwrap_or(SUCCESS))
}

fn read_u32(caller: &mut Caller<'_, HostState>, ptr: u32) -> wasmtime::Result<u32> {
    let raw = read_bytes(caller, ptr, 4)?;
    Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

fn read_addr(caller: &mut Caller<'_, HostState>, ptr: u32, port: u32) -> wasmtime::Result<SockResult<SocketAddr>> {
    let buf = read_u32(caller, ptr)?;
    let len = read_u32(caller, ptr.wrapping_add(4))?;
    let Ok(port) = u16::try_from(port) else {
        return Ok(Err(EINVAL));
    };
    let ip: IpAddr = match len {
        4 => {
            let b = read_bytes(caller, buf, 4)?;
            Ipv4Addr::new(b[0], b[1], b[2], b[3]).into()
        }
        16 => {
            let b = read_bytes(caller, buf, 16)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&b);
            Ipv6Addr::from(octets).into()
        }
        _ => return Ok(Err(EINVAL)),
    };
    Ok(Ok(SocketAddr::new(ip, port)))
}

fn write_addr(
    caller: &mut Caller<'_, HostState>,
    addr: SocketAddr,
    addr_ptr: u32,
    port_ptr: u32,
) -> wasmtime::Result<SockResult<()>> {
    let buf = read_u32(caller, addr_ptr)?;
    let len = read_u32(caller, addr_ptr.wrapping_add(4))? as usize;
    let octets = match addr.ip() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    if len < octets.len() {
        return Ok(Err(EINVAL));
    }
    write_bytes(caller, buf, &octets)?;
    write_bytes(caller, addr_ptr.wrapping_add(4), &(octets.len() as u32).to_le_bytes())?;
    write_bytes(caller, port_ptr, &u32::from(addr.port()).to_le_bytes())?;
    Ok(Ok(()))
}

/// `(ptr, len)` pairs of a WASI iovec array, with the total byte count.
///
/// The array and every buffer it names must lie inside guest memory.
fn iovecs(
    caller: &mut Caller<'_, HostState>,
    ptr: u32,
    count: u32,
) -> wasmtime::Result<SockResult<(Vec<(u32, u32)>, usize)>> {
    if check_range(caller, ptr, u64::from(count) * 8).is_err() {
        return Ok(Err(EINVAL));
    }
    let mut entries = Vec::with_capacity(count as usize);
    let mut total: usize = 0;
    for i in 0..count {
        let entry = ptr + i * 8;
        let buf = read_u32(caller, entry)?;
        let len = read_u32(caller, entry + 4)?;
        if check_range(caller, buf, u64::from(len)).is_err() {
            return Ok(Err(EINVAL));
        }
        total = total.saturating_add(len as usize);
        entries.push((buf, len));
    }
    Ok(Ok((entries, total)))
}

fn memory_size(caller: &mut Caller<'_, HostState>) -> wasmtime::Result<usize> {
    let memory = check_range(caller, 0, 0)?;
    Ok(memory.data_size(&*caller))
}

pub(crate) fn add_to_linker(linker: &mut Linker<HostState>) -> WasmResult<()> {
    linker.allow_shadowing(true);
    let defined = define(linker).map(|_| ());
    linker.allow_shadowing(false);
    defined.map_err(|e| WasmError::Internal(e.to_string()))
}

fn define(linker: &mut Linker<HostState>) -> wasmtime::Result<&mut Linker<HostState>> {
    linker.func_wrap(
        WASI_MODULE,
        "sock_open",
        |mut caller: Caller<'_, HostState>, family: i32, socktype: i32, fd_out: u32| -> wasmtime::Result<i32> {
            match caller.data_mut().sockets.open(family, socktype) {
                Ok(fd) => {
                    write_bytes(&mut caller, fd_out, &fd.to_le_bytes())?;
                    Ok(SUCCESS)
                }
                Err(e) => Ok(e),
            }
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "sock_bind",
        |mut caller: Caller<'_, HostState>, fd: u32, addr: u32, port: u32| -> wasmtime::Result<i32> {
            let addr = read_addr(&mut caller, addr, port)?;
            status(Ok(addr.and_then(|addr| caller.data_mut().sockets.bind(fd, addr))))
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "sock_listen",
        |mut caller: Caller<'_, HostState>, fd: u32, _backlog: u32| -> wasmtime::Result<i32> {
            status(Ok(caller.data_mut().sockets.listen(fd)))
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "sock_connect",
        |mut caller: Caller<'_, HostState>, fd: u32, addr: u32, port: u32| -> wasmtime::Result<i32> {
            let addr = read_addr(&mut caller, addr, port)?;
            status(Ok(addr.and_then(|addr| caller.data_mut().sockets.connect(fd, addr))))
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "sock_accept",
        |mut caller: Caller<'_, HostState>, fd: u32, _flags: u32, fd_out: u32| -> wasmtime::Result<i32> {
            match caller.data_mut().sockets.accept(fd) {
                Ok(conn) => {
                    write_bytes(&mut caller, fd_out, &conn.to_le_bytes())?;
                    Ok(SUCCESS)
                }
                Err(e) => Ok(e),
            }
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "sock_recv",
        |mut caller: Caller<'_, HostState>,
         fd: u32,
         iovs: u32,
         iovs_len: u32,
         _flags: u32,
         len_out: u32,
         flags_out: u32|
         -> wasmtime::Result<i32> {
            if !caller.data().sockets.contains(fd) {
                return Ok(EBADF);
            }
            let (iovs, total) = match iovecs(&mut caller, iovs, iovs_len)? {
                Ok(iovs) => iovs,
                Err(e) => return Ok(e),
            };
            let mut buf = vec![0u8; total.min(memory_size(&mut caller)?)];
            let n = match caller.data_mut().sockets.recv(fd, &mut buf) {
                Ok(n) => n,
                Err(e) => return Ok(e),
            };

            let mut offset = 0;
            for (ptr, len) in iovs {
                if offset >= n {
                    break;
                }
                let take = (len as usize).min(n - offset);
                write_bytes(&mut caller, ptr, &buf[offset..offset + take])?;
                offset += take;
            }
            write_bytes(&mut caller, len_out, &(n as u32).to_le_bytes())?;
            write_bytes(&mut caller, flags_out, &0u16.to_le_bytes())?;
            Ok(SUCCESS)
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "sock_send",
        |mut caller: Caller<'_, HostState>,
         fd: u32,
         iovs: u32,
         iovs_len: u32,
         _flags: u32,
         len_out: u32|
         -> wasmtime::Result<i32> {
            if !caller.data().sockets.contains(fd) {
                return Ok(EBADF);
            }
            let (iovs, _) = match iovecs(&mut caller, iovs, iovs_len)? {
                Ok(iovs) => iovs,
                Err(e) => return Ok(e),
            };
            let limit = memory_size(&mut caller)?;
            let mut data = Vec::new();
            for (ptr, len) in iovs {
                if data.len() == limit {
                    break;
                }
                let take = (len as usize).min(limit - data.len());
                data.extend(read_bytes(&mut caller, ptr, take as u32)?);
            }
            match caller.data_mut().sockets.send(fd, &data) {
                Ok(n) => {
                    write_bytes(&mut caller, len_out, &(n as u32).to_le_bytes())?;
                    Ok(SUCCESS)
                }
                Err(e) => Ok(e),
            }
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "sock_shutdown",
        |mut caller: Caller<'_, HostState>, fd: u32, how: i32| -> wasmtime::Result<i32> {
            status(Ok(caller.data_mut().sockets.shutdown(fd, how)))
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "sock_getlocaladdr",
        |mut caller: Caller<'_, HostState>, fd: u32, addr: u32, port: u32| -> wasmtime::Result<i32> {
            match caller.data_mut().sockets.local_addr(fd) {
                Ok(local) => status(write_addr(&mut caller, local, addr, port)),
                Err(e) => Ok(e),
            }
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "sock_getpeeraddr",
        |mut caller: Caller<'_, HostState>, fd: u32, addr: u32, port: u32| -> wasmtime::Result<i32> {
            match caller.data_mut().sockets.peer_addr(fd) {
                Ok(peer) => status(write_addr(&mut caller, peer, addr, port)),
                Err(e) => Ok(e),
            }
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "sock_getaddrinfo",
        |_caller: Caller<'_, HostState>,
         _node: u32,
         _node_len: u32,
         _service: u32,
         _service_len: u32,
         _hints: u32,
         _res: u32,
         _max_len: u32,
         _res_len: u32|
         -> i32 { ENOTSUP },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "sock_setsockopt",
        |mut caller: Caller<'_, HostState>, fd: u32, _level: u32, _name: u32, _flag: u32, _flag_len: u32| -> i32 {
            if caller.data_mut().sockets.contains(fd) { SUCCESS } else { EBADF }
        },
    )?;

    linker.func_wrap(
        WASI_MODULE,
        "sock_getsockopt",
        |mut caller: Caller<'_, HostState>, fd: u32, _level: u32, _name: u32, flag: u32, _flag_len: u32| -> wasmtime::Result<i32> {
            if !caller.data().sockets.contains(fd) {
                return Ok(EBADF);
            }
            write_bytes(&mut caller, flag, &0i32.to_le_bytes())?;
            Ok(SUCCESS)
        },
    )
}
