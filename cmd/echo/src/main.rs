//! TCP echo server on the hooked socket calls
//!
//! One fiber accepts, each connection gets its own fiber, and every
//! read parks on the reactor instead of a worker thread.
//!
//! Try it: `nc 127.0.0.1 8090`

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use weft::{env_get, werror, winfo, IoManager, SchedulerExt};

fn main() {
    weft::log::init();
    let port: u16 = env_get("WEFT_ECHO_PORT", 8090);

    let iom = IoManager::new(4, false, "echo");
    let srv = Arc::clone(&iom);
    iom.schedule(move || serve(srv, port));

    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}

fn serve(iom: Arc<IoManager>, port: u16) {
    let fd = weft::hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
    if fd < 0 {
        werror!("socket failed: {}", fd);
        return;
    }
    let fd = fd as RawFd;

    let addr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr { s_addr: libc::INADDR_ANY.to_be() },
        sin_zero: [0; 8],
    };
    unsafe {
        let one: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        if libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) != 0
        {
            werror!("bind to port {} failed", port);
            weft::hook::close(fd);
            return;
        }
        if libc::listen(fd, 128) != 0 {
            werror!("listen failed");
            weft::hook::close(fd);
            return;
        }
    }
    winfo!("echo server listening on port {}", port);

    loop {
        let client = weft::hook::accept(fd);
        if client < 0 {
            werror!("accept failed: {}", client);
            continue;
        }
        winfo!("client fd {} connected", client);
        iom.schedule(move || echo_loop(client as RawFd));
    }
}

fn echo_loop(fd: RawFd) {
    let mut buf = [0u8; 4096];
    loop {
        let n = weft::hook::recv(fd, &mut buf, 0);
        if n <= 0 {
            break;
        }
        let mut sent = 0usize;
        while sent < n as usize {
            let m = weft::hook::send(fd, &buf[sent..n as usize], 0);
            if m <= 0 {
                weft::hook::close(fd);
                return;
            }
            sent += m as usize;
        }
    }
    winfo!("client fd {} disconnected", fd);
    weft::hook::close(fd);
}
