//! Kernel-facing NBD server.
//!
//! Old-style NBD: the device is configured through ioctls on `/dev/nbdN`,
//! then one end of a socketpair is handed to the kernel and the other end
//! carries the request/reply stream. The attaching thread parks inside the
//! `DO_IT` ioctl until disconnect; a worker thread owns the user side of the
//! socket and the virtual disk, and serves one command at a time.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use crate::engine::VirtualDisk;
use crate::utils::shell;

// ioctl request codes from linux/nbd.h
pub const NBD_SET_SOCK: libc::c_ulong = 0xab00;
pub const NBD_SET_BLKSIZE: libc::c_ulong = 0xab01;
pub const NBD_SET_SIZE: libc::c_ulong = 0xab02;
pub const NBD_DO_IT: libc::c_ulong = 0xab03;
pub const NBD_CLEAR_SOCK: libc::c_ulong = 0xab04;

pub const NBD_REQUEST_MAGIC: u32 = 0x2560_9513;
pub const NBD_REPLY_MAGIC: u32 = 0x6744_6698;

pub const NBD_CMD_READ: u32 = 0;
pub const NBD_CMD_WRITE: u32 = 1;
pub const NBD_CMD_DISC: u32 = 2;
pub const NBD_CMD_FLUSH: u32 = 3;
pub const NBD_CMD_TRIM: u32 = 4;

/// Wire size of a request header.
pub const REQUEST_HEADER_LEN: usize = 28;
/// Wire size of a reply header.
pub const REPLY_HEADER_LEN: usize = 16;

const ERR_EPERM: u32 = 1;
const ERR_EIO: u32 = 5;

const BLOCK_SIZE: libc::c_ulong = 4096;

/// One decoded request header. All fields big-endian on the wire; the handle
/// is an opaque token echoed back unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Request {
    pub magic: u32,
    pub cmd: u32,
    pub handle: u64,
    pub offset: u64,
    pub length: u32,
}

impl Request {
    pub fn decode(buf: &[u8; REQUEST_HEADER_LEN]) -> Self {
        Self {
            magic: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            cmd: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            handle: u64::from_be_bytes([
                buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
            ]),
            offset: u64::from_be_bytes([
                buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
            ]),
            length: u32::from_be_bytes([buf[24], buf[25], buf[26], buf[27]]),
        }
    }

    pub fn encode(&self) -> [u8; REQUEST_HEADER_LEN] {
        let mut buf = [0u8; REQUEST_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.magic.to_be_bytes());
        buf[4..8].copy_from_slice(&self.cmd.to_be_bytes());
        buf[8..16].copy_from_slice(&self.handle.to_be_bytes());
        buf[16..24].copy_from_slice(&self.offset.to_be_bytes());
        buf[24..28].copy_from_slice(&self.length.to_be_bytes());
        buf
    }
}

/// 16-byte reply header: magic, error, echoed handle.
pub fn reply_header(error: u32, handle: u64) -> [u8; REPLY_HEADER_LEN] {
    let mut buf = [0u8; REPLY_HEADER_LEN];
    buf[0..4].copy_from_slice(&NBD_REPLY_MAGIC.to_be_bytes());
    buf[4..8].copy_from_slice(&error.to_be_bytes());
    buf[8..16].copy_from_slice(&handle.to_be_bytes());
    buf
}

/// Serve commands from `conn` against `vdisk` until DISC, a bad magic, or
/// socket EOF.
///
/// Per-command I/O failures reply EIO and keep the session alive; only
/// protocol-level failures end it. DISC gets no reply. Replies go out in
/// command order; commands are strictly serialized.
pub fn serve_requests(conn: &mut UnixStream, vdisk: &mut VirtualDisk) -> Result<()> {
    loop {
        let mut header = [0u8; REQUEST_HEADER_LEN];
        if let Err(e) = conn.read_exact(&mut header) {
            log::debug!("request stream closed: {e}");
            return Ok(());
        }
        let req = Request::decode(&header);

        if req.magic != NBD_REQUEST_MAGIC {
            log::warn!("bad request magic {:#010x}, terminating session", req.magic);
            return Ok(());
        }

        let mut error = 0u32;
        let mut payload = Vec::new();

        match req.cmd {
            NBD_CMD_READ => match vdisk.read(req.offset, req.length) {
                Ok(data) => payload = data,
                Err(e) => {
                    log::error!("read {}+{} failed: {e:#}", req.offset, req.length);
                    error = ERR_EIO;
                }
            },
            NBD_CMD_WRITE => {
                let mut data = vec![0u8; req.length as usize];
                conn.read_exact(&mut data)
                    .context("read write payload")?;
                if let Err(e) = vdisk.write(req.offset, &data) {
                    log::error!("write {}+{} failed: {e:#}", req.offset, req.length);
                    error = ERR_EIO;
                }
            }
            NBD_CMD_DISC => {
                log::info!("disconnect requested by kernel");
                return Ok(());
            }
            NBD_CMD_FLUSH => {
                if let Err(e) = vdisk.sync() {
                    log::error!("flush failed: {e:#}");
                    error = ERR_EIO;
                }
            }
            NBD_CMD_TRIM => {
                // no-op success
            }
            other => {
                log::warn!("unknown command type {other}");
                error = ERR_EPERM;
            }
        }

        conn.write_all(&reply_header(error, req.handle))
            .context("write reply header")?;
        if req.cmd == NBD_CMD_READ && error == 0 {
            conn.write_all(&payload).context("write read payload")?;
        }
    }
}

/// Attach `vdisk` to the NBD device and serve until the kernel disconnects.
///
/// Blocks for the whole session: the caller's thread sits in `DO_IT` while a
/// worker drives the socket. Everything is torn down before returning.
pub fn serve(device_path: &str, vdisk: VirtualDisk) -> Result<()> {
    // The module is usually built in or already loaded.
    let _ = shell::run(&["modprobe", "nbd"], None, false);

    let device = OpenOptions::new()
        .read(true)
        .write(true)
        .open(device_path)
        .with_context(|| format!("open NBD device {device_path}"))?;
    let fd = device.as_raw_fd();
    let total_size = vdisk.total_size();

    nbd_ioctl(fd, NBD_SET_BLKSIZE, BLOCK_SIZE).context("NBD_SET_BLKSIZE")?;
    nbd_ioctl(fd, NBD_SET_SIZE, total_size as libc::c_ulong).context("NBD_SET_SIZE")?;
    nbd_ioctl(fd, NBD_CLEAR_SOCK, 0).context("NBD_CLEAR_SOCK")?;

    let (user_sock, kernel_sock) = UnixStream::pair().context("create socketpair")?;
    nbd_ioctl(fd, NBD_SET_SOCK, kernel_sock.as_raw_fd() as libc::c_ulong)
        .context("NBD_SET_SOCK")?;

    let worker = std::thread::spawn(move || {
        let mut conn = user_sock;
        let mut vdisk = vdisk;
        if let Err(e) = serve_requests(&mut conn, &mut vdisk) {
            log::error!("request loop failed: {e:#}");
        }
        vdisk.close();
    });

    log::debug!("attached {device_path} ({total_size} bytes), entering DO_IT");
    // Blocks until the kernel sees a disconnect or the session errors out.
    let ret = unsafe { libc::ioctl(fd, NBD_DO_IT) };
    if ret != 0 {
        log::warn!("NBD_DO_IT: {}", std::io::Error::last_os_error());
    }
    log::debug!("DO_IT returned, tearing down {device_path}");

    drop(kernel_sock);
    drop(device);
    if worker.join().is_err() {
        log::error!("request worker panicked");
    }
    Ok(())
}

/// Build the virtual disk for a drive directory and serve it. Foreground
/// entry point behind the hidden `internal-serve` subcommand.
pub fn run_server(
    drive_dir: &Path,
    drive_name: &str,
    chunk_mb: u64,
    total_chunks: u32,
    device: &str,
) -> Result<()> {
    let vdisk = VirtualDisk::new(
        drive_dir.to_path_buf(),
        drive_name,
        chunk_mb,
        total_chunks,
        false,
    )?;
    serve(device, vdisk)
}

fn nbd_ioctl(fd: RawFd, request: libc::c_ulong, arg: libc::c_ulong) -> Result<()> {
    // REQUIRES: CAP_SYS_ADMIN
    let ret = unsafe { libc::ioctl(fd, request, arg) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}
