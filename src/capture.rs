//! V4L2 frame capture.
//!
//! One capture request walks a device through open -> configure -> map ->
//! stream -> capture -> teardown. Each stage is its own type, so partial
//! failure drops whatever was acquired and nothing else: the mapping and
//! the device handle live and die together, and stream shutdown runs from
//! the `Streaming` drop no matter where the request bailed out.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use thiserror::Error;
use tracing::warn;

use crate::sampler::SampleSet;

/// Fixed low-resolution format requested from every device; the driver
/// may adjust it and the adjusted dimensions win.
const FRAME_WIDTH: u32 = 160;
const FRAME_HEIGHT: u32 = 120;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("cannot open {path}: {source}")]
    Open { path: String, source: std::io::Error },
    #[error("not a video capture device")]
    NotCaptureDevice,
    #[error("device does not support streaming i/o")]
    NoStreaming,
    #[error("{op} failed: {source}")]
    Ioctl { op: &'static str, source: Errno },
    #[error("mmap failed: {0}")]
    Map(std::io::Error),
}

/// ioctl wrapper with the usual EINTR retry.
fn xioctl<F>(op: &'static str, mut f: F) -> Result<libc::c_int, CaptureError>
where
    F: FnMut() -> nix::Result<libc::c_int>,
{
    loop {
        match f() {
            Err(Errno::EINTR) => continue,
            Err(source) => return Err(CaptureError::Ioctl { op, source }),
            Ok(r) => return Ok(r),
        }
    }
}

#[derive(Debug)]
struct Opened {
    file: File,
}

struct Configured {
    file: File,
    width: u32,
    height: u32,
}

struct Mapped {
    // Declaration order matters: the mapping must unmap before the
    // device handle closes.
    map: MmapMut,
    file: File,
    width: u32,
    height: u32,
}

struct Streaming {
    dev: Mapped,
}

impl Opened {
    fn open(path: &Path) -> Result<Self, CaptureError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| CaptureError::Open {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self { file })
    }

    fn configure(self) -> Result<Configured, CaptureError> {
        let fd = self.file.as_raw_fd();

        let mut caps: sys::Capability = unsafe { std::mem::zeroed() };
        xioctl("querying capabilities", || unsafe {
            sys::querycap(fd, &mut caps)
        })?;
        if caps.capabilities & sys::V4L2_CAP_VIDEO_CAPTURE == 0 {
            return Err(CaptureError::NotCaptureDevice);
        }
        if caps.capabilities & sys::V4L2_CAP_STREAMING == 0 {
            return Err(CaptureError::NoStreaming);
        }

        // Background priority keeps us from stealing the device from an
        // interactive user; not all drivers support it.
        let priority: u32 = sys::V4L2_PRIORITY_BACKGROUND;
        if let Err(err) = unsafe { sys::s_priority(fd, &priority) } {
            warn!("setting background device priority failed: {err}");
        }

        let mut fmt: sys::Format = unsafe { std::mem::zeroed() };
        fmt.type_ = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE;
        fmt.fmt.pix = sys::PixFormat {
            width: FRAME_WIDTH,
            height: FRAME_HEIGHT,
            pixelformat: sys::V4L2_PIX_FMT_YUYV,
            field: sys::V4L2_FIELD_INTERLACED,
            ..unsafe { std::mem::zeroed() }
        };
        xioctl("setting pixel format", || unsafe { sys::s_fmt(fd, &mut fmt) })?;

        let pix = unsafe { fmt.fmt.pix };
        Ok(Configured {
            file: self.file,
            width: pix.width,
            height: pix.height,
        })
    }
}

impl Configured {
    fn map(self) -> Result<Mapped, CaptureError> {
        let fd = self.file.as_raw_fd();

        let mut req: sys::RequestBuffers = unsafe { std::mem::zeroed() };
        req.count = 1;
        req.type_ = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE;
        req.memory = sys::V4L2_MEMORY_MMAP;
        xioctl("requesting buffer", || unsafe { sys::reqbufs(fd, &mut req) })?;

        let mut buf: sys::Buffer = unsafe { std::mem::zeroed() };
        buf.type_ = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE;
        buf.memory = sys::V4L2_MEMORY_MMAP;
        buf.index = 0;
        xioctl("querying buffer", || unsafe { sys::querybuf(fd, &mut buf) })?;

        let offset = unsafe { buf.m.offset };
        let map = unsafe {
            MmapOptions::new()
                .offset(u64::from(offset))
                .len(buf.length as usize)
                .map_mut(&self.file)
        }
        .map_err(CaptureError::Map)?;

        Ok(Mapped {
            map,
            file: self.file,
            width: self.width,
            height: self.height,
        })
    }
}

impl Mapped {
    fn stream_on(self) -> Result<Streaming, CaptureError> {
        let kind: libc::c_int = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE as libc::c_int;
        xioctl("starting stream", || unsafe {
            sys::streamon(self.file.as_raw_fd(), &kind)
        })?;
        Ok(Streaming { dev: self })
    }
}

impl Streaming {
    /// Enqueue the single buffer and block until the driver hands a
    /// frame back, then score it.
    fn capture_frame(&mut self) -> Result<f64, CaptureError> {
        let fd = self.dev.file.as_raw_fd();

        let mut buf: sys::Buffer = unsafe { std::mem::zeroed() };
        buf.type_ = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE;
        buf.memory = sys::V4L2_MEMORY_MMAP;
        buf.index = 0;
        xioctl("enqueueing buffer", || unsafe { sys::qbuf(fd, &mut buf) })?;
        xioctl("retrieving frame", || unsafe { sys::dqbuf(fd, &mut buf) })?;

        Ok(frame_brightness(
            &self.dev.map,
            buf.bytesused,
            self.dev.width * self.dev.height,
        ))
    }
}

impl Drop for Streaming {
    fn drop(&mut self) {
        // Best effort; the device still closes if the driver refuses.
        let kind: libc::c_int = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE as libc::c_int;
        if let Err(err) = unsafe { sys::streamoff(self.dev.file.as_raw_fd(), &kind) } {
            warn!("stopping stream failed: {err}");
        }
    }
}

/// Average luma of one packed YUYV frame: every even byte carries luma,
/// two bytes per pixel.
fn frame_brightness(data: &[u8], bytes_used: u32, pixels: u32) -> f64 {
    if pixels == 0 {
        return 0.0;
    }
    let len = (bytes_used as usize).min(data.len());
    let mut sum: u64 = 0;
    let mut i = 0;
    while i < len {
        sum += u64::from(data[i]);
        i += 2;
    }
    sum as f64 / f64::from(pixels)
}

/// Capture `count` frames from the device at `path` and score each one.
///
/// `count` is validated to [1, 20] at the RPC boundary. A frame that
/// fails mid-run aborts the remaining captures but keeps the samples
/// already collected; only failures before streaming begins fail the
/// whole request.
pub fn sample_frames(path: &Path, count: usize) -> Result<SampleSet, CaptureError> {
    let mut samples = SampleSet::new(count);
    let mut stream = Opened::open(path)?.configure()?.map()?.stream_on()?;
    for i in 0..count {
        match stream.capture_frame() {
            Ok(value) => samples.record(i, value),
            Err(err) => {
                warn!("frame {i} failed, keeping {} samples: {err}", samples.decoded());
                break;
            }
        }
    }
    Ok(samples)
}

/// Minimal videodev2 surface: only what the capture path touches.
mod sys {
    use libc::{c_ulong, timeval};

    pub const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
    pub const V4L2_MEMORY_MMAP: u32 = 1;
    pub const V4L2_FIELD_INTERLACED: u32 = 4;
    pub const V4L2_PRIORITY_BACKGROUND: u32 = 1;
    pub const V4L2_CAP_VIDEO_CAPTURE: u32 = 0x0000_0001;
    pub const V4L2_CAP_STREAMING: u32 = 0x0400_0000;
    pub const V4L2_PIX_FMT_YUYV: u32 = fourcc(b"YUYV");

    const fn fourcc(s: &[u8; 4]) -> u32 {
        (s[0] as u32) | ((s[1] as u32) << 8) | ((s[2] as u32) << 16) | ((s[3] as u32) << 24)
    }

    #[repr(C)]
    pub struct Capability {
        pub driver: [u8; 16],
        pub card: [u8; 32],
        pub bus_info: [u8; 32],
        pub version: u32,
        pub capabilities: u32,
        pub device_caps: u32,
        pub reserved: [u32; 3],
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct PixFormat {
        pub width: u32,
        pub height: u32,
        pub pixelformat: u32,
        pub field: u32,
        pub bytesperline: u32,
        pub sizeimage: u32,
        pub colorspace: u32,
        pub priv_: u32,
        pub flags: u32,
        pub ycbcr_enc: u32,
        pub quantization: u32,
        pub xfer_func: u32,
    }

    #[repr(C)]
    pub union FormatUnion {
        pub pix: PixFormat,
        pub raw: [u8; 200],
        // The kernel union holds pointer-bearing members, which force
        // 8-byte alignment on 64-bit targets.
        pub align: [u64; 25],
    }

    #[repr(C)]
    pub struct Format {
        pub type_: u32,
        pub fmt: FormatUnion,
    }

    #[repr(C)]
    pub struct RequestBuffers {
        pub count: u32,
        pub type_: u32,
        pub memory: u32,
        pub capabilities: u32,
        pub flags: u8,
        pub reserved: [u8; 3],
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct TimeCode {
        pub type_: u32,
        pub flags: u32,
        pub frames: u8,
        pub seconds: u8,
        pub minutes: u8,
        pub hours: u8,
        pub userbits: [u8; 4],
    }

    #[repr(C)]
    pub union BufferM {
        pub offset: u32,
        pub userptr: c_ulong,
        pub fd: i32,
    }

    #[repr(C)]
    pub struct Buffer {
        pub index: u32,
        pub type_: u32,
        pub bytesused: u32,
        pub flags: u32,
        pub field: u32,
        pub timestamp: timeval,
        pub timecode: TimeCode,
        pub sequence: u32,
        pub memory: u32,
        pub m: BufferM,
        pub length: u32,
        pub reserved2: u32,
        pub request_fd: i32,
    }

    nix::ioctl_read!(querycap, b'V', 0, Capability);
    nix::ioctl_readwrite!(s_fmt, b'V', 5, Format);
    nix::ioctl_readwrite!(reqbufs, b'V', 8, RequestBuffers);
    nix::ioctl_readwrite!(querybuf, b'V', 9, Buffer);
    nix::ioctl_readwrite!(qbuf, b'V', 15, Buffer);
    nix::ioctl_readwrite!(dqbuf, b'V', 17, Buffer);
    nix::ioctl_write_ptr!(streamon, b'V', 18, libc::c_int);
    nix::ioctl_write_ptr!(streamoff, b'V', 19, libc::c_int);
    nix::ioctl_write_ptr!(s_priority, b'V', 68, u32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sys_struct_layouts_match_kernel_abi() {
        // ioctl request numbers encode sizeof(), so a layout drift would
        // turn into ENOTTY at runtime.
        assert_eq!(std::mem::size_of::<sys::Capability>(), 104);
        assert_eq!(std::mem::size_of::<sys::PixFormat>(), 48);
        assert_eq!(std::mem::size_of::<sys::Format>(), 208);
        assert_eq!(std::mem::size_of::<sys::RequestBuffers>(), 20);
        assert_eq!(std::mem::size_of::<sys::Buffer>(), 88);
    }

    #[test]
    fn yuyv_fourcc_value() {
        assert_eq!(sys::V4L2_PIX_FMT_YUYV, 0x5659_5559);
    }

    #[test]
    fn brightness_samples_even_bytes_only() {
        // Luma 10 and 20, chroma 99 ignored, two pixels.
        let frame = [10u8, 99, 20, 99];
        let b = frame_brightness(&frame, 4, 2);
        assert!((b - 15.0).abs() < 1e-12);
    }

    #[test]
    fn brightness_respects_bytes_used() {
        let frame = [100u8, 0, 100, 0, 100, 0];
        // Driver reports only four bytes valid.
        let b = frame_brightness(&frame, 4, 2);
        assert!((b - 100.0).abs() < 1e-12);
    }

    #[test]
    fn brightness_clamps_oversized_bytes_used() {
        let frame = [50u8, 0];
        let b = frame_brightness(&frame, 1000, 1);
        assert!((b - 50.0).abs() < 1e-12);
    }

    #[test]
    fn brightness_of_empty_frame_is_zero() {
        assert_eq!(frame_brightness(&[], 0, 0), 0.0);
    }

    #[test]
    fn open_failure_reports_os_error() {
        let err = Opened::open(Path::new("/nonexistent/video99")).unwrap_err();
        match err {
            CaptureError::Open { source, .. } => {
                assert_eq!(source.raw_os_error(), Some(libc::ENOENT));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
