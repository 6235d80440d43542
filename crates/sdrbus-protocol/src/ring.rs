//! Lock-free single-producer/single-consumer byte ring, backed by an
//! anonymous shared-memory file and handed to a collaborator process as a
//! plain file descriptor.
//!
//! The wire layout of the header is fixed and must match byte-for-byte
//! across processes built against different versions of this crate, so
//! every field is written and read at an explicit offset rather than
//! through a `#[repr(C)]` struct overlay — atomics do not have a portable
//! guaranteed layout when embedded in a struct, so the header is addressed
//! the same way a raw `mmap` region is addressed: by pointer arithmetic.
//!
//! Producer and consumer each get their own handle over the same mapping.
//! Only the producer ever advances `wpos` under normal operation; only the
//! consumer ever advances `rpos` — except when the producer is forced to
//! overrun a slow consumer, in which case the producer bumps `rpos` itself
//! to the minimum value that makes the pending write fit. That is the one
//! deliberate exception to single-writer-per-field, and it is why `rpos`
//! is also an atomic rather than plain memory.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{BrokerError, Result};

pub const MAGIC_IQ: u32 = 0x5149_4850; // "PHIQ"
pub const MAGIC_AUDIO: u32 = 0x5048_4155; // "PHAU"
pub const RING_VERSION: u32 = 1;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqFormat {
    Cf32 = 1,
    Cs16 = 2,
}

impl TryFrom<u32> for IqFormat {
    type Error = BrokerError;
    fn try_from(v: u32) -> Result<Self> {
        match v {
            1 => Ok(IqFormat::Cf32),
            2 => Ok(IqFormat::Cs16),
            other => Err(BrokerError::NotFound(format!("unknown IQ format {other}"))),
        }
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    F32 = 1,
}

impl TryFrom<u32> for AudioFormat {
    type Error = BrokerError;
    fn try_from(v: u32) -> Result<Self> {
        match v {
            1 => Ok(AudioFormat::F32),
            other => Err(BrokerError::NotFound(format!("unknown audio format {other}"))),
        }
    }
}

// Offsets within the mapped region. Field order and sizes mirror the
// original wire header; a trailing 4 bytes of compiler padding keep the
// struct's total size a multiple of 8 the way a double-aligned C struct
// would be padded.
mod offset {
    pub const MAGIC: usize = 0;
    pub const VERSION: usize = 4;
    pub const SEQ: usize = 8;
    pub const WPOS: usize = 16;
    pub const RPOS: usize = 24;
    pub const CAPACITY: usize = 32;
    pub const USED: usize = 36;
    pub const BYTES_PER_SAMP: usize = 40;
    pub const CHANNELS: usize = 44;
    pub const SAMPLE_RATE: usize = 48;
    pub const CENTER_FREQ: usize = 56;
    pub const FMT: usize = 64;
    pub const RESERVED: usize = 68;
}

pub const HEADER_LEN: usize = 136;
const RESERVED_LEN: usize = 64;

/// Parameters describing the stream carried by a ring, used at creation
/// time to stamp the header.
#[derive(Debug, Clone)]
pub struct RingSpec {
    pub magic: u32,
    pub capacity: u32,
    pub bytes_per_samp: u32,
    pub channels: u32,
    pub sample_rate: f64,
    pub center_freq: f64,
    pub fmt: u32,
}

impl RingSpec {
    pub fn iq(capacity: u32, fmt: IqFormat, channels: u32, sample_rate: f64, center_freq: f64) -> Self {
        let bytes_per_samp = match fmt {
            IqFormat::Cf32 => 8,
            IqFormat::Cs16 => 4,
        };
        Self {
            magic: MAGIC_IQ,
            capacity,
            bytes_per_samp,
            channels,
            sample_rate,
            center_freq,
            fmt: fmt as u32,
        }
    }

    pub fn audio(capacity: u32, fmt: AudioFormat, channels: u32, sample_rate: f64) -> Self {
        let bytes_per_samp = match fmt {
            AudioFormat::F32 => 4,
        };
        Self {
            magic: MAGIC_AUDIO,
            capacity,
            bytes_per_samp,
            channels,
            sample_rate,
            center_freq: 0.0,
            fmt: fmt as u32,
        }
    }
}

/// An anonymous memory-backed region mapped into this process, shared
/// with exactly one other process via a duplicated file descriptor.
pub struct SharedRegion {
    ptr: *mut u8,
    total_len: usize,
    _fd: OwnedFd,
}

// SAFETY: the mapping is valid for the process lifetime and the ring
// protocol described above guarantees at most one producer and one
// consumer touch it concurrently, each from a single thread.
unsafe impl Send for SharedRegion {}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.total_len);
        }
    }
}

impl SharedRegion {
    /// Allocate a fresh anonymous memory-backed file of `data_len` bytes
    /// beyond the header and map it. Returns the region plus a duplicate
    /// fd suitable for handing to a collaborator over `SCM_RIGHTS`.
    pub fn create(name: &str, spec: &RingSpec) -> Result<(Self, RawFd)> {
        let total_len = HEADER_LEN + spec.capacity as usize;
        let fd = make_anon_fd(name)?;

        let rc = unsafe { libc::ftruncate(fd, total_len as libc::off_t) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(BrokerError::IoError(err));
        }

        let region = Self::map(fd, total_len)?;
        region.write_header(spec);

        let dup = unsafe { libc::dup(fd) };
        if dup < 0 {
            return Err(BrokerError::IoError(io::Error::last_os_error()));
        }
        Ok((region, dup))
    }

    /// Map an already-sized fd received from a collaborator. `data_len`
    /// must be known out of band (it is carried in control-plane metadata
    /// alongside the fd) since the header alone does not self-describe the
    /// mapping length to a process that hasn't mapped it yet.
    ///
    /// `fd` is consumed unconditionally: on success it is owned by the
    /// returned region, and on failure it has already been closed. Callers
    /// must not close `fd` themselves after calling this.
    pub fn open(fd: RawFd, data_len: usize) -> Result<Self> {
        Self::map(fd, HEADER_LEN + data_len)
    }

    /// Map an fd as `open` does, then refuse the mapping unless its
    /// `magic` matches `expected`. A consumer must never pop bytes from a
    /// ring it hasn't verified — the mapping (and `fd`) is unwound on
    /// mismatch, same consume-unconditionally contract as `open`.
    pub fn open_checked(fd: RawFd, data_len: usize, expected_magic: u32) -> Result<Self> {
        let region = Self::open(fd, data_len)?;
        let got = region.magic();
        if got != expected_magic {
            // `region` drops here, which unmaps and closes the fd it owns —
            // the caller must not also close `fd`.
            return Err(BrokerError::BadMagic { expected: expected_magic, got });
        }
        Ok(region)
    }

    /// Always takes ownership of `fd`, even on failure: `fd` is wrapped in
    /// an `OwnedFd` before the `mmap` call so a failed mapping still closes
    /// it exactly once via `Drop`, rather than leaving it to the caller.
    fn map(fd: RawFd, total_len: usize) -> Result<Self> {
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                owned.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            return Err(BrokerError::IoError(err));
        }
        Ok(Self { ptr: ptr as *mut u8, total_len, _fd: owned })
    }

    fn write_header(&self, spec: &RingSpec) {
        unsafe {
            write_u32(self.ptr, offset::MAGIC, spec.magic);
            write_u32(self.ptr, offset::VERSION, RING_VERSION);
            self.seq().store(0, Ordering::Relaxed);
            self.wpos().store(0, Ordering::Relaxed);
            self.rpos().store(0, Ordering::Relaxed);
            write_u32(self.ptr, offset::CAPACITY, spec.capacity);
            self.used().store(0, Ordering::Relaxed);
            write_u32(self.ptr, offset::BYTES_PER_SAMP, spec.bytes_per_samp);
            write_u32(self.ptr, offset::CHANNELS, spec.channels);
            write_f64(self.ptr, offset::SAMPLE_RATE, spec.sample_rate);
            write_f64(self.ptr, offset::CENTER_FREQ, spec.center_freq);
            write_u32(self.ptr, offset::FMT, spec.fmt);
            std::ptr::write_bytes(self.ptr.add(offset::RESERVED), 0, RESERVED_LEN);
        }
    }

    pub fn magic(&self) -> u32 {
        unsafe { read_u32(self.ptr, offset::MAGIC) }
    }

    pub fn version(&self) -> u32 {
        unsafe { read_u32(self.ptr, offset::VERSION) }
    }

    pub fn capacity(&self) -> u32 {
        unsafe { read_u32(self.ptr, offset::CAPACITY) }
    }

    pub fn bytes_per_samp(&self) -> u32 {
        unsafe { read_u32(self.ptr, offset::BYTES_PER_SAMP) }
    }

    pub fn channels(&self) -> u32 {
        unsafe { read_u32(self.ptr, offset::CHANNELS) }
    }

    pub fn sample_rate(&self) -> f64 {
        unsafe { read_f64(self.ptr, offset::SAMPLE_RATE) }
    }

    pub fn center_freq(&self) -> f64 {
        unsafe { read_f64(self.ptr, offset::CENTER_FREQ) }
    }

    pub fn fmt_raw(&self) -> u32 {
        unsafe { read_u32(self.ptr, offset::FMT) }
    }

    /// Duplicate the region's backing fd, e.g. to republish it to a late
    /// subscriber on its info feed without re-allocating the mapping.
    pub fn try_clone_fd(&self) -> Result<RawFd> {
        let dup = unsafe { libc::dup(self._fd.as_raw_fd()) };
        if dup < 0 {
            return Err(BrokerError::IoError(io::Error::last_os_error()));
        }
        Ok(dup)
    }

    fn seq(&self) -> &AtomicU64 {
        unsafe { &*(self.ptr.add(offset::SEQ) as *const AtomicU64) }
    }

    fn wpos(&self) -> &AtomicU64 {
        unsafe { &*(self.ptr.add(offset::WPOS) as *const AtomicU64) }
    }

    fn rpos(&self) -> &AtomicU64 {
        unsafe { &*(self.ptr.add(offset::RPOS) as *const AtomicU64) }
    }

    fn used(&self) -> &AtomicU32 {
        unsafe { &*(self.ptr.add(offset::USED) as *const AtomicU32) }
    }

    fn data_ptr(&self) -> *mut u8 {
        unsafe { self.ptr.add(HEADER_LEN) }
    }
}

unsafe fn write_u32(base: *mut u8, off: usize, v: u32) {
    std::ptr::write_unaligned(base.add(off) as *mut u32, v);
}
unsafe fn read_u32(base: *mut u8, off: usize) -> u32 {
    std::ptr::read_unaligned(base.add(off) as *const u32)
}
unsafe fn write_f64(base: *mut u8, off: usize, v: f64) {
    std::ptr::write_unaligned(base.add(off) as *mut f64, v);
}
unsafe fn read_f64(base: *mut u8, off: usize) -> f64 {
    std::ptr::read_unaligned(base.add(off) as *const f64)
}

/// Create an anonymous memory-backed fd: `memfd_create` where available,
/// falling back to a `shm_open` object that is `shm_unlink`ed immediately
/// so no name persists in `/dev/shm` beyond this call.
fn make_anon_fd(name: &str) -> Result<RawFd> {
    let cname = std::ffi::CString::new(name).unwrap_or_else(|_| std::ffi::CString::new("sdrbus-ring").unwrap());

    let fd = unsafe { libc::syscall(libc::SYS_memfd_create, cname.as_ptr(), libc::MFD_CLOEXEC) };
    if fd >= 0 {
        return Ok(fd as RawFd);
    }

    let shm_name = format!("/sdrbus-{}-{}\0", std::process::id(), name);
    let fd = unsafe {
        libc::shm_open(
            shm_name.as_ptr() as *const libc::c_char,
            libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
            0o600,
        )
    };
    if fd < 0 {
        return Err(BrokerError::IoError(io::Error::last_os_error()));
    }
    unsafe { libc::shm_unlink(shm_name.as_ptr() as *const libc::c_char) };
    Ok(fd)
}

/// The producer side of a ring. Only one `RingProducer` should exist per
/// region; it is not `Sync` and is meant to stay on a single thread.
pub struct RingProducer {
    region: SharedRegion,
    frame_bytes: usize,
}

impl RingProducer {
    pub fn new(region: SharedRegion) -> Self {
        let frame_bytes = (region.bytes_per_samp() * region.channels()).max(1) as usize;
        Self { region, frame_bytes }
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Push raw sample bytes into the ring. If there isn't room, the
    /// consumer's read position is advanced to the minimum value that
    /// makes this write fit — "overrun wins"; the producer never blocks
    /// and never drops the newest data.
    pub fn push(&self, bytes: &[u8]) {
        let capacity = self.region.capacity() as u64;
        let len = bytes.len() as u64;
        debug_assert!(len <= capacity, "push larger than the entire ring capacity");

        let wpos = self.region.wpos().load(Ordering::Relaxed);
        let rpos = self.region.rpos().load(Ordering::Relaxed);
        let used = wpos - rpos;

        if used + len > capacity {
            let new_rpos = wpos + len - capacity;
            self.region.rpos().store(new_rpos, Ordering::Relaxed);
        }

        self.write_wrapping(wpos, bytes);

        let new_wpos = wpos + len;
        let new_used = new_wpos - self.region.rpos().load(Ordering::Relaxed);
        self.region.used().store(new_used.min(capacity) as u32, Ordering::Relaxed);
        self.region.seq().fetch_add(1, Ordering::Relaxed);
        // Release: publishes the sample bytes just written to a consumer
        // that acquires this same wpos value.
        self.region.wpos().store(new_wpos, Ordering::Release);
    }

    fn write_wrapping(&self, wpos: u64, bytes: &[u8]) {
        let capacity = self.region.capacity() as usize;
        let start = (wpos as usize) % capacity;
        let data = self.region.data_ptr();
        let first = (capacity - start).min(bytes.len());
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), data.add(start), first);
            if first < bytes.len() {
                std::ptr::copy_nonoverlapping(bytes.as_ptr().add(first), data, bytes.len() - first);
            }
        }
    }

    pub fn region(&self) -> &SharedRegion {
        &self.region
    }
}

/// The consumer side of a ring. Only one `RingConsumer` should exist per
/// region.
pub struct RingConsumer {
    region: SharedRegion,
}

impl RingConsumer {
    pub fn new(region: SharedRegion) -> Self {
        Self { region }
    }

    /// Number of bytes currently available to read.
    pub fn available(&self) -> u64 {
        let wpos = self.region.wpos().load(Ordering::Acquire);
        let rpos = self.region.rpos().load(Ordering::Relaxed);
        wpos.saturating_sub(rpos)
    }

    /// Read up to `max_len` bytes, returning however many were actually
    /// available (possibly zero, possibly less than `max_len`).
    pub fn pop(&self, max_len: usize) -> Vec<u8> {
        // Acquire: pairs with the producer's Release store of wpos, so
        // the sample bytes below are guaranteed visible once we observe
        // this wpos value.
        let wpos = self.region.wpos().load(Ordering::Acquire);
        let rpos = self.region.rpos().load(Ordering::Relaxed);
        let avail = wpos.saturating_sub(rpos) as usize;
        let to_read = avail.min(max_len);
        if to_read == 0 {
            return Vec::new();
        }

        let capacity = self.region.capacity() as usize;
        let start = (rpos as usize) % capacity;
        let data = self.region.data_ptr();
        let mut out = vec![0u8; to_read];
        let first = (capacity - start).min(to_read);
        unsafe {
            std::ptr::copy_nonoverlapping(data.add(start), out.as_mut_ptr(), first);
            if first < to_read {
                std::ptr::copy_nonoverlapping(data, out.as_mut_ptr().add(first), to_read - first);
            }
        }

        let new_rpos = rpos + to_read as u64;
        self.region.rpos().store(new_rpos, Ordering::Relaxed);
        let used = self.region.wpos().load(Ordering::Relaxed).saturating_sub(new_rpos);
        self.region.used().store(used.min(capacity as u64) as u32, Ordering::Relaxed);

        out
    }

    pub fn region(&self) -> &SharedRegion {
        &self.region
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(capacity: u32) -> (RingProducer, RingConsumer) {
        let spec = RingSpec::iq(capacity, IqFormat::Cf32, 1, 48_000.0, 100_000_000.0);
        let (region, dup_fd) = SharedRegion::create("test-ring", &spec).unwrap();
        let consumer_region = SharedRegion::open(dup_fd, capacity as usize).unwrap();
        (RingProducer::new(region), RingConsumer::new(consumer_region))
    }

    #[test]
    fn header_round_trips() {
        let (prod, _cons) = pair(4096);
        assert_eq!(prod.region().magic(), MAGIC_IQ);
        assert_eq!(prod.region().version(), RING_VERSION);
        assert_eq!(prod.region().capacity(), 4096);
        assert_eq!(prod.region().bytes_per_samp(), 8);
        assert_eq!(prod.region().channels(), 1);
    }

    #[test]
    fn rejects_wrong_magic_on_inspection() {
        let (prod, _cons) = pair(4096);
        assert_ne!(prod.region().magic(), MAGIC_AUDIO);
    }

    #[test]
    fn unknown_iq_format_is_not_found_not_bad_magic() {
        let err = IqFormat::try_from(99).unwrap_err();
        assert!(matches!(err, BrokerError::NotFound(_)));
    }

    #[test]
    fn unknown_audio_format_is_not_found_not_bad_magic() {
        let err = AudioFormat::try_from(99).unwrap_err();
        assert!(matches!(err, BrokerError::NotFound(_)));
    }

    #[test]
    fn open_checked_rejects_mismatched_magic() {
        let spec = RingSpec::iq(4096, IqFormat::Cf32, 1, 48_000.0, 100_000_000.0);
        let (_region, dup_fd) = SharedRegion::create("test-ring-magic", &spec).unwrap();
        let err = SharedRegion::open_checked(dup_fd, 4096, MAGIC_AUDIO).unwrap_err();
        assert!(matches!(err, BrokerError::BadMagic { expected, got } if expected == MAGIC_AUDIO && got == MAGIC_IQ));
    }

    #[test]
    fn open_checked_accepts_matching_magic() {
        let spec = RingSpec::audio(4096, AudioFormat::F32, 1, 48_000.0);
        let (_region, dup_fd) = SharedRegion::create("test-ring-magic-ok", &spec).unwrap();
        let region = SharedRegion::open_checked(dup_fd, 4096, MAGIC_AUDIO).unwrap();
        assert_eq!(region.capacity(), 4096);
    }

    #[test]
    fn push_pop_preserves_bytes() {
        let (prod, cons) = pair(4096);
        prod.push(b"hello world");
        let got = cons.pop(64);
        assert_eq!(got, b"hello world");
    }

    #[test]
    fn byte_conservation_under_slow_consumer() {
        let (prod, cons) = pair(64);
        for i in 0..4u8 {
            prod.push(&[i; 8]);
        }
        let mut total = 0;
        loop {
            let chunk = cons.pop(16);
            if chunk.is_empty() {
                break;
            }
            total += chunk.len();
        }
        assert_eq!(total, 32);
    }

    #[test]
    fn wpos_is_monotonic() {
        let (prod, _cons) = pair(4096);
        let mut last = 0u64;
        for _ in 0..10 {
            prod.push(b"abcd");
            let now = prod.region().wpos().load(Ordering::Relaxed);
            assert!(now > last);
            last = now;
        }
    }

    #[test]
    fn overrun_advances_rpos_to_minimum_fit() {
        let (prod, cons) = pair(16);
        prod.push(&[1u8; 12]);
        // Ring has 16 bytes; 12 used, 4 free. Pushing 8 more must overrun.
        prod.push(&[2u8; 8]);
        let avail = cons.available();
        assert!(avail <= 16);
        let popped = cons.pop(64);
        // The newest 8 bytes must always be present in full.
        assert!(popped.windows(8).any(|w| w == [2u8; 8]));
    }

    #[test]
    fn pop_never_exceeds_requested_length() {
        let (prod, cons) = pair(4096);
        prod.push(&[9u8; 100]);
        let chunk = cons.pop(10);
        assert_eq!(chunk.len(), 10);
    }

    #[test]
    fn wraparound_copy_is_contiguous_logically() {
        let (prod, cons) = pair(16);
        prod.push(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let _ = cons.pop(8);
        prod.push(&[9, 10, 11, 12, 13, 14, 15, 16]);
        let got = cons.pop(8);
        assert_eq!(got, vec![9, 10, 11, 12, 13, 14, 15, 16]);
    }
}
