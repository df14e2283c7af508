//! Intel PT trace ingestion & decoding pipeline.
//!
//! Three stages: `ring` reassembles the hardware ring buffer's physical
//! wrap-around into a linear byte stream and caps the accumulated trace at a size
//! budget; `packet` walks that stream packet-by-packet, decoding `TIP` targets; `coverage`
//! folds each decoded target IP into the AFL-style bitmap.

pub mod coverage;
pub mod packet;
pub mod ring;

use crate::error::Result;

/// One thread's slice of a single trace poll. A poll returns a blob holding one
/// header per traced thread back to back; `win::WindowsIptTraceSource` splits that
/// blob into these before handing it to `ring::RingDrainer`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceHeader {
    pub thread_id: u32,
    /// Capacity of the physical ring buffer backing `trace`, in bytes.
    pub trace_size: usize,
    /// The ring's write cursor at the moment of this poll.
    pub ring_buffer_offset: usize,
    /// Full current contents of the ring (length `trace_size`).
    pub trace: Vec<u8>,
}

/// Starts, stops and polls Intel PT tracing for a single traced process, a capability
/// so ring reassembly and packet decoding can be exercised against a scripted byte
/// stream instead of a live hardware trace buffer. Enabling IPT services at the
/// machine level (`EnableAndValidateIptServices`) is a one-time, out-of-process setup
/// step and is not part of this trait.
pub trait IptTraceSource {
    /// Begins tracing the process for this run, per iteration.
    fn start(&self) -> Result<()>;

    /// Ends tracing for this run. Called once the fuzz method returns, crashes, or the
    /// iteration times out, before the next iteration's `start`.
    fn stop(&self) -> Result<()>;

    /// Polls the driver for the current state of every traced thread's ring buffer.
    /// Returns one `TraceHeader` per thread known to the tracer; the caller filters by
    /// `fuzz_thread_id` (other threads' headers are ignored).
    fn poll(&self) -> Result<Vec<TraceHeader>>;
}

#[cfg(windows)]
pub mod win {
    use super::*;
    use crate::error::EngineError;
    use winapi::um::winnt::HANDLE;

    /// Configuration passed to `StartProcessIptTracing`: an option-struct version tag
    /// plus the ring buffer size and trace-flag bits. The exact field layout of a real
    /// IPT tracing driver's options header is vendor-specific, so this is a
    /// best-effort reconstruction of the shape such a header takes; see DESIGN.md.
    #[repr(C)]
    #[derive(Copy, Clone)]
    pub struct IptOptions {
        pub option_version: u32,
        pub trace_buffer_size: u32,
        pub trace_flags: u32,
    }

    impl Default for IptOptions {
        fn default() -> Self {
            // 1 MiB, matching the original harness's TRACE_BUFFER_SIZE default exactly
            // (1,048,576 bytes).
            IptOptions { option_version: 1, trace_buffer_size: 1024 * 1024, trace_flags: 0 }
        }
    }

    extern "system" {
        fn StartProcessIptTracing(process_handle: HANDLE, options: IptOptions) -> i32;
        fn StopProcessIptTracing(process_handle: HANDLE) -> i32;
        fn GetIptTrace(process_handle: HANDLE, out_len: *mut u32) -> *mut u8;
        fn FreeIptTrace(data: *mut u8);
    }

    /// Fixed-size prefix of one trace-poll blob entry: thread id, ring capacity, and
    /// current write cursor, followed by the ring's raw bytes. Never instantiated
    /// directly; `memoffset::offset_of!` reads its field layout so `split_headers`
    /// doesn't hardcode offsets that would silently drift if a field were reordered.
    #[repr(C)]
    struct RawTraceHeaderFields {
        thread_id: u32,
        trace_size: u32,
        ring_buffer_offset: u32,
        _reserved: u32,
    }

    const TRACE_HEADER_FIXED_LEN: usize = std::mem::size_of::<RawTraceHeaderFields>();
    const THREAD_ID_OFFSET: usize = memoffset::offset_of!(RawTraceHeaderFields, thread_id);
    const TRACE_SIZE_OFFSET: usize = memoffset::offset_of!(RawTraceHeaderFields, trace_size);
    const RING_OFFSET_OFFSET: usize = memoffset::offset_of!(RawTraceHeaderFields, ring_buffer_offset);

    /// Splits one trace-poll blob into its back-to-back per-thread headers, walking
    /// each header's fixed prefix plus its declared trace size to find the next one.
    fn split_headers(blob: &[u8]) -> Vec<TraceHeader> {
        let mut headers = Vec::new();
        let mut offset = 0usize;
        while offset + TRACE_HEADER_FIXED_LEN <= blob.len() {
            let thread_id = u32::from_le_bytes(
                blob[offset + THREAD_ID_OFFSET..offset + THREAD_ID_OFFSET + 4].try_into().unwrap(),
            );
            let trace_size = u32::from_le_bytes(
                blob[offset + TRACE_SIZE_OFFSET..offset + TRACE_SIZE_OFFSET + 4].try_into().unwrap(),
            ) as usize;
            let ring_buffer_offset = u32::from_le_bytes(
                blob[offset + RING_OFFSET_OFFSET..offset + RING_OFFSET_OFFSET + 4].try_into().unwrap(),
            ) as usize;

            let trace_start = offset + TRACE_HEADER_FIXED_LEN;
            let trace_end = trace_start + trace_size;
            if trace_end > blob.len() {
                break;
            }
            headers.push(TraceHeader {
                thread_id,
                trace_size,
                ring_buffer_offset,
                trace: blob[trace_start..trace_end].to_vec(),
            });
            offset = trace_end;
        }
        headers
    }

    pub struct WindowsIptTraceSource {
        pub process_handle: HANDLE,
        pub options: IptOptions,
    }

    unsafe impl Send for WindowsIptTraceSource {}

    impl IptTraceSource for WindowsIptTraceSource {
        fn start(&self) -> Result<()> {
            let ok = unsafe { StartProcessIptTracing(self.process_handle, self.options) };
            if ok == 0 {
                return Err(EngineError::IptUnavailable);
            }
            Ok(())
        }

        fn stop(&self) -> Result<()> {
            let ok = unsafe { StopProcessIptTracing(self.process_handle) };
            if ok == 0 {
                return Err(EngineError::IptUnavailable);
            }
            Ok(())
        }

        fn poll(&self) -> Result<Vec<TraceHeader>> {
            let mut len: u32 = 0;
            let ptr = unsafe { GetIptTrace(self.process_handle, &mut len) };
            if ptr.is_null() {
                return Err(EngineError::IptUnavailable);
            }
            let blob = unsafe { std::slice::from_raw_parts(ptr, len as usize) }.to_vec();
            unsafe { FreeIptTrace(ptr) };
            Ok(split_headers(&blob))
        }
    }
}


#[cfg(test)]
mod tests {
    use super::mock::ScriptedIptTraceSource;
    use super::ring::{RingDrainer, TraceAccumulator};
    use super::*;

    #[test]
    fn poll_then_drain_round_trips_through_ring_state() {
        let source = ScriptedIptTraceSource::new();
        source.queue_poll(vec![TraceHeader {
            thread_id: 7,
            trace_size: 8,
            ring_buffer_offset: 4,
            trace: b"ABCDEFGH".to_vec(),
        }]);

        let mut drainer = RingDrainer::new();
        let mut acc = TraceAccumulator::new(1024);

        source.start().unwrap();
        let headers = source.poll().unwrap();
        drainer.drain(&headers, 7, &mut acc);
        source.stop().unwrap();

        assert_eq!(acc.bytes(), b"ABCD");
        assert_eq!(source.start_count(), 1);
        assert_eq!(source.stop_count(), 1);
    }

    #[test]
    fn poll_with_no_queued_data_returns_empty() {
        let source = ScriptedIptTraceSource::new();
        assert!(source.poll().unwrap().is_empty());
    }
}
