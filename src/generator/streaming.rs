//! Streaming generator: a ring of backend buffers pumped by a background
//! decode worker.
//!
//! The worker decodes one chunk at a time into a buffer popped from the
//! `free` set and marshals a small job onto the audio thread that uploads
//! the PCM and publishes the buffer into `filled`. The consuming voice
//! queues `filled` buffers on its source and recycles processed ones back
//! into `free`. Counting the buffer a producer currently holds as
//! in-flight, `|free| + |filled| + in-flight + queued-on-source` equals the
//! ring size at all times.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::backend::{BufferHandle, PcmFormat};
use crate::dispatch::JobSender;
use crate::error::{Result, SonaraError};

use super::decoder::Decoder;

const IDLE_SLEEP: Duration = Duration::from_millis(2);
const GATE_POLL: Duration = Duration::from_millis(10);

#[derive(Default)]
struct BufferSets {
    free: Vec<BufferHandle>,
    filled: VecDeque<BufferHandle>,
    /// Buffers popped from `free` by the producer and not yet published to
    /// `filled` (or returned). `|free| + |filled| + in_flight + queued`
    /// equals the ring size at all times.
    in_flight: usize,
}

struct StreamShared {
    sets: Mutex<BufferSets>,
    /// Pause gate for the producer; held closed during seeks.
    paused: Mutex<bool>,
    gate: Condvar,
    end_of_stream: AtomicBool,
    looping: AtomicBool,
    cancel: AtomicBool,
    /// Bumped on every seek; in-flight upload jobs from before the seek
    /// return their buffer to `free` instead of publishing stale data.
    epoch: AtomicU64,
}

impl StreamShared {
    fn new() -> Self {
        Self {
            sets: Mutex::new(BufferSets::default()),
            paused: Mutex::new(false),
            gate: Condvar::new(),
            end_of_stream: AtomicBool::new(false),
            looping: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
        }
    }

    fn canceled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Block while the pause gate is closed; returns false once canceled.
    fn wait_gate(&self) -> bool {
        let mut paused = self.paused.lock().unwrap();
        while *paused {
            if self.canceled() {
                return false;
            }
            let (guard, _) = self.gate.wait_timeout(paused, GATE_POLL).unwrap();
            paused = guard;
        }
        !self.canceled()
    }
}

pub(crate) struct StreamingSound {
    shared: Arc<StreamShared>,
    decoder: Arc<Mutex<Box<dyn Decoder>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    buffer_count: usize,
    can_seek: bool,
}

impl StreamingSound {
    /// Create the ring and spawn the producer. Buffer handles are created
    /// by a deferred job since only the audio thread may touch the backend;
    /// until it runs the producer idles on an empty `free` set.
    pub fn spawn(
        jobs: &JobSender,
        decoder: Box<dyn Decoder>,
        buffer_count: usize,
        chunk_frames: usize,
    ) -> Self {
        let format = decoder.format();
        let can_seek = decoder.can_seek();
        let shared = Arc::new(StreamShared::new());
        let decoder = Arc::new(Mutex::new(decoder));

        let init_shared = shared.clone();
        jobs.post(move |core| {
            let mut sets = init_shared.sets.lock().unwrap();
            for _ in 0..buffer_count {
                sets.free.push(core.backend.create_buffer()?);
            }
            Ok(())
        });

        let worker_shared = shared.clone();
        let worker_decoder = decoder.clone();
        let worker_jobs = jobs.clone();
        let worker = std::thread::Builder::new()
            .name("sonara-stream".to_string())
            .spawn(move || {
                producer_loop(
                    worker_shared,
                    worker_decoder,
                    worker_jobs,
                    format,
                    chunk_frames,
                );
            })
            .ok();
        if worker.is_none() {
            log::error!("failed to spawn streaming decode worker");
        }

        Self {
            shared,
            decoder,
            worker: Mutex::new(worker),
            buffer_count,
            can_seek,
        }
    }

    pub fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    pub fn can_seek(&self) -> bool {
        self.can_seek
    }

    pub fn end_of_stream(&self) -> bool {
        self.shared.end_of_stream.load(Ordering::Acquire)
    }

    pub fn set_looping(&self, looping: bool) {
        self.shared.looping.store(looping, Ordering::Release);
    }

    /// Pop the oldest filled buffer for queueing on a source.
    pub fn take_filled(&self) -> Option<BufferHandle> {
        self.shared.sets.lock().unwrap().filled.pop_front()
    }

    /// Return a buffer to the free set after the source processed it (or
    /// after it was unqueued on disconnect).
    pub fn release_buffer(&self, buffer: BufferHandle) {
        self.shared.sets.lock().unwrap().free.push(buffer);
    }

    /// Free, filled and in-flight counts, sampled consistently.
    pub fn counts(&self) -> (usize, usize, usize) {
        let sets = self.shared.sets.lock().unwrap();
        (sets.free.len(), sets.filled.len(), sets.in_flight)
    }

    /// Reposition the stream: pause the producer, recycle filled buffers,
    /// clear end-of-stream, seek the decoder, resume.
    pub fn seek(&self, seconds: f64) -> Result<()> {
        if !self.can_seek {
            return Err(SonaraError::Unsupported(
                "stream is not seekable".to_string(),
            ));
        }

        *self.shared.paused.lock().unwrap() = true;
        // Serializes against an in-flight decode; bumping the epoch retires
        // any upload job it already posted.
        let mut decoder = self.decoder.lock().unwrap();
        self.shared.epoch.fetch_add(1, Ordering::AcqRel);
        {
            let mut sets = self.shared.sets.lock().unwrap();
            let drained: Vec<BufferHandle> = sets.filled.drain(..).collect();
            sets.free.extend(drained);
        }
        self.shared.end_of_stream.store(false, Ordering::Release);
        let result = decoder.seek(seconds);
        drop(decoder);

        *self.shared.paused.lock().unwrap() = false;
        self.shared.gate.notify_all();
        result
    }

    /// Stop the producer and wait for it to exit. Idempotent.
    pub fn shutdown(&self) {
        self.shared.cancel.store(true, Ordering::Release);
        self.shared.gate.notify_all();
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }

    /// Schedule destruction of the ring's buffers. Must run after
    /// [`StreamingSound::shutdown`]: the destroy job drains the sets when it
    /// executes, which the FIFO places after any upload job the producer
    /// already posted.
    pub fn post_destroy(&self, jobs: &JobSender) {
        let shared = self.shared.clone();
        jobs.post(move |core| {
            let mut sets = shared.sets.lock().unwrap();
            let mut buffers: Vec<BufferHandle> = sets.free.drain(..).collect();
            buffers.extend(sets.filled.drain(..));
            drop(sets);
            for buffer in buffers {
                core.backend.destroy_buffer(buffer);
            }
            Ok(())
        });
    }
}

impl Drop for StreamingSound {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn producer_loop(
    shared: Arc<StreamShared>,
    decoder: Arc<Mutex<Box<dyn Decoder>>>,
    jobs: JobSender,
    format: PcmFormat,
    chunk_frames: usize,
) {
    let channels = format.channels.max(1) as usize;

    while !shared.canceled() {
        if !shared.wait_gate() {
            break;
        }
        if shared.end_of_stream.load(Ordering::Acquire) {
            // Drained; a seek clears the flag and reopens the gate.
            std::thread::sleep(IDLE_SLEEP);
            continue;
        }

        let buffer = {
            let mut sets = shared.sets.lock().unwrap();
            match sets.free.pop() {
                Some(buffer) => {
                    sets.in_flight += 1;
                    buffer
                }
                None => {
                    drop(sets);
                    std::thread::sleep(IDLE_SLEEP);
                    continue;
                }
            }
        };

        let mut chunk = vec![0.0f32; chunk_frames * channels];
        let epoch = shared.epoch.load(Ordering::Acquire);
        let decoded = decoder.lock().unwrap().decode(&mut chunk);

        match decoded {
            Ok(frames) if frames > 0 => {
                chunk.truncate(frames * channels);
                let upload_shared = shared.clone();
                jobs.post(move |core| {
                    if upload_shared.epoch.load(Ordering::Acquire) != epoch {
                        // Stale chunk from before a seek.
                        let mut sets = upload_shared.sets.lock().unwrap();
                        sets.free.push(buffer);
                        sets.in_flight -= 1;
                        return Ok(());
                    }
                    let uploaded = core.backend.upload(buffer, &format, &chunk);
                    let mut sets = upload_shared.sets.lock().unwrap();
                    if uploaded.is_ok() {
                        sets.filled.push_back(buffer);
                    } else {
                        sets.free.push(buffer);
                    }
                    sets.in_flight -= 1;
                    uploaded
                });
            }
            Ok(_) => {
                // End of the material.
                let looping = shared.looping.load(Ordering::Acquire);
                let rewound = looping
                    && decoder
                        .lock()
                        .unwrap()
                        .seek(0.0)
                        .map_err(|e| log::warn!("loop rewind failed: {}", e))
                        .is_ok();
                {
                    let mut sets = shared.sets.lock().unwrap();
                    sets.free.push(buffer);
                    sets.in_flight -= 1;
                }
                if !rewound {
                    shared.end_of_stream.store(true, Ordering::Release);
                }
            }
            Err(e) => {
                // Mark end-of-stream so consuming voices drain and stop.
                log::error!("streaming decode failed: {}", e);
                {
                    let mut sets = shared.sets.lock().unwrap();
                    sets.free.push(buffer);
                    sets.in_flight -= 1;
                }
                shared.end_of_stream.store(true, Ordering::Release);
            }
        }
    }
}
